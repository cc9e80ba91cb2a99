use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientFrame, ServerFrame};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// Lifecycle of the live transport. A connection never leaves AuthFailed or
/// Disconnected on its own; recovery means opening a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    AuthFailed,
}

/// Rejection texts that mark the credential itself as invalid, as opposed
/// to a transient transport failure.
pub(crate) fn is_credential_rejection(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("invalid token") || message.contains("authentication error")
}

fn websocket_url(base_url: &str, token: &str) -> Result<String> {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(anyhow!("server url must start with http:// or https://"));
    };
    Ok(format!("{}/ws?token={token}", ws_base.trim_end_matches('/')))
}

/// One open websocket. Inbound frames are decoded here and forwarded in
/// wire order; outbound frames go through an unbounded queue drained by a
/// dedicated writer task.
pub(crate) struct Connection {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    state_tx: watch::Sender<ConnectionState>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Connection {
    pub(crate) async fn open(
        base_url: &str,
        token: &str,
        frame_tx: mpsc::UnboundedSender<ServerFrame>,
    ) -> Result<Arc<Self>> {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let url = websocket_url(base_url, token)?;
        let (stream, _) = connect_async(&url)
            .await
            .context("failed to open live transport")?;
        state_tx.send_replace(ConnectionState::Connected);
        let (mut writer, mut reader) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("failed to encode outbound frame: {err}");
                        continue;
                    }
                };
                if writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        let reader_state = state_tx.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => {
                            if let ServerFrame::ConnectError { message } = &frame {
                                if is_credential_rejection(message) {
                                    reader_state.send_replace(ConnectionState::AuthFailed);
                                }
                            }
                            if frame_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(err) => debug!("discarding malformed frame: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("live transport receive failed: {err}");
                        break;
                    }
                }
            }
            if *reader_state.borrow() != ConnectionState::AuthFailed {
                reader_state.send_replace(ConnectionState::Disconnected);
            }
        });

        Ok(Arc::new(Self {
            outbound,
            state_tx,
            tasks: Mutex::new(Some((reader_task, writer_task))),
        }))
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn send(&self, frame: ClientFrame) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(anyhow!("live transport is not connected"));
        }
        self.outbound
            .send(frame)
            .map_err(|_| anyhow!("live transport writer is gone"))
    }

    /// Tears the connection down. Safe to call more than once; after the
    /// first call no further frames are delivered.
    pub(crate) async fn close(&self) {
        let Some((reader_task, writer_task)) = self.tasks.lock().await.take() else {
            return;
        };
        reader_task.abort();
        writer_task.abort();
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Connection backed by a bare queue instead of a socket, for driving
    /// the engine without a live backend.
    #[cfg(test)]
    pub(crate) fn stub(outbound: mpsc::UnboundedSender<ClientFrame>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        Arc::new(Self {
            outbound,
            state_tx,
            tasks: Mutex::new(None),
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
