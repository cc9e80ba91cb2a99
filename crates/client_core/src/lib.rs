use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use reqwest::{Client, StatusCode};
use shared::domain::{MessageId, PresenceEntry, UserId};
use shared::protocol::{ClientFrame, MessageRecord, ServerFrame};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod error;
pub mod presence;
pub mod session;
pub mod store;
pub mod transport;

pub use error::ChatError;
pub use session::{
    CredentialStore, FileCredentialStore, LocalIdentity, MemoryCredentialStore, SessionGate,
    SessionState,
};
pub use store::{ChannelKey, ChatMessage, MessageStore, Reaction};
pub use transport::ConnectionState;

use presence::PresenceTracker;
use transport::Connection;

/// Idle window after which a typing indicator clears itself, and after
/// which an unconfirmed send stops blocking the next one.
const TYPING_IDLE: Duration = Duration::from_secs(1);
const SEND_LOCK_WINDOW: Duration = Duration::from_secs(1);

/// State changes the engine fans out to whoever renders them.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    MessagesUpdated { channel: ChannelKey },
    PresenceUpdated { users: Vec<PresenceEntry> },
    TypingStarted { username: String },
    TypingStopped,
    ChatCleared,
    ConnectionChanged(ConnectionState),
    SessionInvalidated,
    Error(String),
}

struct SendLock {
    local_id: Uuid,
    locked_until: Instant,
}

#[derive(Default)]
struct EngineState {
    store: MessageStore,
    presence: PresenceTracker,
    connection: Option<Arc<Connection>>,
    send_lock: Option<SendLock>,
    history_loaded: bool,
    stop_typing_timer: Option<JoinHandle<()>>,
}

/// The synchronization engine: one authenticated session, at most one live
/// connection, and the message and presence state both feed. All mutable
/// state sits behind a single lock; inbound frames are applied one at a
/// time in arrival order.
pub struct ChatClient {
    http: Client,
    base_url: String,
    session: SessionGate,
    inner: Mutex<EngineState>,
    events: broadcast::Sender<ClientEvent>,
}

fn route_channel(record: &MessageRecord, local_user: UserId) -> ChannelKey {
    match record.recipient_id {
        None => ChannelKey::Public,
        Some(recipient) if record.sender_id == local_user => ChannelKey::Private(recipient),
        Some(_) => ChannelKey::Private(record.sender_id),
    }
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>, credentials: Arc<dyn CredentialStore>) -> Arc<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = Client::new();
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            session: SessionGate::new(http.clone(), base_url.clone(), credentials),
            http,
            base_url,
            inner: Mutex::new(EngineState::default()),
            events,
        })
    }

    pub fn session(&self) -> &SessionGate {
        &self.session
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn validate_session(&self) -> Result<SessionState> {
        self.session.validate().await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LocalIdentity> {
        self.session.login(username, password).await
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<()> {
        self.session.register(username, password).await
    }

    /// Ends the session: closes the transport, notifies the backend and
    /// drops all cached chat state.
    pub async fn logout(&self) -> Result<()> {
        self.disconnect().await;
        self.session.logout().await?;
        let mut inner = self.inner.lock().await;
        inner.store = MessageStore::default();
        inner.history_loaded = false;
        inner.send_lock = None;
        Ok(())
    }

    fn identity(&self) -> Result<LocalIdentity> {
        match self.session.state() {
            SessionState::Authenticated(identity) => Ok(identity),
            SessionState::Unauthenticated => Err(anyhow!("not authenticated")),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner
            .lock()
            .await
            .connection
            .as_ref()
            .map(|c| c.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub async fn messages(&self, channel: ChannelKey) -> Vec<ChatMessage> {
        self.inner.lock().await.store.messages(channel).to_vec()
    }

    pub async fn online_users(&self) -> Vec<PresenceEntry> {
        self.inner.lock().await.presence.online().to_vec()
    }

    pub async fn typing_users(&self) -> Vec<String> {
        self.inner.lock().await.presence.typing_users()
    }

    /// Opens the live transport and kicks off the history fetch. The fetch
    /// races live frames on purpose; idempotent appends absorb the overlap.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let identity = self.identity()?;
        let token = self
            .session
            .credential()
            .await?
            .ok_or(ChatError::CredentialInvalid)?;

        self.disconnect().await;

        let _ = self
            .events
            .send(ClientEvent::ConnectionChanged(ConnectionState::Connecting));
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let connection = match Connection::open(&self.base_url, &token, frame_tx).await {
            Ok(connection) => connection,
            Err(err) => {
                let _ = self
                    .events
                    .send(ClientEvent::ConnectionChanged(ConnectionState::Disconnected));
                return Err(ChatError::TransportUnavailable(err.to_string()).into());
            }
        };

        self.inner.lock().await.connection = Some(connection);
        let _ = self
            .events
            .send(ClientEvent::ConnectionChanged(ConnectionState::Connected));

        // Frame pump: one frame applied to completion at a time, in the
        // order the wire delivered them.
        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                client.handle_frame(frame).await;
            }
            let state = client.connection_state().await;
            let _ = client.events.send(ClientEvent::ConnectionChanged(state));
        });

        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = client.load_history().await {
                match err.downcast_ref::<ChatError>() {
                    Some(ChatError::CredentialInvalid) => client.force_unauthenticated().await,
                    _ => {
                        warn!("history fetch failed: {err:#}");
                        let _ = client
                            .events
                            .send(ClientEvent::Error(format!("history fetch failed: {err}")));
                    }
                }
            }
        });

        info!(user_id = identity.user_id.0, "live transport connected");
        Ok(())
    }

    /// Closes the live transport if one is open. Further calls are no-ops.
    pub async fn disconnect(&self) {
        let connection = {
            let mut inner = self.inner.lock().await;
            inner.presence.reset();
            inner.send_lock = None;
            if let Some(timer) = inner.stop_typing_timer.take() {
                timer.abort();
            }
            inner.connection.take()
        };
        if let Some(connection) = connection {
            connection.close().await;
            let _ = self
                .events
                .send(ClientEvent::ConnectionChanged(ConnectionState::Disconnected));
        }
    }

    /// Sends a message optimistically. Returns the local id of the inserted
    /// entry, or None when nothing was transmitted: empty content, no live
    /// connection, or a previous send still inside its confirmation window.
    pub async fn send_message(
        &self,
        content: &str,
        recipient: Option<UserId>,
    ) -> Result<Option<Uuid>> {
        let content = content.trim();
        if content.is_empty() {
            return Ok(None);
        }
        let identity = self.identity()?;

        let mut inner = self.inner.lock().await;
        let Some(connection) = inner.connection.clone() else {
            debug!("send skipped: live transport not open");
            return Ok(None);
        };
        if connection.state() != ConnectionState::Connected {
            debug!("send skipped: live transport not connected");
            return Ok(None);
        }
        if let Some(lock) = &inner.send_lock {
            if Instant::now() < lock.locked_until {
                debug!("send refused: previous send still unconfirmed");
                return Ok(None);
            }
        }

        let local_id = Uuid::new_v4();
        let channel = recipient
            .map(ChannelKey::Private)
            .unwrap_or(ChannelKey::Public);
        inner.store.append(
            channel,
            ChatMessage {
                local_id: Some(local_id),
                server_id: None,
                sender_id: identity.user_id,
                sender_name: identity.username,
                content: content.to_string(),
                created_at: Utc::now(),
                reactions: Vec::new(),
            },
        );
        inner.send_lock = Some(SendLock {
            local_id,
            locked_until: Instant::now() + SEND_LOCK_WINDOW,
        });

        // At-least-once boundary: the optimistic entry stays even when the
        // transmission fails, so nothing typed is silently lost.
        if let Err(err) = connection.send(ClientFrame::Message {
            id: local_id,
            content: content.to_string(),
            recipient_id: recipient,
        }) {
            warn!("send transmission failed: {err}");
            let _ = self
                .events
                .send(ClientEvent::Error(format!("message send failed: {err}")));
        }
        drop(inner);

        let _ = self.events.send(ClientEvent::MessagesUpdated { channel });
        Ok(Some(local_id))
    }

    /// Emits a reaction for a confirmed message. A no-op while disconnected.
    pub async fn react(&self, message_id: MessageId, reaction: &str) -> Result<()> {
        let Some(connection) = self.inner.lock().await.connection.clone() else {
            return Ok(());
        };
        if connection.state() != ConnectionState::Connected {
            return Ok(());
        }
        connection.send(ClientFrame::React {
            message_id,
            reaction: reaction.to_string(),
        })
    }

    /// Signals that the local user is typing. Re-arms the outbound stop
    /// notice so the other side sees a stop one idle window after the last
    /// keystroke. A no-op while disconnected.
    pub async fn notify_typing(&self, recipient: Option<UserId>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(connection) = inner.connection.clone() else {
            return Ok(());
        };
        if connection.state() != ConnectionState::Connected {
            return Ok(());
        }
        connection.send(ClientFrame::Typing {
            recipient_id: recipient,
        })?;

        if let Some(previous) = inner.stop_typing_timer.take() {
            previous.abort();
        }
        inner.stop_typing_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(TYPING_IDLE).await;
            let _ = connection.send(ClientFrame::StopTyping {
                recipient_id: recipient,
            });
        }));
        Ok(())
    }

    pub async fn join_room(&self, room: &str) -> Result<()> {
        let Some(connection) = self.inner.lock().await.connection.clone() else {
            return Ok(());
        };
        if connection.state() != ConnectionState::Connected {
            return Ok(());
        }
        connection.send(ClientFrame::JoinRoom {
            room: room.to_string(),
        })
    }

    /// Asks the backend to wipe the public channel. The local wipe arrives
    /// through the resulting chat-cleared broadcast.
    pub async fn clear_public_history(&self) -> Result<()> {
        let token = self
            .session
            .credential()
            .await?
            .ok_or(ChatError::CredentialInvalid)?;
        self.http
            .delete(format!("{}/messages/public", self.base_url))
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Fetches the full message history and merges it into the store. Runs
    /// at most once per session.
    async fn load_history(&self) -> Result<()> {
        if self.inner.lock().await.history_loaded {
            return Ok(());
        }
        let token = self
            .session
            .credential()
            .await?
            .ok_or(ChatError::CredentialInvalid)?;
        let response = self
            .http
            .get(format!("{}/messages", self.base_url))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|err| ChatError::FetchFailed(err.to_string()))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ChatError::CredentialInvalid.into());
        }
        if !status.is_success() {
            return Err(ChatError::FetchFailed(format!("unexpected status {status}")).into());
        }
        let records: Vec<MessageRecord> = response
            .json()
            .await
            .map_err(|err| ChatError::FetchFailed(err.to_string()))?;
        let identity = self.identity()?;

        let mut touched = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            for record in &records {
                let channel = route_channel(record, identity.user_id);
                if inner.store.append(channel, ChatMessage::from_record(record))
                    && !touched.contains(&channel)
                {
                    touched.push(channel);
                }
            }
            inner.history_loaded = true;
        }
        for channel in touched {
            let _ = self.events.send(ClientEvent::MessagesUpdated { channel });
        }
        debug!(count = records.len(), "message history merged");
        Ok(())
    }

    async fn handle_frame(self: &Arc<Self>, frame: ServerFrame) {
        match frame {
            ServerFrame::Message(record) => self.handle_message(record).await,
            ServerFrame::OnlineUsers(users) => {
                let snapshot = {
                    let mut inner = self.inner.lock().await;
                    inner.presence.replace_online(users);
                    inner.presence.online().to_vec()
                };
                let _ = self
                    .events
                    .send(ClientEvent::PresenceUpdated { users: snapshot });
            }
            ServerFrame::ChatCleared => {
                self.inner.lock().await.store.clear(ChannelKey::Public);
                let _ = self.events.send(ClientEvent::ChatCleared);
            }
            ServerFrame::Typing(username) => self.handle_typing(username).await,
            ServerFrame::StopTyping => {
                let cleared = self.inner.lock().await.presence.clear_all_typing();
                if cleared {
                    let _ = self.events.send(ClientEvent::TypingStopped);
                }
            }
            ServerFrame::NewReaction {
                message_id,
                reaction,
                username,
            } => {
                let attached = self.inner.lock().await.store.attach_reaction(
                    message_id,
                    Reaction {
                        username,
                        symbol: reaction,
                    },
                );
                match attached {
                    Some(channel) => {
                        let _ = self.events.send(ClientEvent::MessagesUpdated { channel });
                    }
                    None => debug!(
                        message_id = message_id.0,
                        "dropping reaction for unknown message"
                    ),
                }
            }
            ServerFrame::ConnectError { message } => {
                if transport::is_credential_rejection(&message) {
                    warn!("live transport rejected the credential: {message}");
                    let _ = self
                        .events
                        .send(ClientEvent::ConnectionChanged(ConnectionState::AuthFailed));
                    self.force_unauthenticated().await;
                } else {
                    let _ = self
                        .events
                        .send(ClientEvent::Error(format!("live transport error: {message}")));
                }
            }
        }
    }

    async fn handle_message(&self, record: MessageRecord) {
        let Ok(identity) = self.identity() else {
            return;
        };
        let channel = route_channel(&record, identity.user_id);
        let updated = {
            let mut inner = self.inner.lock().await;
            if let Some(local_id) = record.local_id {
                if inner
                    .send_lock
                    .as_ref()
                    .is_some_and(|lock| lock.local_id == local_id)
                {
                    inner.send_lock = None;
                }
            }
            match record
                .local_id
                .filter(|local_id| inner.store.contains_local(channel, *local_id))
            {
                Some(local_id) => inner.store.reconcile(channel, local_id, record.id),
                None => inner
                    .store
                    .append(channel, ChatMessage::from_record(&record)),
            }
        };
        if updated {
            let _ = self.events.send(ClientEvent::MessagesUpdated { channel });
        }
    }

    async fn handle_typing(self: &Arc<Self>, username: String) {
        let timer = {
            let client = Arc::clone(self);
            let user = username.clone();
            tokio::spawn(async move {
                tokio::time::sleep(TYPING_IDLE).await;
                let cleared = client.inner.lock().await.presence.clear_typing(&user);
                if cleared {
                    let _ = client.events.send(ClientEvent::TypingStopped);
                }
            })
        };
        self.inner
            .lock()
            .await
            .presence
            .set_typing(&username, timer);
        let _ = self.events.send(ClientEvent::TypingStarted { username });
    }

    /// Forced sign-out: the backend said the credential is no longer valid,
    /// so drop it, tear the transport down and tell the renderer.
    async fn force_unauthenticated(&self) {
        if let Err(err) = self.session.invalidate().await {
            warn!("failed to drop rejected credential: {err:#}");
        }
        self.disconnect().await;
        self.inner.lock().await.history_loaded = false;
        let _ = self.events.send(ClientEvent::SessionInvalidated);
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
