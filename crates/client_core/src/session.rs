use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use reqwest::Client;
use serde::Deserialize;
use shared::domain::UserId;
use shared::protocol::{ErrorBody, LoginRequest, RegisterRequest, TokenResponse};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

/// Identity carried in the credential's payload segment. Decoded locally so
/// optimistic sends can be attributed before the backend confirms them; the
/// backend stays the authority on who the token belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Authenticated(LocalIdentity),
    Unauthenticated,
}

/// One durable slot holding the bearer credential.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<String>>;
    async fn store(&self, token: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// Credential slot backed by a single file on disk.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => {
                let token = raw.trim();
                if token.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(token.to_string()))
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| {
                format!("failed to read credential file {}", self.path.display())
            }),
        }
    }

    async fn store(&self, token: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&self.path, token).with_context(|| {
            format!("failed to write credential file {}", self.path.display())
        })
    }

    async fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!("failed to remove credential file {}", self.path.display())
            }),
        }
    }
}

/// In-memory credential slot.
#[derive(Default)]
pub struct MemoryCredentialStore {
    slot: std::sync::Mutex<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            slot: std::sync::Mutex::new(Some(token.into())),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<String>> {
        Ok(self.slot.lock().map_err(|_| anyhow!("credential slot poisoned"))?.clone())
    }

    async fn store(&self, token: &str) -> Result<()> {
        *self.slot.lock().map_err(|_| anyhow!("credential slot poisoned"))? =
            Some(token.to_string());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.slot.lock().map_err(|_| anyhow!("credential slot poisoned"))? = None;
        Ok(())
    }
}

#[derive(Deserialize)]
struct TokenClaims {
    #[serde(alias = "userId", alias = "user_id")]
    id: i64,
    username: String,
}

/// Decodes the identity embedded in a bearer token. The signature segment is
/// not verified here; a forged token fails at the backend instead.
pub(crate) fn decode_identity(token: &str) -> Result<LocalIdentity> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| anyhow!("credential is not a three-segment token"))?;
    let raw = URL_SAFE_NO_PAD
        .decode(payload)
        .context("credential payload is not valid base64")?;
    let claims: TokenClaims =
        serde_json::from_slice(&raw).context("credential payload is not valid claims json")?;
    Ok(LocalIdentity {
        user_id: UserId(claims.id),
        username: claims.username,
    })
}

/// Gatekeeper between stored credentials and an authenticated session.
/// Validation happens at most once per credential value; the memoized
/// outcome is reused until the credential changes.
pub struct SessionGate {
    http: Client,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
    state_tx: watch::Sender<SessionState>,
    last_outcome: Mutex<Option<(String, SessionState)>>,
}

impl SessionGate {
    pub fn new(http: Client, base_url: String, credentials: Arc<dyn CredentialStore>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Unauthenticated);
        Self {
            http,
            base_url,
            credentials,
            state_tx,
            last_outcome: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub async fn credential(&self) -> Result<Option<String>> {
        self.credentials.load().await
    }

    /// Resolves the session state for the currently stored credential. With
    /// no credential stored this settles immediately without touching the
    /// network. A rejected or unreachable probe clears the stored credential.
    pub async fn validate(&self) -> Result<SessionState> {
        let Some(token) = self.credentials.load().await? else {
            self.state_tx.send_replace(SessionState::Unauthenticated);
            return Ok(SessionState::Unauthenticated);
        };

        // Holding the memo lock across the probe keeps concurrent callers
        // from validating the same credential twice.
        let mut memo = self.last_outcome.lock().await;
        if let Some((checked, outcome)) = memo.as_ref() {
            if *checked == token {
                return Ok(outcome.clone());
            }
        }

        let outcome = match self.probe(&token).await {
            Ok(()) => match decode_identity(&token) {
                Ok(identity) => SessionState::Authenticated(identity),
                Err(err) => {
                    warn!("stored credential is undecodable: {err:#}");
                    self.credentials.clear().await?;
                    SessionState::Unauthenticated
                }
            },
            Err(err) => {
                info!("stored credential failed validation: {err:#}");
                self.credentials.clear().await?;
                SessionState::Unauthenticated
            }
        };

        *memo = Some((token, outcome.clone()));
        self.state_tx.send_replace(outcome.clone());
        Ok(outcome)
    }

    async fn probe(&self, token: &str) -> Result<()> {
        self.http
            .get(format!("{}/messages", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .context("validation probe failed to reach the backend")?
            .error_for_status()
            .context("validation probe was rejected")?;
        Ok(())
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LocalIdentity> {
        let response = self
            .http
            .post(format!("{}/api/auth/login", self.base_url))
            .json(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await
            .context("login request failed to reach the backend")?;

        if !response.status().is_success() {
            let message = response
                .json::<ErrorBody>()
                .await
                .map(|body| body.message)
                .unwrap_or_else(|_| "login failed".to_string());
            return Err(anyhow!(message));
        }

        let body: TokenResponse = response.json().await.context("login response malformed")?;
        let identity = decode_identity(&body.token)?;
        self.credentials.store(&body.token).await?;

        let state = SessionState::Authenticated(identity.clone());
        *self.last_outcome.lock().await = Some((body.token, state.clone()));
        self.state_tx.send_replace(state);
        info!(user_id = identity.user_id.0, "logged in");
        Ok(identity)
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/api/auth/register", self.base_url))
            .json(&RegisterRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await
            .context("registration request failed to reach the backend")?;

        if !response.status().is_success() {
            let message = response
                .json::<ErrorBody>()
                .await
                .map(|body| body.message)
                .unwrap_or_else(|_| "registration failed".to_string());
            return Err(anyhow!(message));
        }
        Ok(())
    }

    /// Ends the session. The backend call is best effort; local state is
    /// dropped regardless.
    pub async fn logout(&self) -> Result<()> {
        if let Ok(Some(token)) = self.credentials.load().await {
            let result = self
                .http
                .post(format!("{}/api/auth/logout", self.base_url))
                .bearer_auth(&token)
                .send()
                .await;
            if let Err(err) = result {
                warn!("logout notification failed: {err}");
            }
        }
        self.invalidate().await
    }

    /// Drops the stored credential and flips the session to unauthenticated.
    pub async fn invalidate(&self) -> Result<()> {
        self.credentials.clear().await?;
        *self.last_outcome.lock().await = None;
        self.state_tx.send_replace(SessionState::Unauthenticated);
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
