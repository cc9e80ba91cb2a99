use thiserror::Error;

/// Failure classes the engine distinguishes. Credential failures always end
/// in a forced transition to the unauthenticated state; the rest stay
/// contained in whichever component observed them.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("stored credential was rejected by the backend")]
    CredentialInvalid,
    #[error("live transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("message history fetch failed: {0}")]
    FetchFailed(String),
}
