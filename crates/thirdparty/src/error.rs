//! Error types for third-party sign-in

/// Errors from the authorization-code exchange.
///
/// `ProviderUnavailable` is worth retrying from a fresh sign-in.
/// `InvalidState`, `ProviderRejected` and `UnknownProvider` end the attempt.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid or expired sign-in state: {0}")]
    InvalidState(String),

    #[error("identity provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("identity provider rejected the request: {0}")]
    ProviderRejected(String),

    #[error("unknown identity provider: {0}")]
    UnknownProvider(String),

    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),

    #[error("user directory snapshot error: {0}")]
    Snapshot(#[from] common::Error),
}

impl Error {
    /// Whether restarting the sign-in has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ProviderUnavailable(_))
    }
}

/// Result alias for sign-in operations.
pub type Result<T> = std::result::Result<T, Error>;
