//! Error types for token and session-store operations

/// Why a credential or session operation was refused.
///
/// These distinctions are for logs and audit. Callers answering an HTTP
/// request collapse all of them to "unauthenticated".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("session not found")]
    NotFound,

    #[error("session revoked")]
    Revoked,

    /// A refresh token was presented a second time. The session is revoked.
    #[error("refresh token reused")]
    TokenReused,

    #[error("session snapshot error: {0}")]
    Snapshot(#[from] common::Error),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
