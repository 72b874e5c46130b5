//! Error types for session orchestration

/// Errors surfaced by the session manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing, invalid, expired, revoked or replayed credentials. The
    /// specific reason is logged, never returned.
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("sign-in failed: {0}")]
    SignIn(#[from] thirdparty::Error),

    #[error("internal session error: {0}")]
    Internal(String),
}

/// Result alias for session manager operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthenticated_reveals_nothing() {
        assert_eq!(Error::Unauthenticated.to_string(), "unauthenticated");
    }

    #[test]
    fn sign_in_errors_keep_provider_detail() {
        let err: Error = thirdparty::Error::ProviderRejected("invalid_grant".into()).into();
        assert!(err.to_string().contains("invalid_grant"));
    }
}
