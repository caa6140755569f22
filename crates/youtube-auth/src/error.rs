//! Error types for credential resolution
//!
//! Only `MalformedIdentity` and `Authorization` ever leave
//! `CredentialManager::resolve`. `TokenLoad` and the refresh variants are
//! recovered inside the manager; they exist so the recovery is explicit and
//! loggable rather than a swallowed generic failure.

/// Errors from credential resolution.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Identity document missing, not valid base64, not UTF-8 JSON, or not the
    /// expected shape. Fatal.
    #[error("malformed client identity: {0}")]
    MalformedIdentity(String),

    /// Token cache unreadable or unparseable. Recovered as "no token".
    #[error("token cache unusable: {0}")]
    TokenLoad(String),

    /// Refresh failed for a reason that may be transient. Recovered by
    /// re-authorizing.
    #[error("token refresh failed: {0}")]
    Refresh(String),

    /// Refresh grant rejected by the provider (revoked or expired refresh
    /// token). Recovered by re-authorizing.
    #[error("refresh token rejected: {0}")]
    RefreshRevoked(String),

    /// Interactive authorization or code exchange failed. Fatal.
    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Whether the manager recovers from this error instead of surfacing it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::TokenLoad(_) | Error::Refresh(_) | Error::RefreshRevoked(_)
        )
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovered_variants_are_flagged() {
        assert!(Error::TokenLoad("bad json".into()).is_recoverable());
        assert!(Error::Refresh("connection reset".into()).is_recoverable());
        assert!(Error::RefreshRevoked("invalid_grant".into()).is_recoverable());
    }

    #[test]
    fn fatal_variants_are_not_recoverable() {
        assert!(!Error::MalformedIdentity("bad base64".into()).is_recoverable());
        assert!(!Error::Authorization("access_denied".into()).is_recoverable());
        assert!(!Error::Io("disk full".into()).is_recoverable());
    }

    #[test]
    fn display_carries_context() {
        let err = Error::MalformedIdentity("missing field `installed`".into());
        assert_eq!(
            err.to_string(),
            "malformed client identity: missing field `installed`"
        );
    }
}
