//! The `Refresher` contract the token-refresh scheduler drives, and the
//! grant-error classifier (spec.md §4.6 step 5).

use async_trait::async_trait;
use gproxy_account::AccountSnapshot;

#[derive(Debug, Clone)]
pub struct RefreshError {
    pub message: String,
}

impl RefreshError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl std::fmt::Display for RefreshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RefreshError {}

/// Abstracts the platform-specific OAuth refresh flow (the teacher's
/// `claudecode::refresh`/`geminicli::refresh` modules, one per provider).
/// The scheduler only ever talks to this trait.
#[async_trait]
pub trait Refresher: Send + Sync {
    fn can_refresh(&self, account: &AccountSnapshot) -> bool;
    fn needs_refresh(&self, account: &AccountSnapshot, refresh_before_expiry: std::time::Duration) -> bool;
    async fn refresh(&self, account: &AccountSnapshot) -> Result<AccountSnapshot, RefreshError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NonRetryable,
    Retryable,
}

const NON_RETRYABLE_GRANT_ERRORS: &[&str] = &["invalid_grant", "invalid_client", "unauthorized_client", "access_denied"];

/// Case-insensitive substring match against the known non-retryable OAuth
/// grant error codes; anything else (network errors, timeouts, 5xx) is
/// treated as transient.
pub fn classify_refresh_error(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();
    if NON_RETRYABLE_GRANT_ERRORS.iter().any(|needle| lower.contains(needle)) {
        ErrorClass::NonRetryable
    } else {
        ErrorClass::Retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_grant_is_non_retryable_case_insensitively() {
        assert_eq!(classify_refresh_error("Error: INVALID_GRANT"), ErrorClass::NonRetryable);
        assert_eq!(classify_refresh_error("unauthorized_client: no scope"), ErrorClass::NonRetryable);
    }

    #[test]
    fn network_timeout_is_retryable() {
        assert_eq!(classify_refresh_error("connection timed out"), ErrorClass::Retryable);
        assert_eq!(classify_refresh_error("502 bad gateway"), ErrorClass::Retryable);
    }
}
