//! Error types for MailHub
//!
//! One enum covers every failure mode a run can surface. Variants line up
//! with how callers are expected to react: gate and send rejections are
//! reported and halt cleanly, key failures fail closed before the store is
//! touched, provider failures are per account.

use crate::provider::ProviderError;
use crate::sync::backoff::{RetryDecision, RetryableError};
use thiserror::Error;

/// Result type alias for MailHub operations
pub type Result<T> = std::result::Result<T, MailHubError>;

/// Comprehensive error type for MailHub operations
#[derive(Error, Debug)]
pub enum MailHubError {
    /// A run gate is unmet; the code is machine readable
    #[error("Gate blocked: {code}: {message}")]
    GateBlocked { code: String, message: String },

    /// No key backend passed verification
    #[error("No key backend available: {0}")]
    BackendUnavailable(String),

    /// The selected backend could not produce a working key
    #[error("Key verification failed: {0}")]
    KeyVerification(String),

    /// Probing picked a different backend than the recorded selection
    #[error("Key backend changed from {recorded} to {current}; run `mailhub vault setup`")]
    SelectionChanged { recorded: String, current: String },

    /// SQLite / SQLCipher errors
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Provider capability errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Send rejected before anything was executed
    #[error("Send blocked: {0}")]
    SendBlocked(String),

    /// Lookup misses (account, message, reply)
    #[error("Not found: {0}")]
    NotFound(String),

    /// A natural-language target matched more than one entry
    #[error("Ambiguous target '{target}', candidates: {candidates:?}")]
    Ambiguous { target: String, candidates: Vec<i64> },

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Collaborator process errors
    #[error("Collaborator error: {0}")]
    Bridge(#[from] agent_bridge::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl MailHubError {
    /// Short machine-readable code for JSON output
    pub fn code(&self) -> &str {
        match self {
            MailHubError::GateBlocked { code, .. } => code,
            MailHubError::BackendUnavailable(_) => "backend_unavailable",
            MailHubError::KeyVerification(_) => "key_verification_failed",
            MailHubError::SelectionChanged { .. } => "key_backend_changed",
            MailHubError::Store(_) => "store_error",
            MailHubError::Provider(ProviderError::Throttled { .. }) => "provider_throttled",
            MailHubError::Provider(_) => "provider_error",
            MailHubError::SendBlocked(_) => "send_blocked",
            MailHubError::NotFound(_) => "not_found",
            MailHubError::Ambiguous { .. } => "ambiguous_target",
            MailHubError::InvalidState(_) => "invalid_state",
            MailHubError::Config(_) => "config_error",
            MailHubError::Io(_) => "io_error",
            MailHubError::Json(_) => "json_error",
            MailHubError::Yaml(_) => "yaml_error",
            MailHubError::Bridge(_) => "collaborator_error",
            MailHubError::Other(_) => "error",
        }
    }
}

impl RetryableError for MailHubError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            MailHubError::Provider(e) => e.retry_decision(),
            _ => RetryDecision::NoRetry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_codes() {
        let gate = MailHubError::GateBlocked {
            code: "config_not_reviewed".to_string(),
            message: "review first".to_string(),
        };
        assert_eq!(gate.code(), "config_not_reviewed");
        assert_eq!(
            MailHubError::SendBlocked("x".to_string()).code(),
            "send_blocked"
        );
        let throttled = MailHubError::Provider(ProviderError::Throttled { retry_after: None });
        assert_eq!(throttled.code(), "provider_throttled");
    }

    #[test]
    fn test_only_throttling_is_retryable() {
        let throttled = MailHubError::Provider(ProviderError::Throttled {
            retry_after: Some(Duration::from_secs(2)),
        });
        assert_eq!(
            throttled.retry_decision(),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );

        let rejected = MailHubError::Provider(ProviderError::Rejected("nope".to_string()));
        assert_eq!(rejected.retry_decision(), RetryDecision::NoRetry);
        assert_eq!(
            MailHubError::SendBlocked("x".to_string()).retry_decision(),
            RetryDecision::NoRetry
        );
    }
}
