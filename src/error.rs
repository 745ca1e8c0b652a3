//! Error types for the duty engine
//!
//! Errors are classified by recoverability:
//! - Retryable: network issues, timeouts, rate limits, remote 5xx
//! - NonRetryable: configuration errors, identifier collisions, rejected requests
//! - RequiresUserAction: bad credentials, unwritable state directory

use thiserror::Error;

/// Error types for scheduled actions, store mutations and gateway calls
#[derive(Debug, Error)]
pub enum BotError {
    // Retryable errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Remote rate limit exceeded")]
    RateLimited,

    #[error("Remote server error {status}: {message}")]
    RemoteServer { status: u16, message: String },

    // Non-retryable errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Remote rejected request (code {code}): {message}")]
    RemoteRejected { code: i64, message: String },

    #[error("Remote item not found: {0}")]
    NotFound(String),

    #[error("Cannot re-key {old_id} to {new_id}: identifier already exists")]
    DuplicateIdentifier { old_id: String, new_id: String },

    #[error("Unknown work item: {0}")]
    UnknownItem(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Requires user action
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),
}

impl BotError {
    /// Returns true if this error is a transient remote failure worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BotError::Network(_)
                | BotError::Timeout(_)
                | BotError::RateLimited
                | BotError::RemoteServer { .. }
        )
    }

    /// Returns true if this error requires operator action to resolve
    pub fn requires_user_action(&self) -> bool {
        matches!(self, BotError::Persistence(_) | BotError::AuthFailed(_))
    }

    /// Get an operator-facing recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            BotError::Network(_) => "Check network connectivity to the chat platform.",
            BotError::Timeout(_) => "The platform took too long to answer. It will be retried.",
            BotError::RateLimited => "Wait a few minutes; requests are being throttled.",
            BotError::RemoteServer { .. } => "The platform is having trouble. It will be retried.",
            BotError::Configuration(_) => "Check rules and items in ~/.reportbot/config.json",
            BotError::RemoteRejected { .. } => "Check the app permissions and the request payload.",
            BotError::NotFound(_) => "The remote item may not be indexed yet; local state is kept.",
            BotError::DuplicateIdentifier { .. } => {
                "Another record already owns that identifier. Inspect work_items.json."
            }
            BotError::UnknownItem(_) => "The item is not tracked for the current period.",
            BotError::Serialization(_) => "A state file is malformed. Restore it from backup.",
            BotError::Persistence(_) => "Check permissions and disk space of the state directory.",
            BotError::AuthFailed(_) => "Verify APP_ID and APP_SECRET.",
        }
    }
}

impl From<std::io::Error> for BotError {
    fn from(err: std::io::Error) -> Self {
        BotError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        BotError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BotError::Timeout(crate::gateway::REQUEST_TIMEOUT_SECS)
        } else if let Some(status) = err.status() {
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                BotError::RateLimited
            } else if status.is_server_error() {
                BotError::RemoteServer {
                    status: status.as_u16(),
                    message: err.to_string(),
                }
            } else {
                BotError::RemoteRejected {
                    code: status.as_u16() as i64,
                    message: err.to_string(),
                }
            }
        } else if err.is_decode() {
            BotError::Serialization(err.to_string())
        } else {
            BotError::Network(err.to_string())
        }
    }
}
