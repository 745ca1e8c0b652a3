//! Platform gateway abstraction.
//!
//! Everything the engine needs from the chat platform: credentials, remote
//! work items, and message delivery. The Feishu client in `crate::feishu`
//! is the production implementation; tests use an in-memory fake.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BotError;
use crate::types::RemoteStatus;

/// Per-request timeout for platform calls.
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Identifier assigned by the remote platform.
pub type RemoteId = String;

/// Parameters for creating one remote work item.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItemDraft {
    pub title: String,
    pub description: Option<String>,
    pub owners: Vec<String>,
    pub due: DateTime<Utc>,
    pub origin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationTarget {
    Chat(String),
}

/// A rendered message: platform message type plus its content object.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationPayload {
    pub msg_type: String,
    pub content: serde_json::Value,
}

impl NotificationPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            msg_type: "text".to_string(),
            content: serde_json::json!({ "text": text.into() }),
        }
    }

    pub fn card(card: serde_json::Value) -> Self {
        Self {
            msg_type: "interactive".to_string(),
            content: card,
        }
    }

    /// Plain-text rendering used by the console channel and logs.
    pub fn summary(&self) -> String {
        match self.content.get("text").and_then(|t| t.as_str()) {
            Some(text) => text.to_string(),
            None => self
                .content
                .pointer("/header/title/content")
                .and_then(|t| t.as_str())
                .unwrap_or(&self.msg_type)
                .to_string(),
        }
    }
}

#[async_trait]
pub trait PlatformGateway: Send + Sync {
    /// Obtain or refresh credentials.
    async fn authenticate(&self) -> Result<(), BotError>;

    async fn create_work_item(&self, draft: &WorkItemDraft) -> Result<RemoteId, BotError>;

    /// Completion state of a remote item. `BotError::NotFound` when the
    /// platform does not know the identifier (yet).
    async fn get_work_item_status(&self, id: &str) -> Result<RemoteStatus, BotError>;

    async fn complete_work_item(&self, id: &str) -> Result<(), BotError>;

    async fn send_notification(
        &self,
        target: &NotificationTarget,
        payload: &NotificationPayload,
    ) -> Result<(), BotError>;

    /// Upload a rendered image, returning the platform's image key.
    async fn upload_image(&self, bytes: Vec<u8>) -> Result<String, BotError>;
}

// =============================================================================
// Retry
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// Exponential backoff with a little jitter. A numeric `Retry-After` wins,
/// capped at 30 seconds.
pub fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(value) = retry_after.and_then(|v| v.to_str().ok()) {
        if let Ok(secs) = value.parse::<u64>() {
            return Duration::from_secs(secs.min(30));
        }
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 150;
    Duration::from_millis(base.saturating_add(jitter))
}

/// Send `request`, retrying transient statuses and transport failures.
///
/// The final response is returned whatever its status; callers map it.
pub async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, BotError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let Some(cloned) = request.try_clone() else {
            return request.send().await.map_err(BotError::from);
        };

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                if is_retryable_status(status) && attempt < attempts {
                    let delay = retry_delay(
                        attempt,
                        policy,
                        response.headers().get(reqwest::header::RETRY_AFTER),
                    );
                    log::warn!(
                        "gateway retry {}/{} after status {} (sleep {:?})",
                        attempt,
                        attempts,
                        status,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                let retryable_transport = err.is_timeout() || err.is_connect();
                if retryable_transport && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    log::warn!(
                        "gateway retry {}/{} after transport error: {} (sleep {:?})",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(BotError::from(err));
            }
        }
    }

    Err(BotError::Network("request exhausted retries".to_string()))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_honors_retry_after_cap() {
        let policy = RetryPolicy::default();
        let header = reqwest::header::HeaderValue::from_static("120");
        assert_eq!(retry_delay(1, &policy, Some(&header)), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_delay_backoff_is_bounded() {
        let policy = RetryPolicy::default();
        let first = retry_delay(1, &policy, None);
        let late = retry_delay(10, &policy, None);
        assert!(first >= Duration::from_millis(250) && first < Duration::from_millis(400));
        assert!(late >= Duration::from_millis(2_000) && late < Duration::from_millis(2_150));
    }

    #[test]
    fn test_payload_summary() {
        assert_eq!(NotificationPayload::text("hi").summary(), "hi");
        let card = NotificationPayload::card(serde_json::json!({
            "header": { "title": { "tag": "plain_text", "content": "Daily stats" } }
        }));
        assert_eq!(card.summary(), "Daily stats");
    }

    #[test]
    fn test_retry_policy_config_keys() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"maxAttempts": 5, "initialBackoffMs": 100, "maxBackoffMs": 900}"#)
                .unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.max_backoff_ms, 900);
    }
}
