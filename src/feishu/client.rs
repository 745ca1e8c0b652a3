//! HTTP client for the Feishu open API.
//!
//! Every response uses the `{code, msg, data}` envelope; a non-zero `code`
//! is a rejection even on HTTP 200. The tenant access token is cached until
//! shortly before it expires.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::FeishuConfig;
use crate::error::BotError;
use crate::gateway::{
    send_with_retry, NotificationPayload, NotificationTarget, PlatformGateway, RemoteId,
    RetryPolicy, WorkItemDraft, REQUEST_TIMEOUT_SECS,
};
use crate::types::RemoteStatus;

const TOKEN_PATH: &str = "/open-apis/auth/v3/tenant_access_token/internal";
const TASKS_PATH: &str = "/open-apis/task/v2/tasks";
const MESSAGES_PATH: &str = "/open-apis/im/v1/messages";
const IMAGES_PATH: &str = "/open-apis/im/v1/images";

/// Task API codes meaning "no such task (yet)"; local state is kept.
const TASK_NOT_FOUND_CODES: &[i64] = &[1470400, 1470404];
/// Token expired or invalid; the cached token is dropped.
const TOKEN_INVALID_CODES: &[i64] = &[99991661, 99991663, 99991668];
/// Legacy `complete` value for a finished task.
const LEGACY_COMPLETE_DONE: i64 = 2;
/// Refresh this long before the platform-reported expiry.
const TOKEN_REFRESH_MARGIN_SECS: u64 = 120;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
    #[serde(default)]
    expire: u64,
}

#[derive(Debug, Deserialize)]
struct TaskData {
    task: TaskNode,
}

#[derive(Debug, Deserialize)]
struct TaskNode {
    #[serde(default)]
    guid: String,
    /// Millisecond timestamp as a string; "0" while open.
    #[serde(default)]
    completed_at: Option<String>,
    #[serde(default)]
    complete: Option<i64>,
}

impl TaskNode {
    fn status(&self) -> RemoteStatus {
        let completed_at = self
            .completed_at
            .as_deref()
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|ms| *ms > 0)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        RemoteStatus {
            completed: completed_at.is_some() || self.complete == Some(LEGACY_COMPLETE_DONE),
            completed_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImageData {
    image_key: String,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct FeishuGateway {
    client: reqwest::Client,
    base_url: String,
    app_id: String,
    app_secret: String,
    retry: RetryPolicy,
    token: Mutex<Option<CachedToken>>,
}

impl FeishuGateway {
    pub fn new(config: &FeishuConfig, retry: RetryPolicy) -> Result<Self, BotError> {
        let (Some(app_id), Some(app_secret)) = (config.app_id.clone(), config.app_secret.clone())
        else {
            return Err(BotError::Configuration(
                "APP_ID and APP_SECRET are required".to_string(),
            ));
        };
        if !config.has_credentials() {
            return Err(BotError::Configuration(
                "APP_ID and APP_SECRET must not be blank".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| BotError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            app_id,
            app_secret,
            retry,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Cached tenant token, fetching a new one when absent or near expiry.
    async fn tenant_token(&self) -> Result<String, BotError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let request = self.client.post(self.url(TOKEN_PATH)).json(&serde_json::json!({
            "app_id": self.app_id,
            "app_secret": self.app_secret,
        }));
        let resp = send_with_retry(request, &self.retry).await?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(BotError::RemoteServer {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        let body: TokenResponse = resp.json().await?;
        if body.code != 0 || body.tenant_access_token.is_empty() {
            return Err(BotError::AuthFailed(format!(
                "tenant token rejected (code {}): {}",
                body.code, body.msg
            )));
        }

        let ttl = body.expire.saturating_sub(TOKEN_REFRESH_MARGIN_SECS);
        log::info!("Feishu tenant token refreshed (valid {}s)", body.expire);
        *cached = Some(CachedToken {
            value: body.tenant_access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(ttl),
        });
        Ok(body.tenant_access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    /// Send an authorized request and unwrap the envelope.
    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        subject: &str,
    ) -> Result<Option<T>, BotError> {
        let token = self.tenant_token().await?;
        let request = request.bearer_auth(token);
        let resp = send_with_retry(request, &self.retry).await?;
        let status = resp.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(BotError::RateLimited);
        }
        if status.is_server_error() {
            return Err(BotError::RemoteServer {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }

        let text = resp.text().await?;
        let envelope: Envelope<T> = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(_) if status == reqwest::StatusCode::NOT_FOUND => {
                return Err(BotError::NotFound(subject.to_string()))
            }
            Err(e) if status.is_success() => {
                return Err(BotError::Serialization(format!(
                    "Failed to parse Feishu response for {}: {}",
                    subject, e
                )))
            }
            Err(_) => {
                return Err(BotError::RemoteRejected {
                    code: status.as_u16() as i64,
                    message: text,
                })
            }
        };

        if envelope.code == 0 {
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(BotError::NotFound(subject.to_string()));
            }
            return Ok(envelope.data);
        }
        if TASK_NOT_FOUND_CODES.contains(&envelope.code) {
            return Err(BotError::NotFound(subject.to_string()));
        }
        if TOKEN_INVALID_CODES.contains(&envelope.code) {
            self.invalidate_token().await;
            return Err(BotError::AuthFailed(envelope.msg));
        }
        Err(BotError::RemoteRejected {
            code: envelope.code,
            message: envelope.msg,
        })
    }
}

#[async_trait]
impl PlatformGateway for FeishuGateway {
    async fn authenticate(&self) -> Result<(), BotError> {
        self.tenant_token().await.map(|_| ())
    }

    async fn create_work_item(&self, draft: &WorkItemDraft) -> Result<RemoteId, BotError> {
        let members: Vec<serde_json::Value> = draft
            .owners
            .iter()
            .map(|id| serde_json::json!({ "id": id, "type": "user", "role": "assignee" }))
            .collect();
        let mut body = serde_json::json!({
            "summary": draft.title,
            "description": draft.description.clone().unwrap_or_default(),
            "due": {
                "timestamp": draft.due.timestamp_millis().to_string(),
                "is_all_day": false,
            },
            "members": members,
        });
        if let Some(url) = &draft.origin {
            body["origin"] = serde_json::json!({
                "platform_i18n_name": { "en_us": "ReportBot" },
                "href": { "url": url, "title": draft.title },
            });
        }

        let request = self
            .client
            .post(self.url(TASKS_PATH))
            .query(&[("user_id_type", "open_id")])
            .json(&body);
        let data: Option<TaskData> = self.call(request, &draft.title).await?;
        let guid = data
            .map(|d| d.task.guid)
            .filter(|g| !g.is_empty())
            .ok_or_else(|| {
                BotError::Serialization(format!("Task create for {} returned no guid", draft.title))
            })?;
        log::info!("Created Feishu task {} ({})", guid, draft.title);
        Ok(guid)
    }

    async fn get_work_item_status(&self, id: &str) -> Result<RemoteStatus, BotError> {
        let request = self.client.get(self.url(&format!("{}/{}", TASKS_PATH, id)));
        let data: Option<TaskData> = self.call(request, id).await?;
        data.map(|d| d.task.status())
            .ok_or_else(|| BotError::NotFound(id.to_string()))
    }

    async fn complete_work_item(&self, id: &str) -> Result<(), BotError> {
        let now: DateTime<Utc> = Utc::now();
        let request = self
            .client
            .patch(self.url(&format!("{}/{}", TASKS_PATH, id)))
            .json(&serde_json::json!({
                "task": { "completed_at": now.timestamp_millis().to_string() },
                "update_fields": ["completed_at"],
            }));
        let _: Option<serde_json::Value> = self.call(request, id).await?;
        Ok(())
    }

    async fn send_notification(
        &self,
        target: &NotificationTarget,
        payload: &NotificationPayload,
    ) -> Result<(), BotError> {
        let (id_type, receive_id) = match target {
            NotificationTarget::Chat(id) => ("chat_id", id),
        };
        if receive_id.is_empty() {
            return Err(BotError::Configuration(format!(
                "no {} configured for notification",
                id_type
            )));
        }
        let request = self
            .client
            .post(self.url(MESSAGES_PATH))
            .query(&[("receive_id_type", id_type)])
            .json(&serde_json::json!({
                "receive_id": receive_id,
                "msg_type": payload.msg_type,
                "content": payload.content.to_string(),
            }));
        let _: Option<serde_json::Value> = self.call(request, receive_id).await?;
        Ok(())
    }

    async fn upload_image(&self, bytes: Vec<u8>) -> Result<String, BotError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name("chart.png")
            .mime_str("image/png")
            .map_err(|e| BotError::Configuration(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("image_type", "message")
            .part("image", part);
        let request = self.client.post(self.url(IMAGES_PATH)).multipart(form);
        let data: Option<ImageData> = self.call(request, "image").await?;
        data.map(|d| d.image_key)
            .ok_or_else(|| BotError::Serialization("image upload returned no key".to_string()))
    }
}
