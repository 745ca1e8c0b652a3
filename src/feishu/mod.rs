//! Feishu (Lark) open-platform integration.
//!
//! Tenant-token auth, task v2 for remote work items, IM v1 for messages and
//! image upload. See `client::FeishuGateway`.

pub mod client;

use serde::{Deserialize, Serialize};

/// Feishu credentials and endpoint stored in ~/.reportbot/config.json.
///
/// `APP_ID` / `APP_SECRET` in the environment override the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeishuConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_secret: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_base_url() -> String {
    "https://open.feishu.cn".to_string()
}

impl Default for FeishuConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            app_secret: None,
            base_url: default_base_url(),
        }
    }
}

impl FeishuConfig {
    /// Both credentials present and non-empty.
    pub fn has_credentials(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.app_id) && present(&self.app_secret)
    }
}
