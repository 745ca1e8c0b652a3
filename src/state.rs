use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono_tz::Tz;

use crate::dedup::InteractionLog;
use crate::error::BotError;
use crate::feishu::client::FeishuGateway;
use crate::gateway::PlatformGateway;
use crate::ledger::JobLedger;
use crate::render::{CardRenderer, NotificationRenderer};
use crate::router::{CommandRouter, RouterSettings};
use crate::store::WorkItemStore;
use crate::types::{Config, RecurrenceRule};

/// Overrides the state directory (default ~/.reportbot).
pub const HOME_ENV: &str = "REPORTBOT_HOME";

pub const CONFIG_FILE: &str = "config.json";
pub const LEDGER_FILE: &str = "job_ledger.json";
pub const WORK_ITEMS_FILE: &str = "work_items.json";
pub const INTERACTIONS_FILE: &str = "interactions.json";

/// Shared engine state: configuration plus the three persisted documents.
pub struct AppState {
    pub config: Config,
    pub tz: Tz,
    /// Validated recurrence table.
    pub rules: Vec<RecurrenceRule>,
    pub state_dir: PathBuf,
    pub ledger: JobLedger,
    pub store: Arc<WorkItemStore>,
    pub dedup: Arc<InteractionLog>,
    pub gateway: Arc<dyn PlatformGateway>,
    pub renderer: Arc<dyn NotificationRenderer>,
}

impl AppState {
    pub fn new(
        config: Config,
        state_dir: &Path,
        gateway: Arc<dyn PlatformGateway>,
        renderer: Arc<dyn NotificationRenderer>,
    ) -> Result<Self, BotError> {
        let tz = config.tz()?;
        let rules = config.active_rules();
        if rules.is_empty() {
            log::warn!("No valid recurrence rules; nothing will be scheduled");
        }

        fs::create_dir_all(state_dir).map_err(|e| {
            BotError::Persistence(format!("Failed to create {}: {}", state_dir.display(), e))
        })?;

        Ok(Self {
            ledger: JobLedger::open(state_dir.join(LEDGER_FILE))?,
            store: Arc::new(WorkItemStore::open(state_dir.join(WORK_ITEMS_FILE))?),
            dedup: Arc::new(InteractionLog::open(
                state_dir.join(INTERACTIONS_FILE),
                config.dedup_retention_days,
            )?),
            tz,
            rules,
            state_dir: state_dir.to_path_buf(),
            gateway,
            renderer,
            config,
        })
    }

    /// Load config from the state directory and wire the Feishu gateway.
    pub fn load() -> Result<Self, BotError> {
        let dir = get_state_dir()?;
        let config = load_config(&dir)?;
        let gateway = Arc::new(FeishuGateway::new(&config.feishu, config.retry.clone())?);
        let renderer = Arc::new(CardRenderer::new(
            config.document_url.clone(),
            config.due_day,
        ));
        Self::new(config, &dir, gateway, renderer)
    }

    pub fn router(&self) -> Result<CommandRouter, BotError> {
        Ok(CommandRouter::new(
            self.store.clone(),
            self.dedup.clone(),
            self.gateway.clone(),
            RouterSettings::from_config(&self.config)?,
        ))
    }

    #[cfg(test)]
    pub fn for_tests(
        config: Config,
        state_dir: &Path,
        gateway: Arc<dyn PlatformGateway>,
    ) -> Result<Self, BotError> {
        let renderer = Arc::new(CardRenderer::new(config.document_url.clone(), config.due_day));
        Self::new(config, state_dir, gateway, renderer)
    }
}

/// Get the state directory (~/.reportbot, or $REPORTBOT_HOME)
pub fn get_state_dir() -> Result<PathBuf, BotError> {
    if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| BotError::Configuration("Could not find home directory".to_string()))?;
    Ok(home.join(".reportbot"))
}

/// Load configuration from `<state_dir>/config.json`, then apply environment overrides.
///
/// A missing file yields the defaults; a malformed one is an error.
pub fn load_config(state_dir: &Path) -> Result<Config, BotError> {
    let path = state_dir.join(CONFIG_FILE);
    let mut config = if path.exists() {
        let content = fs::read_to_string(&path).map_err(|e| {
            BotError::Persistence(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            BotError::Configuration(format!("Invalid config {}: {}", path.display(), e))
        })?
    } else {
        log::warn!("No config at {}, using defaults", path.display());
        Config::default()
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// `APP_ID`, `APP_SECRET` and `CHAT_ID` take precedence over the file.
pub fn apply_env_overrides(config: &mut Config, get: impl Fn(&str) -> Option<String>) {
    let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());
    if let Some(v) = get("APP_ID") {
        config.feishu.app_id = Some(v);
    }
    if let Some(v) = get("APP_SECRET") {
        config.feishu.app_secret = Some(v);
    }
    if let Some(v) = get("CHAT_ID") {
        config.chat_id = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::FakeGateway;

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = Config::default();
        config.feishu.app_id = Some("from_file".to_string());
        apply_env_overrides(&mut config, |key| match key {
            "APP_ID" => Some("cli_env".to_string()),
            "APP_SECRET" => Some("s3cret".to_string()),
            "CHAT_ID" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.feishu.app_id.as_deref(), Some("cli_env"));
        assert_eq!(config.feishu.app_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.chat_id, "");
    }

    #[test]
    fn test_load_config_reads_camel_case_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"timezone": "America/Sao_Paulo", "chatId": "oc_1", "tickSeconds": 5,
                "items": [{"title": "Sales", "owners": ["ou_a"]}]}"#,
        )
        .unwrap();
        let config = load_config(dir.path()).unwrap();
        assert_eq!(config.timezone, "America/Sao_Paulo");
        assert_eq!(config.tick_seconds, 5);
        assert_eq!(config.items.len(), 1);
        assert_eq!(config.due_day, 23);
    }

    #[test]
    fn test_malformed_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{ nope").unwrap();
        assert!(matches!(load_config(dir.path()), Err(BotError::Configuration(_))));
    }

    #[test]
    fn test_state_opens_documents_in_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let state = AppState::for_tests(
            Config::default(),
            &state_dir,
            Arc::new(FakeGateway::default()),
        )
        .unwrap();
        assert!(state_dir.is_dir());
        assert_eq!(state.rules.len(), 5);
        assert!(state.router().is_ok());
    }

    #[test]
    fn test_bad_timezone_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            timezone: "Nowhere/City".to_string(),
            ..Config::default()
        };
        let result = AppState::for_tests(config, dir.path(), Arc::new(FakeGateway::default()));
        assert!(matches!(result, Err(BotError::Configuration(_))));
    }
}
