use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::BotError;
use crate::feishu::FeishuConfig;
use crate::gateway::RetryPolicy;

/// Configuration stored in ~/.reportbot/config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// IANA zone every recurrence rule is evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    #[serde(default = "default_reconcile_interval_minutes")]
    pub reconcile_interval_minutes: u32,
    /// Group chat that receives batch, reminder and report notifications.
    #[serde(default)]
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_url: Option<String>,
    /// Recurrence table. `None` falls back to the deployed monthly schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<RecurrenceRule>>,
    /// Work items instantiated by the batch-create action.
    #[serde(default)]
    pub items: Vec<WorkItemSpec>,
    #[serde(default)]
    pub feishu: FeishuConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_intent_threshold")]
    pub intent_threshold: f64,
    #[serde(default = "default_dedup_retention_days")]
    pub dedup_retention_days: i64,
    /// Day of month remote items fall due.
    #[serde(default = "default_due_day")]
    pub due_day: u32,
    #[serde(default = "default_due_hour")]
    pub due_hour: u32,
}

fn default_timezone() -> String {
    "Asia/Shanghai".to_string()
}

fn default_tick_seconds() -> u64 {
    30
}

fn default_reconcile_interval_minutes() -> u32 {
    60
}

fn default_intent_threshold() -> f64 {
    0.75
}

fn default_dedup_retention_days() -> i64 {
    7
}

fn default_due_day() -> u32 {
    23
}

fn default_due_hour() -> u32 {
    17
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            tick_seconds: default_tick_seconds(),
            reconcile_interval_minutes: default_reconcile_interval_minutes(),
            chat_id: String::new(),
            document_url: None,
            rules: None,
            items: Vec::new(),
            feishu: FeishuConfig::default(),
            retry: RetryPolicy::default(),
            intent_threshold: default_intent_threshold(),
            dedup_retention_days: default_dedup_retention_days(),
            due_day: default_due_day(),
            due_hour: default_due_hour(),
        }
    }
}

impl Config {
    /// Parse the configured timezone.
    pub fn tz(&self) -> Result<Tz, BotError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| BotError::Configuration(format!("Invalid timezone: {}", self.timezone)))
    }

    /// Resolve the recurrence table, dropping rules that fail validation.
    ///
    /// A bad rule is a configuration error for that rule only; the rest of
    /// the table stays active.
    pub fn active_rules(&self) -> Vec<RecurrenceRule> {
        let rules = self.rules.clone().unwrap_or_else(default_rules);
        rules
            .into_iter()
            .filter(|rule| match crate::window::validate_rule(rule) {
                Ok(()) => true,
                Err(e) => {
                    log::error!("Skipping recurrence rule for {}: {}", rule.action, e);
                    false
                }
            })
            .collect()
    }
}

/// The deployed monthly schedule.
///
/// - 17-19 09:30: create the month's batch
/// - 18-22 10:00: daily reminder
/// - 23 09:00: final reminder
/// - 23 18:00: final report
/// - every day 17:30: daily stats
pub fn default_rules() -> Vec<RecurrenceRule> {
    vec![
        RecurrenceRule::monthly(ActionKind::CreateBatch, 17, 19, 9, 30),
        RecurrenceRule::daily(ActionKind::DailyReminder, 18, 22, 10, 0),
        RecurrenceRule::monthly(ActionKind::FinalReminder, 23, 23, 9, 0),
        RecurrenceRule::monthly(ActionKind::FinalReport, 23, 23, 18, 0),
        RecurrenceRule::daily(ActionKind::DailyStats, 1, 31, 17, 30),
    ]
}

// =============================================================================
// Recurrence
// =============================================================================

/// Actions the scheduler can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateBatch,
    DailyReminder,
    FinalReminder,
    FinalReport,
    DailyStats,
}

impl ActionKind {
    pub const ALL: [ActionKind; 5] = [
        ActionKind::CreateBatch,
        ActionKind::DailyReminder,
        ActionKind::FinalReminder,
        ActionKind::FinalReport,
        ActionKind::DailyStats,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::CreateBatch => "create_batch",
            ActionKind::DailyReminder => "daily_reminder",
            ActionKind::FinalReminder => "final_reminder",
            ActionKind::FinalReport => "final_report",
            ActionKind::DailyStats => "daily_stats",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| BotError::Configuration(format!("Unknown action: {}", s)))
    }
}

/// Idempotency granularity of a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodGranularity {
    /// One firing per calendar month (`YYYY-MM`).
    #[default]
    Month,
    /// One firing per calendar day (`YYYY-MM-DD`).
    Day,
}

/// Declarative calendar window: fires on days `[day_start, day_end]` at `hour:minute`.
///
/// Ranges are inclusive and must not wrap past month end; callers pre-split
/// such windows into two rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurrenceRule {
    pub action: ActionKind,
    pub day_start: u32,
    pub day_end: u32,
    pub hour: u32,
    pub minute: u32,
    #[serde(default)]
    pub period: PeriodGranularity,
}

impl RecurrenceRule {
    pub fn monthly(action: ActionKind, day_start: u32, day_end: u32, hour: u32, minute: u32) -> Self {
        Self {
            action,
            day_start,
            day_end,
            hour,
            minute,
            period: PeriodGranularity::Month,
        }
    }

    pub fn daily(action: ActionKind, day_start: u32, day_end: u32, hour: u32, minute: u32) -> Self {
        Self {
            period: PeriodGranularity::Day,
            ..Self::monthly(action, day_start, day_end, hour, minute)
        }
    }
}

// =============================================================================
// Job ledger
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    /// Claimed; the action body has not reported back (yet).
    Attempted,
    Success,
    Partial,
    Failed,
}

/// One firing of an action for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLedgerEntry {
    pub action: ActionKind,
    pub period: String,
    pub fired_at: DateTime<Utc>,
    pub outcome: JobOutcome,
    #[serde(default)]
    pub item_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
    /// Set when an operator re-ran the action outside its window.
    #[serde(default)]
    pub manual: bool,
}

// =============================================================================
// Work items
// =============================================================================

/// Item template from config, instantiated once per batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemSpec {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "desc")]
    pub description: Option<String>,
    #[serde(default)]
    pub owners: Vec<String>,
    /// Legacy single-owner field.
    #[serde(default, alias = "assignee_open_id", skip_serializing_if = "Option::is_none")]
    pub assignee_open_id: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, alias = "doc_url")]
    pub doc_url: Option<String>,
}

impl WorkItemSpec {
    /// Merge `owners` with the legacy `assigneeOpenId`, trimmed and deduplicated.
    pub fn resolved_owners(&self) -> BTreeSet<String> {
        self.owners
            .iter()
            .chain(self.assignee_open_id.iter())
            .map(|o| o.trim())
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// The trimmed title, or a configuration error when it is missing.
    pub fn validated_title(&self) -> Result<String, BotError> {
        match self.title.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => Ok(t.to_string()),
            _ => Err(BotError::Configuration(
                "work item definition is missing a title".to_string(),
            )),
        }
    }
}

/// Local mirror of a tracked work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub owners: BTreeSet<String>,
    #[serde(default)]
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// Partial update for `WorkItemStore::upsert`. `None` fields are left untouched
/// on an existing record.
#[derive(Debug, Clone, Default)]
pub struct WorkItemPatch {
    pub id: String,
    pub title: Option<String>,
    pub category: Option<String>,
    pub owners: Option<BTreeSet<String>>,
    pub completed: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub origin: Option<String>,
}

impl WorkItemPatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// Label used for items without a category in per-category subtotals.
pub const UNCATEGORIZED: &str = "uncategorized";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryTally {
    pub total: usize,
    pub completed: usize,
}

/// Derived projection of the work-item set. Never mutated on its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    pub period: String,
    pub total: usize,
    pub completed: usize,
    /// Percentage, two decimals; 0.0 for an empty set.
    pub rate: f64,
    #[serde(default)]
    pub by_category: BTreeMap<String, CategoryTally>,
}

impl AggregateSnapshot {
    pub fn pending(&self) -> usize {
        self.total.saturating_sub(self.completed)
    }
}

/// Completion state as reported by the remote platform.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStatus {
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Interactions
// =============================================================================

/// One recorded chat-command effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionRecord {
    pub actor: String,
    pub target: String,
    pub action: String,
    pub day: NaiveDate,
    pub recorded_at: DateTime<Utc>,
}

/// Dedup identity of a chat-command effect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InteractionKey {
    pub actor: String,
    pub target: String,
    pub action: String,
    pub day: NaiveDate,
}

impl InteractionKey {
    pub fn new(
        actor: impl Into<String>,
        target: impl Into<String>,
        action: impl Into<String>,
        day: NaiveDate,
    ) -> Self {
        Self {
            actor: actor.into(),
            target: target.into(),
            action: action.into(),
            day,
        }
    }

    pub fn matches(&self, record: &InteractionRecord) -> bool {
        record.actor == self.actor
            && record.target == self.target
            && record.action == self.action
            && record.day == self.day
    }
}
