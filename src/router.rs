//! Chat command router.
//!
//! Inbound text is normalized, matched against a static alias table, and
//! dispatched. Side-effecting intents go through the interaction dedup log
//! first; read-only intents always run. Every turn yields exactly one reply.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use regex::Regex;

use crate::dedup::InteractionLog;
use crate::error::BotError;
use crate::gateway::PlatformGateway;
use crate::store::{is_placeholder, WorkItemStore};
use crate::types::{Config, InteractionKey, RecurrenceRule, WorkItem};

/// Confidence for an alias appearing inside longer text.
const CONTAINS_CONFIDENCE: f64 = 0.85;
/// Pending items listed before the reply is truncated.
const PENDING_LIST_LIMIT: usize = 8;
/// Dedup target for blanket actions over all of an actor's items.
const TARGET_ALL: &str = "all";

const FAILURE_REPLY: &str = "Sorry, something went wrong handling that. Please try again later.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Help,
    Status,
    Pending,
    MyTasks,
    MarkComplete,
    FileLink,
    Schedule,
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Intent::Help => "help",
            Intent::Status => "status",
            Intent::Pending => "pending",
            Intent::MyTasks => "my_tasks",
            Intent::MarkComplete => "mark_complete",
            Intent::FileLink => "file_link",
            Intent::Schedule => "schedule",
        }
    }

    /// Intents that change state and are therefore deduplicated.
    pub fn is_side_effecting(&self) -> bool {
        matches!(self, Intent::MarkComplete)
    }
}

/// Alias table. Order breaks confidence ties, so longer phrases that
/// contain shorter aliases of another intent come first.
static ALIASES: &[(&str, Intent)] = &[
    ("help", Intent::Help),
    ("commands", Intent::Help),
    ("帮助", Intent::Help),
    ("ayuda", Intent::Help),
    ("status", Intent::Status),
    ("progress", Intent::Status),
    ("stats", Intent::Status),
    ("completion rate", Intent::Status),
    ("完成率", Intent::Status),
    ("进度", Intent::Status),
    ("状态", Intent::Status),
    ("progreso", Intent::Status),
    ("pending", Intent::Pending),
    ("outstanding", Intent::Pending),
    ("who is left", Intent::Pending),
    ("未完成", Intent::Pending),
    ("pendientes", Intent::Pending),
    ("my tasks", Intent::MyTasks),
    ("my list", Intent::MyTasks),
    ("我的任务", Intent::MyTasks),
    ("mis tareas", Intent::MyTasks),
    ("done", Intent::MarkComplete),
    ("finished", Intent::MarkComplete),
    ("completed", Intent::MarkComplete),
    ("mark complete", Intent::MarkComplete),
    ("已完成", Intent::MarkComplete),
    ("完成", Intent::MarkComplete),
    ("搞定", Intent::MarkComplete),
    ("hecho", Intent::MarkComplete),
    ("terminado", Intent::MarkComplete),
    ("link", Intent::FileLink),
    ("document", Intent::FileLink),
    ("文档", Intent::FileLink),
    ("链接", Intent::FileLink),
    ("schedule", Intent::Schedule),
    ("deadline", Intent::Schedule),
    ("时间表", Intent::Schedule),
    ("截止", Intent::Schedule),
];

#[derive(Debug, Clone, PartialEq)]
pub struct IntentMatch {
    pub intent: Intent,
    pub confidence: f64,
}

// Compile-once regex patterns via OnceLock.
fn at_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<at\b[^>]*?>.*?</at>").unwrap())
}

fn at_handle_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(^|\s)@\S+").unwrap())
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// Strip mention markup, collapse whitespace, case-fold, and drop trailing
/// punctuation.
pub fn normalize(text: &str) -> String {
    let text = at_tag_re().replace_all(text, " ");
    let text = at_handle_re().replace_all(&text, " ");
    let text = whitespace_re().replace_all(&text, " ");
    text.trim()
        .trim_end_matches(['!', '.', '?', '。', '！', '？', ','])
        .trim()
        .to_lowercase()
}

fn contains_alias(text: &str, alias: &str) -> bool {
    if alias.is_ascii() {
        format!(" {} ", text).contains(&format!(" {} ", alias))
    } else {
        text.contains(alias)
    }
}

/// Words that turn a completion phrase into its opposite ("not done").
static NEGATION_WORDS: &[&str] = &[
    "not", "no", "none", "never", "yet", "nothing", "isn't", "isnt", "haven't", "havent",
    "hasn't", "hasnt", "didn't", "didnt", "don't", "dont", "aren't", "todavía", "todavia", "aún",
    "aun",
];
static NEGATION_MARKERS_CJK: &[&str] = &["未", "没", "沒", "不", "尚"];

fn is_negated(text: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .any(|word| NEGATION_WORDS.contains(&word))
        || NEGATION_MARKERS_CJK.iter().any(|m| text.contains(m))
}

/// Best intent for already-normalized text, if it reaches `threshold`.
///
/// Side-effecting intents only match on an alias, never by similarity, and
/// never when the text is negated.
pub fn match_intent(text: &str, threshold: f64) -> Option<IntentMatch> {
    if text.is_empty() {
        return None;
    }
    let negated = is_negated(text);
    let mut best: Option<IntentMatch> = None;
    for (alias, intent) in ALIASES {
        let confidence = if text == *alias {
            1.0
        } else if intent.is_side_effecting() && negated {
            continue;
        } else if contains_alias(text, alias) {
            CONTAINS_CONFIDENCE
        } else if intent.is_side_effecting() {
            continue;
        } else {
            strsim::jaro_winkler(text, alias)
        };
        if best.as_ref().map_or(true, |b| confidence > b.confidence) {
            best = Some(IntentMatch {
                intent: *intent,
                confidence,
            });
        }
    }
    best.filter(|m| m.confidence >= threshold)
}

/// Terminal state of one chat turn.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Unmatched,
    Deduped(Intent),
    HandlerOk(Intent),
    HandlerFailed(Intent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    pub outcome: RouteOutcome,
}

/// Router settings derived from `Config`.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub threshold: f64,
    pub tz: Tz,
    pub document_url: Option<String>,
    pub rules: Vec<RecurrenceRule>,
}

impl RouterSettings {
    pub fn from_config(config: &Config) -> Result<Self, BotError> {
        Ok(Self {
            threshold: config.intent_threshold,
            tz: config.tz()?,
            document_url: config.document_url.clone(),
            rules: config.active_rules(),
        })
    }
}

pub struct CommandRouter {
    store: Arc<WorkItemStore>,
    dedup: Arc<InteractionLog>,
    gateway: Arc<dyn PlatformGateway>,
    settings: RouterSettings,
}

impl CommandRouter {
    pub fn new(
        store: Arc<WorkItemStore>,
        dedup: Arc<InteractionLog>,
        gateway: Arc<dyn PlatformGateway>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            store,
            dedup,
            gateway,
            settings,
        }
    }

    pub async fn route(&self, text: &str, actor: &str, now: DateTime<Utc>) -> Reply {
        let normalized = normalize(text);
        let Some(matched) = match_intent(&normalized, self.settings.threshold) else {
            log::debug!("Router: no intent for {:?} from {}", normalized, actor);
            return Reply {
                text: format!(
                    "Received: {}\nSend \"help\" to see what I can do.",
                    text.trim()
                ),
                outcome: RouteOutcome::Unmatched,
            };
        };
        let intent = matched.intent;
        log::info!(
            "Router: {} -> {} (confidence {:.2})",
            actor,
            intent.name(),
            matched.confidence
        );

        let key = if intent.is_side_effecting() {
            let today = now.with_timezone(&self.settings.tz).date_naive();
            let key = InteractionKey::new(actor, TARGET_ALL, intent.name(), today);
            match self.dedup.check_and_record(&key, now) {
                Ok(true) => {
                    log::info!("Router: {} already handled for {} today", intent.name(), actor);
                    return Reply {
                        text: "Already recorded today, nothing more to do.".to_string(),
                        outcome: RouteOutcome::Deduped(intent),
                    };
                }
                Ok(false) => Some(key),
                Err(e) => {
                    log::error!("Router: dedup log unavailable: {}", e);
                    return Reply {
                        text: FAILURE_REPLY.to_string(),
                        outcome: RouteOutcome::HandlerFailed(intent),
                    };
                }
            }
        } else {
            None
        };

        match self.dispatch(intent, actor, now).await {
            Ok(text) => Reply {
                text,
                outcome: RouteOutcome::HandlerOk(intent),
            },
            Err(e) => {
                log::error!("Router: {} handler failed for {}: {}", intent.name(), actor, e);
                if let Some(key) = key {
                    if let Err(e) = self.dedup.forget(&key) {
                        log::warn!("Router: could not release dedup record: {}", e);
                    }
                }
                Reply {
                    text: FAILURE_REPLY.to_string(),
                    outcome: RouteOutcome::HandlerFailed(intent),
                }
            }
        }
    }

    async fn dispatch(
        &self,
        intent: Intent,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<String, BotError> {
        match intent {
            Intent::Help => Ok(help_text()),
            Intent::Status => Ok(self.status_text()),
            Intent::Pending => Ok(self.pending_text()),
            Intent::MyTasks => Ok(self.my_tasks_text(actor)),
            Intent::MarkComplete => self.mark_complete(actor, now).await,
            Intent::FileLink => Ok(match &self.settings.document_url {
                Some(url) => format!("Report document: {}", url),
                None => "No document link is configured.".to_string(),
            }),
            Intent::Schedule => Ok(self.schedule_text()),
        }
    }

    async fn mark_complete(&self, actor: &str, now: DateTime<Utc>) -> Result<String, BotError> {
        let changed = self.store.complete_for_owner(actor, now)?;
        if changed.is_empty() {
            let owned = self.store.items_for_owner(actor);
            return Ok(if owned.is_empty() {
                "You have no items assigned this period.".to_string()
            } else {
                "All of your items are already complete.".to_string()
            });
        }

        // Items the platform refused go back to open so a retry pushes them.
        let mut push_error = None;
        for item in changed.iter().filter(|i| !is_placeholder(&i.id)) {
            if let Err(e) = self.gateway.complete_work_item(&item.id).await {
                log::warn!("Router: remote completion for {} failed: {}", item.id, e);
                self.store.mark_incomplete(&item.id)?;
                push_error.get_or_insert(e);
            }
        }
        if let Some(e) = push_error {
            return Err(e);
        }

        let snapshot = self.store.snapshot();
        Ok(format!(
            "Marked {} item(s) complete. Progress: {}/{} ({:.2}%).",
            changed.len(),
            snapshot.completed,
            snapshot.total,
            snapshot.rate
        ))
    }

    fn status_text(&self) -> String {
        let s = self.store.snapshot();
        let mut lines = vec![format!(
            "Period {}: {}/{} complete ({:.2}%), {} pending.",
            s.period,
            s.completed,
            s.total,
            s.rate,
            s.pending()
        )];
        for (category, tally) in &s.by_category {
            lines.push(format!("- {}: {}/{}", category, tally.completed, tally.total));
        }
        lines.join("\n")
    }

    fn pending_text(&self) -> String {
        let pending = self.store.pending_items();
        if pending.is_empty() {
            return "Everything is complete.".to_string();
        }
        let mut lines = vec![format!("{} item(s) pending:", pending.len())];
        lines.extend(pending.iter().take(PENDING_LIST_LIMIT).map(describe_item));
        if pending.len() > PENDING_LIST_LIMIT {
            lines.push(format!("...and {} more", pending.len() - PENDING_LIST_LIMIT));
        }
        lines.join("\n")
    }

    fn my_tasks_text(&self, actor: &str) -> String {
        let items = self.store.items_for_owner(actor);
        if items.is_empty() {
            return "You have no items assigned this period.".to_string();
        }
        let mut lines = vec!["Your items:".to_string()];
        lines.extend(items.iter().map(|item| {
            let mark = if item.completed { "x" } else { " " };
            format!("[{}] {}", mark, item.title)
        }));
        lines.join("\n")
    }

    fn schedule_text(&self) -> String {
        let mut lines = vec![format!("Schedule ({}):", self.settings.tz)];
        lines.extend(self.settings.rules.iter().map(|rule| {
            let days = if rule.day_start == rule.day_end {
                format!("day {}", rule.day_start)
            } else {
                format!("days {}-{}", rule.day_start, rule.day_end)
            };
            format!(
                "- {}: {} at {:02}:{:02}",
                rule.action, days, rule.hour, rule.minute
            )
        }));
        lines.join("\n")
    }
}

fn describe_item(item: &WorkItem) -> String {
    if item.owners.is_empty() {
        format!("- {} (unassigned)", item.title)
    } else {
        let owners: Vec<&str> = item.owners.iter().map(String::as_str).collect();
        format!("- {} ({})", item.title, owners.join(", "))
    }
}

fn help_text() -> String {
    [
        "Commands:",
        "- status: completion progress",
        "- pending: items still open",
        "- my tasks: your items",
        "- done: mark your items complete",
        "- link: report document",
        "- schedule: when reminders go out",
    ]
    .join("\n")
}
