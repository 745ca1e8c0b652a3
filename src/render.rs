//! Notification rendering.
//!
//! Renderers map engine state to opaque payloads. The scheduler and
//! executor never look inside what they get back.

use crate::executor::BatchSummary;
use crate::gateway::NotificationPayload;
use crate::types::{AggregateSnapshot, WorkItem};

/// Pending items listed per notification before truncating.
const LIST_LIMIT: usize = 8;

pub trait NotificationRenderer: Send + Sync {
    fn batch_created(&self, summary: &BatchSummary) -> NotificationPayload;

    /// Nag message for open items. `final_call` is the last reminder of the period.
    fn reminder(
        &self,
        snapshot: &AggregateSnapshot,
        pending: &[WorkItem],
        final_call: bool,
    ) -> NotificationPayload;

    /// Progress report. `final_report` closes the period.
    fn report(
        &self,
        snapshot: &AggregateSnapshot,
        pending: &[WorkItem],
        final_report: bool,
    ) -> NotificationPayload;

    /// PNG chart of the snapshot, if this renderer draws one.
    fn render_chart(&self, _snapshot: &AggregateSnapshot) -> Option<Vec<u8>> {
        None
    }

    /// Embed an uploaded image into a rendered payload.
    fn attach_image(&self, payload: NotificationPayload, _image_key: &str) -> NotificationPayload {
        payload
    }
}

/// Interactive-card renderer for the Feishu message format.
#[derive(Debug, Clone, Default)]
pub struct CardRenderer {
    pub document_url: Option<String>,
    pub due_day: u32,
}

impl CardRenderer {
    pub fn new(document_url: Option<String>, due_day: u32) -> Self {
        Self {
            document_url,
            due_day,
        }
    }

    fn card(&self, template: &str, title: &str, body: String) -> NotificationPayload {
        let mut elements = vec![serde_json::json!({
            "tag": "div",
            "text": { "tag": "lark_md", "content": body }
        })];
        if let Some(url) = &self.document_url {
            elements.push(serde_json::json!({
                "tag": "action",
                "actions": [{
                    "tag": "button",
                    "text": { "tag": "plain_text", "content": "Open report document" },
                    "type": "primary",
                    "url": url
                }]
            }));
        }
        NotificationPayload::card(serde_json::json!({
            "config": { "wide_screen_mode": true },
            "header": {
                "template": template,
                "title": { "tag": "plain_text", "content": title }
            },
            "elements": elements
        }))
    }
}

fn mention(owner: &str) -> String {
    format!("<at id={}></at>", owner)
}

fn item_line(item: &WorkItem) -> String {
    if item.owners.is_empty() {
        format!("- {} (unassigned)", item.title)
    } else {
        let owners: Vec<String> = item.owners.iter().map(|o| mention(o)).collect();
        format!("- {} {}", item.title, owners.join(" "))
    }
}

fn pending_lines(pending: &[WorkItem]) -> Vec<String> {
    let mut lines: Vec<String> = pending.iter().take(LIST_LIMIT).map(item_line).collect();
    if pending.len() > LIST_LIMIT {
        lines.push(format!("...and {} more", pending.len() - LIST_LIMIT));
    }
    lines
}

fn progress_line(snapshot: &AggregateSnapshot) -> String {
    format!(
        "**Progress:** {}/{} complete ({:.2}%), {} pending",
        snapshot.completed,
        snapshot.total,
        snapshot.rate,
        snapshot.pending()
    )
}

impl NotificationRenderer for CardRenderer {
    fn batch_created(&self, summary: &BatchSummary) -> NotificationPayload {
        let mut lines = vec![format!(
            "Created {} of {} report items for {}. Due on day {}.",
            summary.created,
            summary.attempted(),
            summary.period,
            self.due_day
        )];
        if !summary.failed.is_empty() {
            lines.push(format!(
                "**Failed ({}):** {}",
                summary.failed.len(),
                summary.failed.join(", ")
            ));
        }
        if summary.skipped > 0 {
            lines.push(format!("Skipped {} invalid item definition(s).", summary.skipped));
        }
        let template = if summary.failed.is_empty() { "green" } else { "orange" };
        self.card(template, &format!("Report tasks {}", summary.period), lines.join("\n"))
    }

    fn reminder(
        &self,
        snapshot: &AggregateSnapshot,
        pending: &[WorkItem],
        final_call: bool,
    ) -> NotificationPayload {
        let (template, title) = if final_call {
            ("red", format!("Final reminder: reports due today ({})", snapshot.period))
        } else {
            ("yellow", format!("Report reminder ({})", snapshot.period))
        };
        let mut lines = vec![progress_line(snapshot)];
        if pending.is_empty() {
            lines.push("All items are complete. Thank you!".to_string());
        } else {
            lines.push("Still open:".to_string());
            lines.extend(pending_lines(pending));
        }
        self.card(template, &title, lines.join("\n"))
    }

    fn report(
        &self,
        snapshot: &AggregateSnapshot,
        pending: &[WorkItem],
        final_report: bool,
    ) -> NotificationPayload {
        let title = if final_report {
            format!("Final report {}", snapshot.period)
        } else {
            format!("Daily progress {}", snapshot.period)
        };
        let mut lines = vec![progress_line(snapshot)];
        for (category, tally) in &snapshot.by_category {
            lines.push(format!("- {}: {}/{}", category, tally.completed, tally.total));
        }
        if final_report && !pending.is_empty() {
            lines.push("Not completed:".to_string());
            lines.extend(pending_lines(pending));
        }
        let template = if snapshot.total > 0 && snapshot.pending() == 0 {
            "green"
        } else {
            "blue"
        };
        self.card(template, &title, lines.join("\n"))
    }

    fn attach_image(&self, mut payload: NotificationPayload, image_key: &str) -> NotificationPayload {
        if let Some(elements) = payload
            .content
            .get_mut("elements")
            .and_then(|e| e.as_array_mut())
        {
            elements.insert(
                1,
                serde_json::json!({
                    "tag": "img",
                    "img_key": image_key,
                    "alt": { "tag": "plain_text", "content": "progress chart" }
                }),
            );
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CategoryTally;
    use chrono::Utc;
    use std::collections::{BTreeMap, BTreeSet};

    fn snapshot(total: usize, completed: usize) -> AggregateSnapshot {
        AggregateSnapshot {
            period: "2025-10".to_string(),
            total,
            completed,
            rate: crate::store::completion_rate(completed, total),
            by_category: BTreeMap::from([(
                "finance".to_string(),
                CategoryTally { total, completed },
            )]),
        }
    }

    fn item(title: &str, owners: &[&str]) -> WorkItem {
        WorkItem {
            id: title.to_string(),
            title: title.to_string(),
            category: None,
            owners: owners.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            completed: false,
            created_at: Utc::now(),
            completed_at: None,
            origin: None,
        }
    }

    fn body(payload: &NotificationPayload) -> String {
        payload.content["elements"][0]["text"]["content"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_reminder_mentions_owners() {
        let r = CardRenderer::new(None, 23);
        let payload = r.reminder(&snapshot(3, 1), &[item("Sales", &["ou_a"]), item("Ops", &[])], false);
        assert_eq!(payload.msg_type, "interactive");
        let text = body(&payload);
        assert!(text.contains("1/3 complete (33.33%)"));
        assert!(text.contains("Sales <at id=ou_a></at>"));
        assert!(text.contains("Ops (unassigned)"));
    }

    #[test]
    fn test_reminder_truncates_long_lists() {
        let r = CardRenderer::new(None, 23);
        let pending: Vec<WorkItem> = (0..11).map(|i| item(&format!("i{}", i), &[])).collect();
        let text = body(&r.reminder(&snapshot(11, 0), &pending, true));
        assert!(text.contains("...and 3 more"));
        assert!(!text.contains("i9"));
    }

    #[test]
    fn test_batch_summary_reports_failures() {
        let r = CardRenderer::new(Some("https://docs.example".to_string()), 23);
        let summary = BatchSummary {
            period: "2025-10".to_string(),
            created: 2,
            failed: vec!["Ops".to_string()],
            skipped: 1,
        };
        let payload = r.batch_created(&summary);
        let text = body(&payload);
        assert!(text.contains("Created 2 of 3"));
        assert!(text.contains("Failed (1):** Ops"));
        assert_eq!(payload.content["header"]["template"], "orange");
        assert_eq!(payload.content["elements"][1]["actions"][0]["url"], "https://docs.example");
    }

    #[test]
    fn test_final_report_lists_open_items() {
        let r = CardRenderer::new(None, 23);
        let text = body(&r.report(&snapshot(2, 1), &[item("Ops", &["ou_b"])], true));
        assert!(text.contains("finance: 1/2"));
        assert!(text.contains("Not completed:"));
    }

    #[test]
    fn test_default_renderer_draws_no_chart_and_attach_inserts_image() {
        let r = CardRenderer::new(None, 23);
        assert!(r.render_chart(&snapshot(1, 1)).is_none());
        let payload = r.attach_image(r.report(&snapshot(1, 1), &[], false), "img_1");
        assert_eq!(payload.content["elements"][1]["img_key"], "img_1");
    }
}
