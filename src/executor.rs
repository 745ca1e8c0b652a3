//! Action execution engine
//!
//! Each scheduled action has its own body:
//! - CreateBatch: instantiate configured items locally, create them remotely, re-key
//! - DailyReminder / FinalReminder: reconcile, then nag owners of open items
//! - FinalReport / DailyStats: reconcile, then post the aggregate
//!
//! Remote failures on individual items never abort a batch; the outcome and
//! the posted summary carry the partial counts.

use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::BotError;
use crate::gateway::{NotificationPayload, NotificationTarget, WorkItemDraft};
use crate::reconcile;
use crate::state::AppState;
use crate::store::is_placeholder;
use crate::types::{ActionKind, AggregateSnapshot, JobOutcome};
use crate::window::month_key;

/// Result of one batch-create run, rendered into the batch notification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub period: String,
    pub created: usize,
    /// Titles whose remote create failed; they stay tracked under placeholders.
    pub failed: Vec<String>,
    /// Item definitions rejected as invalid.
    pub skipped: usize,
}

impl BatchSummary {
    pub fn attempted(&self) -> usize {
        self.created + self.failed.len()
    }

    pub fn outcome(&self) -> JobOutcome {
        match (self.created, self.failed.len()) {
            (_, 0) => JobOutcome::Success,
            (0, _) => JobOutcome::Failed,
            _ => JobOutcome::Partial,
        }
    }
}

/// What an action body reports back to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionReport {
    pub action: ActionKind,
    pub outcome: JobOutcome,
    pub item_count: usize,
}

/// Due instant for remote items of the period containing `local_now`.
///
/// `due_day` is clamped to the month's last day.
pub fn due_time(
    tz: Tz,
    local_now: &DateTime<Tz>,
    due_day: u32,
    due_hour: u32,
) -> Result<DateTime<Utc>, BotError> {
    let (year, month) = (local_now.year(), local_now.month());
    let last_day = last_day_of_month(year, month)?;
    let day = due_day.clamp(1, last_day);
    tz.with_ymd_and_hms(year, month, day, due_hour.min(23), 0, 0)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| {
            BotError::Configuration(format!(
                "due time {}-{:02}-{:02} {:02}:00 does not exist in {}",
                year, month, day, due_hour, tz
            ))
        })
}

fn last_day_of_month(year: i32, month: u32) -> Result<u32, BotError> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .ok_or_else(|| BotError::Configuration(format!("invalid month {}-{}", year, month)))
}

/// Executor runs action bodies against the shared state
pub struct Executor {
    state: Arc<AppState>,
}

impl Executor {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Run one action to completion.
    ///
    /// Errors are reserved for failures that prevent the action from running
    /// at all; per-item and delivery failures are folded into the outcome.
    pub async fn execute(
        &self,
        action: ActionKind,
        now: DateTime<Utc>,
    ) -> Result<ActionReport, BotError> {
        let run_id = uuid::Uuid::new_v4();
        log::info!("Executing {} (run {})", action, run_id);

        let report = match action {
            ActionKind::CreateBatch => self.create_batch(now).await?,
            ActionKind::DailyReminder => self.remind(action, now, false).await,
            ActionKind::FinalReminder => self.remind(action, now, true).await,
            ActionKind::FinalReport => self.post_report(action, now, true).await,
            ActionKind::DailyStats => self.post_report(action, now, false).await,
        };

        log::info!(
            "Finished {} (run {}): {:?}, {} item(s)",
            action,
            run_id,
            report.outcome,
            report.item_count
        );
        Ok(report)
    }

    async fn create_batch(&self, now: DateTime<Utc>) -> Result<ActionReport, BotError> {
        let state = &self.state;
        let local_now = now.with_timezone(&state.tz);
        let period = month_key(&local_now);
        let archived = state.store.begin_period(&period)?;
        if archived > 0 {
            log::info!("Started period {} ({} items archived)", period, archived);
        }
        let due = due_time(
            state.tz,
            &local_now,
            state.config.due_day,
            state.config.due_hour,
        )?;

        let mut summary = BatchSummary {
            period: period.clone(),
            ..BatchSummary::default()
        };

        // Records an earlier run of this period left behind; each is reused once.
        let mut leftovers = state.store.items();

        for spec in &state.config.items {
            let title = match spec.validated_title() {
                Ok(title) => title,
                Err(e) => {
                    log::error!("Skipping item definition: {}", e);
                    summary.skipped += 1;
                    continue;
                }
            };

            let existing = leftovers
                .iter()
                .position(|item| item.title == title && item.category == spec.category)
                .map(|i| leftovers.swap_remove(i));
            let local_id = match existing {
                Some(item) if !is_placeholder(&item.id) => {
                    log::info!("{} already created as {}", title, item.id);
                    summary.created += 1;
                    continue;
                }
                Some(item) => item.id,
                None => state.store.insert_placeholder(
                    &title,
                    spec.category.clone(),
                    spec.resolved_owners(),
                    spec.doc_url.clone().or_else(|| state.config.document_url.clone()),
                    now,
                )?,
            };

            let draft = WorkItemDraft {
                title: title.clone(),
                description: spec.description.clone(),
                owners: spec.resolved_owners().into_iter().collect(),
                due,
                origin: spec.doc_url.clone().or_else(|| state.config.document_url.clone()),
            };

            match state.gateway.create_work_item(&draft).await {
                Ok(remote_id) => match state.store.rekey(&local_id, &remote_id) {
                    Ok(()) => summary.created += 1,
                    Err(e) => {
                        log::error!("Re-key {} -> {} failed: {}", local_id, remote_id, e);
                        summary.failed.push(title);
                    }
                },
                Err(e) => {
                    log::warn!(
                        "Remote create for {} failed, keeping {}: {} ({})",
                        title,
                        local_id,
                        e,
                        e.recovery_suggestion()
                    );
                    summary.failed.push(title);
                }
            }
        }

        let payload = state.renderer.batch_created(&summary);
        self.notify_chat(&payload).await;

        Ok(ActionReport {
            action: ActionKind::CreateBatch,
            outcome: summary.outcome(),
            item_count: summary.created,
        })
    }

    async fn remind(&self, action: ActionKind, now: DateTime<Utc>, final_call: bool) -> ActionReport {
        let snapshot = self.refresh(now).await;
        let pending = self.state.store.pending_items();
        if snapshot.total == 0 || pending.is_empty() {
            log::info!("{}: nothing pending, no reminder sent", action);
            return ActionReport {
                action,
                outcome: JobOutcome::Success,
                item_count: 0,
            };
        }

        let payload = self.state.renderer.reminder(&snapshot, &pending, final_call);
        let outcome = if self.notify_chat(&payload).await {
            JobOutcome::Success
        } else {
            JobOutcome::Failed
        };
        ActionReport {
            action,
            outcome,
            item_count: pending.len(),
        }
    }

    async fn post_report(
        &self,
        action: ActionKind,
        now: DateTime<Utc>,
        final_report: bool,
    ) -> ActionReport {
        let snapshot = self.refresh(now).await;
        if snapshot.total == 0 {
            log::info!("{}: no items tracked for {}, nothing to report", action, snapshot.period);
            return ActionReport {
                action,
                outcome: JobOutcome::Success,
                item_count: 0,
            };
        }

        let pending = self.state.store.pending_items();
        let mut payload = self.state.renderer.report(&snapshot, &pending, final_report);
        if let Some(png) = self.state.renderer.render_chart(&snapshot) {
            match self.state.gateway.upload_image(png).await {
                Ok(key) => payload = self.state.renderer.attach_image(payload, &key),
                Err(e) => log::warn!("{}: chart upload failed, sending without: {}", action, e),
            }
        }

        let outcome = if self.notify_chat(&payload).await {
            JobOutcome::Success
        } else {
            JobOutcome::Failed
        };
        ActionReport {
            action,
            outcome,
            item_count: snapshot.total,
        }
    }

    /// Pull remote state, then snapshot. A failed sweep falls back to local state.
    async fn refresh(&self, now: DateTime<Utc>) -> AggregateSnapshot {
        if let Err(e) = reconcile::reconcile(&self.state.store, self.state.gateway.as_ref(), now).await
        {
            log::warn!("Reconcile before notification failed, using local state: {}", e);
        }
        self.state.store.snapshot()
    }

    async fn notify_chat(&self, payload: &NotificationPayload) -> bool {
        let target = NotificationTarget::Chat(self.state.config.chat_id.clone());
        match self.state.gateway.send_notification(&target, payload).await {
            Ok(()) => true,
            Err(e) => {
                log::error!(
                    "Notification failed: {} ({})",
                    e,
                    e.recovery_suggestion()
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::{FakeGateway, FakeStatus};
    use crate::render::{CardRenderer, NotificationRenderer};
    use crate::types::{Config, WorkItem, WorkItemSpec};
    use std::sync::atomic::Ordering;

    fn spec(title: &str, owner: &str) -> WorkItemSpec {
        WorkItemSpec {
            title: Some(title.to_string()),
            owners: vec![owner.to_string()],
            category: Some("finance".to_string()),
            ..WorkItemSpec::default()
        }
    }

    fn config() -> Config {
        Config {
            chat_id: "oc_team".to_string(),
            items: vec![
                spec("Sales", "ou_a"),
                WorkItemSpec::default(),
                spec("Ops", "ou_b"),
            ],
            ..Config::default()
        }
    }

    fn setup(config: Config) -> (tempfile::TempDir, Arc<FakeGateway>, Executor, Arc<AppState>) {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(FakeGateway::default());
        let state = Arc::new(AppState::for_tests(config, dir.path(), gateway.clone()).unwrap());
        (dir, gateway, Executor::new(state.clone()), state)
    }

    /// Card renderer that also draws a (fake) PNG chart.
    struct ChartRenderer(CardRenderer);

    impl NotificationRenderer for ChartRenderer {
        fn batch_created(&self, summary: &BatchSummary) -> NotificationPayload {
            self.0.batch_created(summary)
        }

        fn reminder(
            &self,
            snapshot: &AggregateSnapshot,
            pending: &[WorkItem],
            final_call: bool,
        ) -> NotificationPayload {
            self.0.reminder(snapshot, pending, final_call)
        }

        fn report(
            &self,
            snapshot: &AggregateSnapshot,
            pending: &[WorkItem],
            final_report: bool,
        ) -> NotificationPayload {
            self.0.report(snapshot, pending, final_report)
        }

        fn render_chart(&self, _snapshot: &AggregateSnapshot) -> Option<Vec<u8>> {
            Some(b"\x89PNG\r\n".to_vec())
        }

        fn attach_image(&self, payload: NotificationPayload, image_key: &str) -> NotificationPayload {
            self.0.attach_image(payload, image_key)
        }
    }

    fn setup_with_chart() -> (tempfile::TempDir, Arc<FakeGateway>, Executor) {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(FakeGateway::default());
        let renderer = Arc::new(ChartRenderer(CardRenderer::new(None, 23)));
        let state =
            Arc::new(AppState::new(config(), dir.path(), gateway.clone(), renderer).unwrap());
        (dir, gateway, Executor::new(state))
    }

    fn last_payload(gateway: &FakeGateway) -> NotificationPayload {
        gateway.notifications.lock().last().unwrap().1.clone()
    }

    /// 2025-10-17 09:30 in Asia/Shanghai.
    fn batch_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 17, 1, 30, 0).unwrap()
    }

    #[test]
    fn test_due_time_in_zone() {
        let tz: Tz = "Asia/Shanghai".parse().unwrap();
        let local = batch_time().with_timezone(&tz);
        let due = due_time(tz, &local, 23, 17).unwrap();
        assert_eq!(due, Utc.with_ymd_and_hms(2025, 10, 23, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_due_day_clamped_to_month_end() {
        let tz: Tz = "UTC".parse().unwrap();
        let local = tz.with_ymd_and_hms(2025, 2, 10, 0, 0, 0).unwrap();
        let due = due_time(tz, &local, 31, 17).unwrap();
        assert_eq!(due, Utc.with_ymd_and_hms(2025, 2, 28, 17, 0, 0).unwrap());
    }

    #[test]
    fn test_batch_outcome() {
        let mut summary = BatchSummary::default();
        assert_eq!(summary.outcome(), JobOutcome::Success);
        summary.failed.push("x".into());
        assert_eq!(summary.outcome(), JobOutcome::Failed);
        summary.created = 1;
        assert_eq!(summary.outcome(), JobOutcome::Partial);
    }

    #[tokio::test]
    async fn test_create_batch_rekeys_and_skips_invalid() {
        let (_dir, gateway, executor, state) = setup(config());

        let report = executor.execute(ActionKind::CreateBatch, batch_time()).await.unwrap();
        assert_eq!(report.outcome, JobOutcome::Success);
        assert_eq!(report.item_count, 2);

        let items = state.store.items();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| !is_placeholder(&i.id)));
        assert_eq!(state.store.period(), "2025-10");

        let created = gateway.created.lock().clone();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].due, Utc.with_ymd_and_hms(2025, 10, 23, 9, 0, 0).unwrap());
        assert_eq!(gateway.notification_texts(), vec!["Report tasks 2025-10"]);
    }

    #[tokio::test]
    async fn test_partial_batch_keeps_placeholder_and_reports() {
        let (_dir, gateway, executor, state) = setup(config());
        gateway.fail_create_titles.lock().insert("Ops".to_string());

        let report = executor.execute(ActionKind::CreateBatch, batch_time()).await.unwrap();
        assert_eq!(report.outcome, JobOutcome::Partial);
        assert_eq!(report.item_count, 1);

        let ops = state
            .store
            .items()
            .into_iter()
            .find(|i| i.title == "Ops")
            .unwrap();
        assert!(is_placeholder(&ops.id));
        assert_eq!(gateway.notifications.lock().len(), 1);

        // A re-run creates only what is missing.
        gateway.fail_create_titles.lock().clear();
        let rerun = executor.execute(ActionKind::CreateBatch, batch_time()).await.unwrap();
        assert_eq!(rerun.outcome, JobOutcome::Success);
        assert_eq!(gateway.created.lock().len(), 2);
        assert_eq!(state.store.items().len(), 2);
        assert!(state.store.items().iter().all(|i| !is_placeholder(&i.id)));
    }

    #[tokio::test]
    async fn test_reminder_reconciles_before_sending() {
        let (_dir, gateway, executor, state) = setup(config());
        executor.execute(ActionKind::CreateBatch, batch_time()).await.unwrap();
        let sales = state
            .store
            .items()
            .into_iter()
            .find(|i| i.title == "Sales")
            .unwrap();
        gateway.set_status(&sales.id, FakeStatus::Done);

        let report = executor
            .execute(ActionKind::DailyReminder, batch_time())
            .await
            .unwrap();
        assert_eq!(report.outcome, JobOutcome::Success);
        assert_eq!(report.item_count, 1);
        assert!(state.store.get(&sales.id).unwrap().completed);
    }

    #[tokio::test]
    async fn test_reminder_silent_when_nothing_pending() {
        let (_dir, gateway, executor, _state) = setup(config());
        let report = executor
            .execute(ActionKind::FinalReminder, batch_time())
            .await
            .unwrap();
        assert_eq!(report.item_count, 0);
        assert!(gateway.notifications.lock().is_empty());
    }

    #[tokio::test]
    async fn test_report_delivery_failure_is_failed_outcome() {
        let (_dir, gateway, executor, _state) = setup(config());
        executor.execute(ActionKind::CreateBatch, batch_time()).await.unwrap();
        gateway.fail_notifications.store(true, Ordering::SeqCst);

        let report = executor.execute(ActionKind::FinalReport, batch_time()).await.unwrap();
        assert_eq!(report.outcome, JobOutcome::Failed);
        assert_eq!(report.item_count, 2);
    }

    #[tokio::test]
    async fn test_new_period_archives_previous_items() {
        let (_dir, _gateway, executor, state) = setup(config());
        executor.execute(ActionKind::CreateBatch, batch_time()).await.unwrap();
        let next_month = Utc.with_ymd_and_hms(2025, 11, 17, 1, 30, 0).unwrap();
        executor.execute(ActionKind::CreateBatch, next_month).await.unwrap();

        assert_eq!(state.store.period(), "2025-11");
        assert_eq!(state.store.items().len(), 2);
        assert_eq!(state.store.archived("2025-10").len(), 2);
    }

    #[tokio::test]
    async fn test_daily_stats_embeds_uploaded_chart() {
        let (_dir, gateway, executor) = setup_with_chart();
        executor.execute(ActionKind::CreateBatch, batch_time()).await.unwrap();

        let report = executor.execute(ActionKind::DailyStats, batch_time()).await.unwrap();
        assert_eq!(report.outcome, JobOutcome::Success);
        assert_eq!(report.item_count, 2);
        assert_eq!(gateway.uploads.load(Ordering::SeqCst), 1);

        let payload = last_payload(&gateway);
        assert_eq!(payload.summary(), "Daily progress 2025-10");
        assert_eq!(payload.content["elements"][1]["tag"], "img");
        assert_eq!(payload.content["elements"][1]["img_key"], "img_fake");
    }

    #[tokio::test]
    async fn test_chart_upload_failure_still_sends_report() {
        let (_dir, gateway, executor) = setup_with_chart();
        executor.execute(ActionKind::CreateBatch, batch_time()).await.unwrap();
        gateway.fail_upload.store(true, Ordering::SeqCst);

        let report = executor.execute(ActionKind::DailyStats, batch_time()).await.unwrap();
        assert_eq!(report.outcome, JobOutcome::Success);
        assert_eq!(gateway.notifications.lock().len(), 2);

        let payload = last_payload(&gateway);
        assert_eq!(payload.summary(), "Daily progress 2025-10");
        let elements = payload.content["elements"].as_array().unwrap();
        assert!(elements.iter().all(|e| e["tag"] != "img"));
    }

    #[tokio::test]
    async fn test_daily_stats_without_chart_and_empty_period() {
        let (_dir, gateway, executor, _state) = setup(config());
        let empty = executor.execute(ActionKind::DailyStats, batch_time()).await.unwrap();
        assert_eq!(empty.item_count, 0);
        assert!(gateway.notifications.lock().is_empty());

        executor.execute(ActionKind::CreateBatch, batch_time()).await.unwrap();
        let report = executor.execute(ActionKind::DailyStats, batch_time()).await.unwrap();
        assert_eq!(report.outcome, JobOutcome::Success);
        assert_eq!(gateway.uploads.load(Ordering::SeqCst), 0);
        assert_eq!(last_payload(&gateway).summary(), "Daily progress 2025-10");
    }

    #[tokio::test]
    async fn test_rerun_keeps_items_sharing_a_title_apart() {
        let mut config = config();
        config.items = vec![
            spec("Monthly summary", "ou_a"),
            WorkItemSpec {
                category: Some("ops".to_string()),
                ..spec("Monthly summary", "ou_b")
            },
            spec("Monthly summary", "ou_c"),
        ];
        let (_dir, gateway, executor, state) = setup(config);
        gateway.fail_create_titles.lock().insert("Monthly summary".to_string());
        executor.execute(ActionKind::CreateBatch, batch_time()).await.unwrap();
        assert_eq!(state.store.items().len(), 3);

        gateway.fail_create_titles.lock().clear();
        let rerun = executor.execute(ActionKind::CreateBatch, batch_time()).await.unwrap();
        assert_eq!(rerun.outcome, JobOutcome::Success);
        assert_eq!(rerun.item_count, 3);
        let items = state.store.items();
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|i| !is_placeholder(&i.id)));
        assert_eq!(gateway.created.lock().len(), 3);

        let again = executor.execute(ActionKind::CreateBatch, batch_time()).await.unwrap();
        assert_eq!(again.item_count, 3);
        assert_eq!(gateway.created.lock().len(), 3);
    }
}
