//! Scheduler for calendar-window action execution
//!
//! Manages the recurring duty cycle with support for:
//! - Day-range + hour:minute windows evaluated in the configured timezone
//! - At-most-once firing per (action, period) through the job ledger
//! - Missed minutes after a stall or sleep (evaluated if within the grace period)
//! - Periodic reconciliation against the platform
//! - Operator re-runs outside the window

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};

use crate::error::BotError;
use crate::executor::{ActionReport, Executor};
use crate::reconcile;
use crate::state::AppState;
use crate::types::{ActionKind, JobOutcome, PeriodGranularity};
use crate::window::{is_due, period_key};

/// Minutes older than this are not caught up after a stall (2 hours)
const MISSED_MINUTE_GRACE_PERIOD_MINS: i64 = 120;

pub struct Scheduler {
    state: Arc<AppState>,
    executor: Executor,
}

impl Scheduler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            executor: Executor::new(state.clone()),
            state,
        }
    }

    /// Start the scheduler loop
    ///
    /// Runs indefinitely. Each tick evaluates every minute since the previous
    /// tick, so a long action or a suspended host does not skip a window.
    pub async fn run(&self) {
        let tick = Duration::from_secs(self.state.config.tick_seconds.max(1));
        let reconcile_every = TimeDelta::minutes(i64::from(
            self.state.config.reconcile_interval_minutes.max(1),
        ));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut last_minute: Option<DateTime<Utc>> = None;
        let mut last_reconcile = Utc::now();

        log::info!(
            "Scheduler started: {} rule(s), tick {:?}, timezone {}",
            self.state.rules.len(),
            tick,
            self.state.tz
        );

        loop {
            interval.tick().await;
            let now = Utc::now();

            for minute in minutes_to_evaluate(last_minute, now) {
                self.tick(minute).await;
                last_minute = Some(minute);
            }

            if now - last_reconcile >= reconcile_every {
                self.reconcile(now).await;
                last_reconcile = now;
            }
        }
    }

    /// Evaluate every rule at `now` and run the ones due and unclaimed.
    ///
    /// Actions run one after another to completion.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<ActionReport> {
        let local = now.with_timezone(&self.state.tz);
        let mut reports = Vec::new();

        for rule in &self.state.rules {
            if !is_due(rule, &local) {
                continue;
            }
            let period = period_key(rule.period, &local);
            match self.state.ledger.try_claim(rule.action, &period, now) {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!("{} already claimed for {}, skipping", rule.action, period);
                    continue;
                }
                Err(e) => {
                    log::error!("Ledger claim for {} {} failed: {}", rule.action, period, e);
                    continue;
                }
            }

            log::info!("Claimed {} for period {}", rule.action, period);
            let report = match self.executor.execute(rule.action, now).await {
                Ok(report) => report,
                Err(e) => {
                    log::error!(
                        "{} for {} failed: {} ({})",
                        rule.action,
                        period,
                        e,
                        e.recovery_suggestion()
                    );
                    ActionReport {
                        action: rule.action,
                        outcome: JobOutcome::Failed,
                        item_count: 0,
                    }
                }
            };

            if let Err(e) = self.state.ledger.finalize(
                rule.action,
                &period,
                report.outcome,
                report.item_count,
                Utc::now(),
            ) {
                log::error!("Ledger finalize for {} {} failed: {}", rule.action, period, e);
            }
            reports.push(report);
        }

        reports
    }

    async fn reconcile(&self, now: DateTime<Utc>) {
        if let Err(e) = reconcile::reconcile(&self.state.store, self.state.gateway.as_ref(), now).await
        {
            log::warn!("Periodic reconcile failed: {}", e);
        }
        match self.state.dedup.prune(now.with_timezone(&self.state.tz).date_naive()) {
            Ok(0) => {}
            Ok(removed) => log::debug!(
                "Pruned {} interaction record(s), {} kept",
                removed,
                self.state.dedup.record_count()
            ),
            Err(e) => log::warn!("Interaction log prune failed: {}", e),
        }
    }

    /// Run `action` now for its current period, bypassing the claim.
    ///
    /// The outcome is recorded in the ledger; an existing success is never
    /// downgraded.
    pub async fn run_manual(
        &self,
        action: ActionKind,
        now: DateTime<Utc>,
    ) -> Result<(String, ActionReport), BotError> {
        let granularity = self
            .state
            .rules
            .iter()
            .find(|r| r.action == action)
            .map(|r| r.period)
            .unwrap_or(PeriodGranularity::Month);
        let period = period_key(granularity, &now.with_timezone(&self.state.tz));

        log::info!("Manual run of {} for period {}", action, period);
        let report = self.executor.execute(action, now).await?;
        self.state.ledger.record_manual_run(
            action,
            &period,
            report.outcome,
            report.item_count,
            Utc::now(),
        )?;
        Ok((period, report))
    }
}

/// Whole minutes in `(last, now]` to evaluate, oldest first.
///
/// The first call evaluates only the current minute. Minutes older than the
/// grace period are dropped.
pub fn minutes_to_evaluate(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let current = match now.duration_trunc(TimeDelta::minutes(1)) {
        Ok(minute) => minute,
        Err(_) => return vec![now],
    };
    let Some(last) = last else {
        return vec![current];
    };
    if current <= last {
        return Vec::new();
    }

    let earliest = current - TimeDelta::minutes(MISSED_MINUTE_GRACE_PERIOD_MINS);
    let mut minute = last + TimeDelta::minutes(1);
    if minute < earliest {
        log::warn!(
            "Scheduler stalled since {}; skipping minutes before {}",
            last,
            earliest
        );
        minute = earliest;
    }

    let mut minutes = Vec::new();
    while minute <= current {
        minutes.push(minute);
        minute += TimeDelta::minutes(1);
    }
    minutes
}
