//! Pull completion state from the platform into the local store.
//!
//! Lookups happen outside any store lock; the collected statuses are then
//! applied in a single store transaction. An item the platform reports as
//! unknown is kept untouched, and a transient failure on one item does not
//! stop the others.

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::BotError;
use crate::gateway::PlatformGateway;
use crate::store::{RemoteObservation, WorkItemStore};
use crate::types::RemoteStatus;

/// Result of one remote lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Found(RemoteStatus),
    NotFound,
    Transient(String),
}

impl From<Result<RemoteStatus, BotError>> for LookupOutcome {
    fn from(result: Result<RemoteStatus, BotError>) -> Self {
        match result {
            Ok(status) => LookupOutcome::Found(status),
            Err(BotError::NotFound(_)) => LookupOutcome::NotFound,
            Err(e) => LookupOutcome::Transient(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Items looked up remotely.
    pub checked: usize,
    /// Items whose local completion state changed.
    pub updated: usize,
    pub not_found: usize,
    pub failed: usize,
    /// Placeholder items that were never created remotely.
    pub skipped: usize,
    /// Items changed locally during the sweep; their remote status was dropped.
    pub raced: usize,
}

/// Reconcile every item of the store using `lookup` for remote state.
pub async fn reconcile_with<F, Fut>(
    store: &WorkItemStore,
    now: DateTime<Utc>,
    mut lookup: F,
) -> Result<ReconcileReport, BotError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = LookupOutcome>,
{
    let (targets, placeholders) = store.remote_completion();
    let mut report = ReconcileReport {
        skipped: placeholders,
        ..ReconcileReport::default()
    };
    let mut found = Vec::new();

    for (id, seen_completed) in targets {
        report.checked += 1;
        match lookup(id.clone()).await {
            LookupOutcome::Found(status) => found.push(RemoteObservation {
                id,
                seen_completed,
                status,
            }),
            LookupOutcome::NotFound => {
                log::debug!("Reconcile: {} not found remotely, keeping local state", id);
                report.not_found += 1;
            }
            LookupOutcome::Transient(reason) => {
                log::warn!("Reconcile: lookup for {} failed: {}", id, reason);
                report.failed += 1;
            }
        }
    }

    let applied = store.apply_remote_statuses(&found, now)?;
    report.updated = applied.changed.len();
    report.raced = applied.raced.len();
    for id in &applied.changed {
        log::info!("Reconcile: {} updated from remote", id);
    }
    for id in &applied.raced {
        log::info!("Reconcile: {} changed locally during the sweep, keeping local state", id);
    }
    Ok(report)
}

/// Reconcile against the platform gateway.
pub async fn reconcile(
    store: &WorkItemStore,
    gateway: &dyn PlatformGateway,
    now: DateTime<Utc>,
) -> Result<ReconcileReport, BotError> {
    let report = reconcile_with(store, now, |id| async move {
        LookupOutcome::from(gateway.get_work_item_status(&id).await)
    })
    .await?;
    log::info!(
        "Reconcile finished: checked={} updated={} not_found={} failed={} skipped={} raced={}",
        report.checked,
        report.updated,
        report.not_found,
        report.failed,
        report.skipped,
        report.raced
    );
    Ok(report)
}
