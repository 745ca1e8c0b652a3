//! Job ledger: at-most-once firing per (action, period).
//!
//! The claim is persisted before the action body runs. A crash between
//! `try_claim` and `finalize` leaves the period marked `attempted`; it is not
//! retried automatically. `record_manual_run` is the operator recovery path.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::JsonDocument;
use crate::error::BotError;
use crate::types::{ActionKind, JobLedgerEntry, JobOutcome};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerDocument {
    /// Keyed by `"<period>/<action>"`.
    #[serde(default)]
    pub entries: BTreeMap<String, JobLedgerEntry>,
}

fn entry_key(action: ActionKind, period: &str) -> String {
    format!("{}/{}", period, action)
}

pub struct JobLedger {
    doc: JsonDocument<LedgerDocument>,
}

impl JobLedger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BotError> {
        Ok(Self {
            doc: JsonDocument::open(path)?,
        })
    }

    /// Persist an `attempted` entry if none exists for `(action, period)`.
    ///
    /// Returns `Ok(false)` when the period is already claimed; that is the
    /// normal "skip, already done" signal, not an error.
    pub fn try_claim(
        &self,
        action: ActionKind,
        period: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, BotError> {
        let key = entry_key(action, period);
        self.doc.mutate(|doc| {
            if doc.entries.contains_key(&key) {
                return Ok((false, false));
            }
            doc.entries.insert(
                key,
                JobLedgerEntry {
                    action,
                    period: period.to_string(),
                    fired_at: now,
                    outcome: JobOutcome::Attempted,
                    item_count: 0,
                    finalized_at: None,
                    manual: false,
                },
            );
            Ok((true, true))
        })
    }

    /// Record the outcome of a claimed firing.
    ///
    /// Only `attempted` entries are upgraded; a finalized entry is left as is
    /// (`Ok(false)`). Finalizing an unclaimed period is an error.
    pub fn finalize(
        &self,
        action: ActionKind,
        period: &str,
        outcome: JobOutcome,
        item_count: usize,
        now: DateTime<Utc>,
    ) -> Result<bool, BotError> {
        let key = entry_key(action, period);
        self.doc.mutate(|doc| {
            let entry = doc.entries.get_mut(&key).ok_or_else(|| {
                BotError::Configuration(format!("{} for {} was never claimed", action, period))
            })?;
            if entry.outcome != JobOutcome::Attempted {
                log::warn!(
                    "Ledger entry {} already finalized as {:?}; keeping it",
                    key,
                    entry.outcome
                );
                return Ok((false, false));
            }
            entry.outcome = outcome;
            entry.item_count = item_count;
            entry.finalized_at = Some(now);
            Ok((true, true))
        })
    }

    /// Record an operator-triggered re-run outside the normal claim path.
    ///
    /// Inserts the entry if the period was never claimed; otherwise replaces
    /// the outcome unless the existing entry is already a success.
    pub fn record_manual_run(
        &self,
        action: ActionKind,
        period: &str,
        outcome: JobOutcome,
        item_count: usize,
        now: DateTime<Utc>,
    ) -> Result<(), BotError> {
        let key = entry_key(action, period);
        self.doc.mutate(|doc| {
            match doc.entries.get_mut(&key) {
                Some(entry) if entry.outcome == JobOutcome::Success => {
                    log::info!("Manual run of {} for {}: entry already successful", action, period);
                    return Ok(((), false));
                }
                Some(entry) => {
                    entry.outcome = outcome;
                    entry.item_count = item_count;
                    entry.finalized_at = Some(now);
                    entry.manual = true;
                }
                None => {
                    doc.entries.insert(
                        key,
                        JobLedgerEntry {
                            action,
                            period: period.to_string(),
                            fired_at: now,
                            outcome,
                            item_count,
                            finalized_at: Some(now),
                            manual: true,
                        },
                    );
                }
            }
            Ok(((), true))
        })
    }

    pub fn get(&self, action: ActionKind, period: &str) -> Option<JobLedgerEntry> {
        let key = entry_key(action, period);
        self.doc.read(|doc| doc.entries.get(&key).cloned())
    }

    /// Most recent entries first.
    pub fn history(&self, limit: usize) -> Vec<JobLedgerEntry> {
        self.doc.read(|doc| {
            let mut entries: Vec<JobLedgerEntry> = doc.entries.values().cloned().collect();
            entries.sort_by(|a, b| b.fired_at.cmp(&a.fired_at));
            entries.truncate(limit);
            entries
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, day, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_claim_twice_returns_true_then_false() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JobLedger::open(dir.path().join("ledger.json")).unwrap();
        assert!(ledger.try_claim(ActionKind::CreateBatch, "2025-10", ts(17)).unwrap());
        assert!(!ledger.try_claim(ActionKind::CreateBatch, "2025-10", ts(18)).unwrap());
    }

    #[test]
    fn test_claim_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        {
            let ledger = JobLedger::open(&path).unwrap();
            assert!(ledger.try_claim(ActionKind::CreateBatch, "2025-10", ts(17)).unwrap());
        }
        let ledger = JobLedger::open(&path).unwrap();
        assert!(!ledger.try_claim(ActionKind::CreateBatch, "2025-10", ts(17)).unwrap());
        let entry = ledger.get(ActionKind::CreateBatch, "2025-10").unwrap();
        assert_eq!(entry.outcome, JobOutcome::Attempted);
    }

    #[test]
    fn test_claims_are_per_action_and_period() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JobLedger::open(dir.path().join("ledger.json")).unwrap();
        assert!(ledger.try_claim(ActionKind::CreateBatch, "2025-10", ts(17)).unwrap());
        assert!(ledger.try_claim(ActionKind::FinalReport, "2025-10", ts(17)).unwrap());
        assert!(ledger.try_claim(ActionKind::CreateBatch, "2025-11", ts(17)).unwrap());
    }

    #[test]
    fn test_finalize_upgrades_attempted_once() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JobLedger::open(dir.path().join("ledger.json")).unwrap();
        ledger.try_claim(ActionKind::CreateBatch, "2025-10", ts(17)).unwrap();

        assert!(ledger
            .finalize(ActionKind::CreateBatch, "2025-10", JobOutcome::Success, 12, ts(17))
            .unwrap());
        assert!(!ledger
            .finalize(ActionKind::CreateBatch, "2025-10", JobOutcome::Failed, 0, ts(18))
            .unwrap());

        let entry = ledger.get(ActionKind::CreateBatch, "2025-10").unwrap();
        assert_eq!(entry.outcome, JobOutcome::Success);
        assert_eq!(entry.item_count, 12);
    }

    #[test]
    fn test_finalize_without_claim_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JobLedger::open(dir.path().join("ledger.json")).unwrap();
        assert!(ledger
            .finalize(ActionKind::FinalReport, "2025-10", JobOutcome::Success, 0, ts(23))
            .is_err());
    }

    #[test]
    fn test_manual_run_upgrades_stuck_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JobLedger::open(dir.path().join("ledger.json")).unwrap();
        ledger.try_claim(ActionKind::CreateBatch, "2025-10", ts(17)).unwrap();

        ledger
            .record_manual_run(ActionKind::CreateBatch, "2025-10", JobOutcome::Success, 5, ts(20))
            .unwrap();

        let entry = ledger.get(ActionKind::CreateBatch, "2025-10").unwrap();
        assert_eq!(entry.outcome, JobOutcome::Success);
        assert!(entry.manual);
        assert_eq!(entry.fired_at, ts(17));
    }

    #[test]
    fn test_manual_run_never_downgrades_success() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JobLedger::open(dir.path().join("ledger.json")).unwrap();
        ledger.try_claim(ActionKind::FinalReport, "2025-10", ts(23)).unwrap();
        ledger
            .finalize(ActionKind::FinalReport, "2025-10", JobOutcome::Success, 3, ts(23))
            .unwrap();
        ledger
            .record_manual_run(ActionKind::FinalReport, "2025-10", JobOutcome::Failed, 0, ts(24))
            .unwrap();
        assert_eq!(
            ledger.get(ActionKind::FinalReport, "2025-10").unwrap().outcome,
            JobOutcome::Success
        );
    }

    #[test]
    fn test_history_is_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JobLedger::open(dir.path().join("ledger.json")).unwrap();
        ledger.try_claim(ActionKind::CreateBatch, "2025-10", ts(17)).unwrap();
        ledger.try_claim(ActionKind::FinalReport, "2025-10", ts(23)).unwrap();
        let history = ledger.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, ActionKind::FinalReport);
    }
}
