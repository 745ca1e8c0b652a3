//! Interaction dedup log.
//!
//! A chat command that changes state is applied at most once per
//! (actor, target, action, calendar day). Records older than the retention
//! window are pruned whenever the log is written.

use std::path::PathBuf;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::document::JsonDocument;
use crate::error::BotError;
use crate::types::{InteractionKey, InteractionRecord};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionDocument {
    #[serde(default)]
    pub records: Vec<InteractionRecord>,
}

pub struct InteractionLog {
    doc: JsonDocument<InteractionDocument>,
    retention_days: i64,
}

impl InteractionLog {
    pub fn open(path: impl Into<PathBuf>, retention_days: i64) -> Result<Self, BotError> {
        Ok(Self {
            doc: JsonDocument::open(path)?,
            retention_days: retention_days.max(1),
        })
    }

    /// Atomically test for `key` and record it if absent.
    ///
    /// Returns `true` when the key was already present (the caller must not
    /// apply the effect again). Check and insert happen under one lock, so two
    /// concurrent callers cannot both see `false`.
    pub fn check_and_record(
        &self,
        key: &InteractionKey,
        now: DateTime<Utc>,
    ) -> Result<bool, BotError> {
        let cutoff = self.cutoff(key.day);
        self.doc.mutate(|doc| {
            if doc.records.iter().any(|r| key.matches(r)) {
                return Ok((true, false));
            }
            doc.records.retain(|r| r.day >= cutoff);
            doc.records.push(InteractionRecord {
                actor: key.actor.clone(),
                target: key.target.clone(),
                action: key.action.clone(),
                day: key.day,
                recorded_at: now,
            });
            Ok((false, true))
        })
    }

    /// Remove a record, e.g. when the effect it guarded failed to apply and
    /// the actor should be allowed to retry the same day.
    pub fn forget(&self, key: &InteractionKey) -> Result<bool, BotError> {
        self.doc.mutate(|doc| {
            let before = doc.records.len();
            doc.records.retain(|r| !key.matches(r));
            let removed = doc.records.len() != before;
            Ok((removed, removed))
        })
    }

    #[cfg(test)]
    pub fn contains(&self, key: &InteractionKey) -> bool {
        self.doc.read(|doc| doc.records.iter().any(|r| key.matches(r)))
    }

    /// Drop records older than the retention window relative to `today`.
    pub fn prune(&self, today: NaiveDate) -> Result<usize, BotError> {
        let cutoff = self.cutoff(today);
        self.doc.mutate(|doc| {
            let before = doc.records.len();
            doc.records.retain(|r| r.day >= cutoff);
            let removed = before - doc.records.len();
            Ok((removed, removed > 0))
        })
    }

    pub fn record_count(&self) -> usize {
        self.doc.read(|doc| doc.records.len())
    }

    fn cutoff(&self, today: NaiveDate) -> NaiveDate {
        today - Duration::days(self.retention_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 10, d).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 20, 8, 0, 0).unwrap()
    }

    fn log() -> (tempfile::TempDir, InteractionLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = InteractionLog::open(dir.path().join("interactions.json"), 7).unwrap();
        (dir, log)
    }

    #[test]
    fn test_second_check_same_day_is_seen() {
        let (_dir, log) = log();
        let key = InteractionKey::new("ou_u1", "all", "mark_complete", day(20));
        assert!(!log.check_and_record(&key, now()).unwrap());
        assert!(log.check_and_record(&key, now()).unwrap());
        assert_eq!(log.record_count(), 1);
    }

    #[test]
    fn test_next_day_is_not_seen() {
        let (_dir, log) = log();
        let today = InteractionKey::new("ou_u1", "all", "mark_complete", day(20));
        let tomorrow = InteractionKey::new("ou_u1", "all", "mark_complete", day(21));
        assert!(!log.check_and_record(&today, now()).unwrap());
        assert!(!log.check_and_record(&tomorrow, now()).unwrap());
    }

    #[test]
    fn test_distinct_actor_target_action_are_independent() {
        let (_dir, log) = log();
        let base = InteractionKey::new("ou_u1", "all", "mark_complete", day(20));
        assert!(!log.check_and_record(&base, now()).unwrap());
        for key in [
            InteractionKey::new("ou_u2", "all", "mark_complete", day(20)),
            InteractionKey::new("ou_u1", "t1", "mark_complete", day(20)),
            InteractionKey::new("ou_u1", "all", "reopen", day(20)),
        ] {
            assert!(!log.check_and_record(&key, now()).unwrap());
        }
    }

    #[test]
    fn test_records_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("interactions.json");
        let key = InteractionKey::new("ou_u1", "all", "mark_complete", day(20));
        {
            let log = InteractionLog::open(&path, 7).unwrap();
            log.check_and_record(&key, now()).unwrap();
        }
        let log = InteractionLog::open(&path, 7).unwrap();
        assert!(log.contains(&key));
        assert!(log.check_and_record(&key, now()).unwrap());
    }

    #[test]
    fn test_old_records_pruned_on_write() {
        let (_dir, log) = log();
        let old = InteractionKey::new("ou_u1", "all", "mark_complete", day(1));
        log.check_and_record(&old, now()).unwrap();
        let fresh = InteractionKey::new("ou_u1", "all", "mark_complete", day(20));
        log.check_and_record(&fresh, now()).unwrap();
        assert!(!log.contains(&old));
        assert!(log.contains(&fresh));
    }

    #[test]
    fn test_prune_keeps_retention_window() {
        let (_dir, log) = log();
        for d in [10, 12, 14, 20] {
            let key = InteractionKey::new("ou_u1", format!("t{}", d), "mark_complete", day(d));
            log.doc
                .mutate(|doc| {
                    doc.records.push(InteractionRecord {
                        actor: key.actor.clone(),
                        target: key.target.clone(),
                        action: key.action.clone(),
                        day: key.day,
                        recorded_at: now(),
                    });
                    Ok(((), true))
                })
                .unwrap();
        }
        assert_eq!(log.prune(day(20)).unwrap(), 2);
        assert_eq!(log.record_count(), 2);
    }

    #[test]
    fn test_forget_allows_retry() {
        let (_dir, log) = log();
        let key = InteractionKey::new("ou_u1", "all", "mark_complete", day(20));
        log.check_and_record(&key, now()).unwrap();
        assert!(log.forget(&key).unwrap());
        assert!(!log.check_and_record(&key, now()).unwrap());
    }
}
