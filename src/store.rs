//! Work-item store: local mirror of the period's tracked items.
//!
//! One JSON document holds the active period, its items keyed by identifier,
//! the last computed aggregate, and items archived from earlier periods.
//! Items start under a placeholder identifier (`task_<period>_<n>`) and are
//! re-keyed once the platform assigns a durable one.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::JsonDocument;
use crate::error::BotError;
use crate::types::{
    AggregateSnapshot, CategoryTally, RemoteStatus, WorkItem, WorkItemPatch, UNCATEGORIZED,
};

/// Remote state of one item and the local completion seen before the lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObservation {
    pub id: String,
    pub seen_completed: bool,
    pub status: RemoteStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteApplyResult {
    pub changed: Vec<String>,
    /// Items whose local completion changed while the lookup was in flight.
    pub raced: Vec<String>,
}

/// Prefix of locally minted identifiers. Never remote-resolvable.
pub const PLACEHOLDER_PREFIX: &str = "task_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDocument {
    #[serde(default)]
    pub period: String,
    #[serde(default)]
    pub items: BTreeMap<String, WorkItem>,
    /// Last computed aggregate, kept for external readers of the file.
    #[serde(default)]
    pub snapshot: AggregateSnapshot,
    #[serde(default)]
    pub archive: BTreeMap<String, BTreeMap<String, WorkItem>>,
}

pub fn is_placeholder(id: &str) -> bool {
    id.starts_with(PLACEHOLDER_PREFIX)
}

/// Two-decimal percentage of `completed / total`, 0.0 when there is nothing to count.
pub fn completion_rate(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let raw = completed as f64 / total as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}

/// Project an aggregate from an item set. O(n).
pub fn compute_snapshot<'a>(
    period: &str,
    items: impl IntoIterator<Item = &'a WorkItem>,
) -> AggregateSnapshot {
    let mut total = 0;
    let mut completed = 0;
    let mut by_category: BTreeMap<String, CategoryTally> = BTreeMap::new();

    for item in items {
        total += 1;
        let tally = by_category
            .entry(
                item.category
                    .clone()
                    .unwrap_or_else(|| UNCATEGORIZED.to_string()),
            )
            .or_default();
        tally.total += 1;
        if item.completed {
            completed += 1;
            tally.completed += 1;
        }
    }

    AggregateSnapshot {
        period: period.to_string(),
        total,
        completed,
        rate: completion_rate(completed, total),
        by_category,
    }
}

fn refresh_snapshot(doc: &mut StoreDocument) {
    doc.snapshot = compute_snapshot(&doc.period, doc.items.values());
}

fn set_completed(item: &mut WorkItem, completed: bool, at: Option<DateTime<Utc>>) -> bool {
    if item.completed == completed {
        return false;
    }
    item.completed = completed;
    item.completed_at = if completed { at } else { None };
    true
}

pub struct WorkItemStore {
    doc: JsonDocument<StoreDocument>,
}

impl WorkItemStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BotError> {
        Ok(Self {
            doc: JsonDocument::open(path)?,
        })
    }

    pub fn period(&self) -> String {
        self.doc.read(|doc| doc.period.clone())
    }

    /// Make `period` the active cycle.
    ///
    /// Items of a different previous period move to the archive; returns how
    /// many were moved.
    pub fn begin_period(&self, period: &str) -> Result<usize, BotError> {
        self.doc.mutate(|doc| {
            if doc.period == period {
                return Ok((0, false));
            }
            let moved = doc.items.len();
            if moved > 0 {
                let old = std::mem::take(&mut doc.items);
                doc.archive.entry(doc.period.clone()).or_default().extend(old);
                log::info!("Archived {} work items from period {}", moved, doc.period);
            }
            doc.period = period.to_string();
            refresh_snapshot(doc);
            Ok((moved, true))
        })
    }

    /// Insert-or-replace by identifier. Fields left `None` in the patch keep
    /// their stored value. A new record needs a title.
    pub fn upsert(&self, patch: WorkItemPatch) -> Result<WorkItem, BotError> {
        self.doc.mutate(|doc| {
            let item = match doc.items.get_mut(&patch.id) {
                Some(existing) => {
                    if let Some(title) = patch.title {
                        existing.title = title;
                    }
                    if patch.category.is_some() {
                        existing.category = patch.category;
                    }
                    if let Some(owners) = patch.owners {
                        existing.owners = owners;
                    }
                    if let Some(created_at) = patch.created_at {
                        existing.created_at = created_at;
                    }
                    if patch.origin.is_some() {
                        existing.origin = patch.origin;
                    }
                    if let Some(completed) = patch.completed {
                        let at = patch.completed_at.flatten().or(existing.completed_at);
                        set_completed(existing, completed, at.or_else(|| Some(Utc::now())));
                    } else if let Some(completed_at) = patch.completed_at {
                        if existing.completed {
                            existing.completed_at = completed_at;
                        }
                    }
                    existing.clone()
                }
                None => {
                    let title = patch.title.ok_or_else(|| {
                        BotError::Configuration(format!("new work item {} has no title", patch.id))
                    })?;
                    let completed = patch.completed.unwrap_or(false);
                    let item = WorkItem {
                        id: patch.id.clone(),
                        title,
                        category: patch.category,
                        owners: patch.owners.unwrap_or_default(),
                        completed,
                        created_at: patch.created_at.unwrap_or_else(Utc::now),
                        completed_at: if completed {
                            patch.completed_at.flatten().or_else(|| Some(Utc::now()))
                        } else {
                            None
                        },
                        origin: patch.origin,
                    };
                    doc.items.insert(item.id.clone(), item.clone());
                    item
                }
            };
            refresh_snapshot(doc);
            Ok((item, true))
        })
    }

    /// Insert a new item under a fresh placeholder identifier for the active period.
    pub fn insert_placeholder(
        &self,
        title: &str,
        category: Option<String>,
        owners: BTreeSet<String>,
        origin: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<String, BotError> {
        self.doc.mutate(|doc| {
            let mut n = doc.items.len() + 1;
            let id = loop {
                let candidate = format!("{}{}_{}", PLACEHOLDER_PREFIX, doc.period, n);
                if !doc.items.contains_key(&candidate) {
                    break candidate;
                }
                n += 1;
            };
            doc.items.insert(
                id.clone(),
                WorkItem {
                    id: id.clone(),
                    title: title.to_string(),
                    category,
                    owners,
                    completed: false,
                    created_at: now,
                    completed_at: None,
                    origin,
                },
            );
            refresh_snapshot(doc);
            Ok((id, true))
        })
    }

    /// Move a record to a new identifier, preserving every other field.
    ///
    /// Fails with `DuplicateIdentifier` if `new_id` is already taken and with
    /// `UnknownItem` if `old_id` does not exist; the store is unchanged on error.
    pub fn rekey(&self, old_id: &str, new_id: &str) -> Result<(), BotError> {
        if old_id == new_id {
            return match self.get(old_id) {
                Some(_) => Ok(()),
                None => Err(BotError::UnknownItem(old_id.to_string())),
            };
        }
        self.doc.mutate(|doc| {
            if doc.items.contains_key(new_id) {
                return Err(BotError::DuplicateIdentifier {
                    old_id: old_id.to_string(),
                    new_id: new_id.to_string(),
                });
            }
            let mut item = doc
                .items
                .remove(old_id)
                .ok_or_else(|| BotError::UnknownItem(old_id.to_string()))?;
            item.id = new_id.to_string();
            doc.items.insert(new_id.to_string(), item);
            refresh_snapshot(doc);
            Ok(((), true))
        })
    }

    /// Mark an item complete. Returns whether anything changed.
    pub fn mark_complete(&self, id: &str, at: DateTime<Utc>) -> Result<bool, BotError> {
        self.set_completion(id, true, Some(at))
    }

    /// Mark an item incomplete. Returns whether anything changed.
    pub fn mark_incomplete(&self, id: &str) -> Result<bool, BotError> {
        self.set_completion(id, false, None)
    }

    fn set_completion(
        &self,
        id: &str,
        completed: bool,
        at: Option<DateTime<Utc>>,
    ) -> Result<bool, BotError> {
        self.doc.mutate(|doc| {
            let item = doc
                .items
                .get_mut(id)
                .ok_or_else(|| BotError::UnknownItem(id.to_string()))?;
            let changed = set_completed(item, completed, at);
            if changed {
                refresh_snapshot(doc);
            }
            Ok((changed, changed))
        })
    }

    /// Complete every pending item owned by `owner`; returns the items changed.
    pub fn complete_for_owner(
        &self,
        owner: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>, BotError> {
        self.doc.mutate(|doc| {
            let mut changed = Vec::new();
            for item in doc.items.values_mut() {
                if item.owners.contains(owner) && set_completed(item, true, Some(at)) {
                    changed.push(item.clone());
                }
            }
            let dirty = !changed.is_empty();
            if dirty {
                refresh_snapshot(doc);
            }
            Ok((changed, dirty))
        })
    }

    /// Apply remote completion states in one transaction.
    ///
    /// An observation is applied only if the item still exists and its local
    /// completion is still what it was when the lookup started; otherwise a
    /// local change raced the lookup and wins.
    pub fn apply_remote_statuses(
        &self,
        observations: &[RemoteObservation],
        now: DateTime<Utc>,
    ) -> Result<RemoteApplyResult, BotError> {
        self.doc.mutate(|doc| {
            let mut result = RemoteApplyResult::default();
            for obs in observations {
                let Some(item) = doc.items.get_mut(&obs.id) else {
                    continue;
                };
                if item.completed != obs.seen_completed {
                    result.raced.push(obs.id.clone());
                    continue;
                }
                let at = obs.status.completed_at.or(Some(now));
                if set_completed(item, obs.status.completed, at) {
                    result.changed.push(obs.id.clone());
                }
            }
            let dirty = !result.changed.is_empty();
            if dirty {
                refresh_snapshot(doc);
            }
            Ok((result, dirty))
        })
    }

    /// Recompute the aggregate from the current item set.
    pub fn snapshot(&self) -> AggregateSnapshot {
        self.doc
            .read(|doc| compute_snapshot(&doc.period, doc.items.values()))
    }

    pub fn get(&self, id: &str) -> Option<WorkItem> {
        self.doc.read(|doc| doc.items.get(id).cloned())
    }

    pub fn items(&self) -> Vec<WorkItem> {
        self.doc.read(|doc| doc.items.values().cloned().collect())
    }

    pub fn pending_items(&self) -> Vec<WorkItem> {
        self.doc.read(|doc| {
            doc.items
                .values()
                .filter(|i| !i.completed)
                .cloned()
                .collect()
        })
    }

    pub fn items_for_owner(&self, owner: &str) -> Vec<WorkItem> {
        self.doc.read(|doc| {
            doc.items
                .values()
                .filter(|i| i.owners.contains(owner))
                .cloned()
                .collect()
        })
    }

    /// Distinct owners of incomplete items.
    pub fn pending_owners(&self) -> BTreeSet<String> {
        self.doc.read(|doc| {
            doc.items
                .values()
                .filter(|i| !i.completed)
                .flat_map(|i| i.owners.iter().cloned())
                .collect()
        })
    }

    /// Items the remote platform can be asked about, with their current
    /// completion, plus the number of placeholders left out.
    pub fn remote_completion(&self) -> (Vec<(String, bool)>, usize) {
        self.doc.read(|doc| {
            let mut placeholders = 0;
            let mut remote = Vec::new();
            for item in doc.items.values() {
                if is_placeholder(&item.id) {
                    placeholders += 1;
                } else {
                    remote.push((item.id.clone(), item.completed));
                }
            }
            (remote, placeholders)
        })
    }

    pub fn archived(&self, period: &str) -> Vec<WorkItem> {
        self.doc.read(|doc| {
            doc.archive
                .get(period)
                .map(|items| items.values().cloned().collect())
                .unwrap_or_default()
        })
    }
}
