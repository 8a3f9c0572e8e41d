//! Proficiency ledger: per-(advisor, topic) running statistics.
//!
//! Writes go through [`ProficiencyLedger::apply`], which the learning engine
//! owns. Routing only ever sees a [`LedgerSnapshot`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::{CouncilError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProficiencyEntry {
    pub success_count: u64,
    pub attempt_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub weight: f64,
    /// Bumped on every committed write.
    #[serde(default)]
    pub revision: u64,
}

impl ProficiencyEntry {
    pub fn neutral(weight: f64) -> Self {
        Self {
            success_count: 0,
            attempt_count: 0,
            last_used: None,
            weight: weight.clamp(0.0, 1.0),
            revision: 0,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.attempt_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.attempt_count as f64
        }
    }
}

type EntryKey = (String, String);

/// Point-in-time copy of the ledger, advisor → tag → entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub entries: BTreeMap<String, BTreeMap<String, ProficiencyEntry>>,
}

impl LedgerSnapshot {
    pub fn entry(&self, advisor: &str, tag: &str) -> Option<&ProficiencyEntry> {
        self.entries.get(advisor).and_then(|tags| tags.get(tag))
    }

    pub fn weight(&self, advisor: &str, tag: &str) -> Option<f64> {
        self.entry(advisor, tag).map(|e| e.weight)
    }

    /// Highest known weight of `advisor` over `tags`.
    pub fn best_weight(&self, advisor: &str, tags: &[String]) -> Option<f64> {
        tags.iter()
            .filter_map(|t| self.weight(advisor, t))
            .fold(None, |acc: Option<f64>, w| Some(acc.map_or(w, |a| a.max(w))))
    }

    pub fn insert(&mut self, advisor: &str, tag: &str, entry: ProficiencyEntry) {
        self.entries
            .entry(advisor.to_string())
            .or_default()
            .insert(tag.to_string(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(|tags| tags.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ProficiencyLedger {
    entries: DashMap<EntryKey, ProficiencyEntry>,
    archived: DashMap<EntryKey, ProficiencyEntry>,
    initial_weight: f64,
    max_write_attempts: u32,
}

impl ProficiencyLedger {
    pub fn new(initial_weight: f64, max_write_attempts: u32) -> Self {
        Self {
            entries: DashMap::new(),
            archived: DashMap::new(),
            initial_weight: initial_weight.clamp(0.0, 1.0),
            max_write_attempts: max_write_attempts.max(1),
        }
    }

    /// Rebuild a ledger from persisted snapshots.
    pub fn restore(
        initial_weight: f64,
        max_write_attempts: u32,
        live: &LedgerSnapshot,
        archived: &LedgerSnapshot,
    ) -> Self {
        let ledger = Self::new(initial_weight, max_write_attempts);
        for (advisor, tags) in &live.entries {
            for (tag, entry) in tags {
                ledger.entries.insert((advisor.clone(), tag.clone()), entry.clone());
            }
        }
        for (advisor, tags) in &archived.entries {
            for (tag, entry) in tags {
                ledger.archived.insert((advisor.clone(), tag.clone()), entry.clone());
            }
        }
        ledger
    }

    pub fn initial_weight(&self) -> f64 {
        self.initial_weight
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        collect(&self.entries)
    }

    pub fn archived_snapshot(&self) -> LedgerSnapshot {
        collect(&self.archived)
    }

    pub fn get(&self, advisor: &str, tag: &str) -> Option<ProficiencyEntry> {
        self.entries
            .get(&(advisor.to_string(), tag.to_string()))
            .map(|e| e.value().clone())
    }

    pub fn archived_entries(&self, advisor: &str) -> Vec<(String, ProficiencyEntry)> {
        let mut out: Vec<(String, ProficiencyEntry)> = self
            .archived
            .iter()
            .filter(|e| e.key().0 == advisor)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Create a neutral entry if none exists. Returns the current entry.
    pub(crate) fn enroll(&self, advisor: &str, tag: &str) -> ProficiencyEntry {
        self.entries
            .entry((advisor.to_string(), tag.to_string()))
            .or_insert_with(|| ProficiencyEntry::neutral(self.initial_weight))
            .value()
            .clone()
    }

    /// Read-compute-commit on one entry.
    ///
    /// `update` runs on a copy of the latest entry outside any lock; the commit
    /// succeeds only if nobody else committed in between, otherwise the update
    /// is recomputed from the fresh read.
    pub(crate) fn apply<F>(&self, advisor: &str, tag: &str, update: F) -> Result<ProficiencyEntry>
    where
        F: Fn(&ProficiencyEntry) -> ProficiencyEntry,
    {
        let key = (advisor.to_string(), tag.to_string());

        for attempt in 1..=self.max_write_attempts {
            let current = self
                .entries
                .get(&key)
                .map(|e| e.value().clone())
                .unwrap_or_else(|| ProficiencyEntry::neutral(self.initial_weight));

            let mut next = update(&current);
            next.weight = next.weight.clamp(0.0, 1.0);
            next.success_count = next.success_count.min(next.attempt_count);
            next.revision = current.revision + 1;

            let mut slot = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| ProficiencyEntry::neutral(self.initial_weight));
            if slot.revision == current.revision {
                *slot = next.clone();
                return Ok(next);
            }
            drop(slot);
            debug!(advisor, tag, attempt, "ledger write conflict, retrying with latest read");
        }

        Err(CouncilError::LedgerWriteConflict {
            advisor: advisor.to_string(),
            tag: tag.to_string(),
            attempts: self.max_write_attempts,
        })
    }

    /// Move every entry of `advisor` into the read-only archive.
    pub(crate) fn archive_advisor(&self, advisor: &str) -> usize {
        let keys: Vec<EntryKey> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == advisor)
            .map(|e| e.key().clone())
            .collect();

        let mut moved = 0;
        for key in keys {
            if let Some((key, entry)) = self.entries.remove(&key) {
                self.archived.insert(key, entry);
                moved += 1;
            }
        }
        info!("Archived {} ledger entries for advisor {}", moved, advisor);
        moved
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn collect(map: &DashMap<EntryKey, ProficiencyEntry>) -> LedgerSnapshot {
    let mut snapshot = LedgerSnapshot::default();
    for item in map.iter() {
        let (advisor, tag) = item.key();
        snapshot.insert(advisor, tag, item.value().clone());
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn bump(entry: &ProficiencyEntry) -> ProficiencyEntry {
        let mut next = entry.clone();
        next.attempt_count += 1;
        next.success_count += 1;
        next.weight += 0.1;
        next
    }

    #[test]
    fn apply_starts_from_neutral_and_clamps() {
        let ledger = ProficiencyLedger::new(0.5, 4);
        let entry = ledger
            .apply("alpha", "planning", |e| {
                let mut next = e.clone();
                next.attempt_count += 1;
                next.weight = 7.0;
                next
            })
            .unwrap();
        assert_eq!(entry.weight, 1.0);
        assert_eq!(entry.attempt_count, 1);
        assert_eq!(entry.revision, 1);
    }

    #[test]
    fn snapshot_is_detached_from_later_writes() {
        let ledger = ProficiencyLedger::new(0.5, 4);
        ledger.apply("alpha", "planning", bump).unwrap();
        let snap = ledger.snapshot();
        ledger.apply("alpha", "planning", bump).unwrap();

        assert_eq!(snap.entry("alpha", "planning").unwrap().attempt_count, 1);
        assert_eq!(ledger.get("alpha", "planning").unwrap().attempt_count, 2);
    }

    #[test]
    fn concurrent_updates_on_one_entry_are_serialized() {
        let ledger = Arc::new(ProficiencyLedger::new(0.5, 64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        ledger
                            .apply("alpha", "planning", |e| {
                                let mut next = e.clone();
                                next.attempt_count += 1;
                                next
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ledger.get("alpha", "planning").unwrap().attempt_count, 400);
    }

    #[test]
    fn archive_moves_entries_out_of_the_live_view() {
        let ledger = ProficiencyLedger::new(0.5, 4);
        ledger.enroll("mini", "budgeting");
        ledger.apply("mini", "rent", bump).unwrap();
        ledger.apply("other", "rent", bump).unwrap();

        assert_eq!(ledger.archive_advisor("mini"), 2);
        assert!(ledger.get("mini", "budgeting").is_none());
        assert_eq!(ledger.archived_entries("mini").len(), 2);
        assert_eq!(ledger.snapshot().len(), 1);
        assert_eq!(ledger.archived_snapshot().len(), 2);
    }

    #[test]
    fn best_weight_takes_max_over_known_tags() {
        let mut snap = LedgerSnapshot::default();
        let mut entry = ProficiencyEntry::neutral(0.2);
        snap.insert("alpha", "a", entry.clone());
        entry.weight = 0.7;
        snap.insert("alpha", "b", entry);

        let tags = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(snap.best_weight("alpha", &tags), Some(0.7));
        assert_eq!(snap.best_weight("beta", &tags), None);
    }
}
