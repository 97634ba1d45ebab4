use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Level, RawFileRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Sweep indices with a published image and metadata document.
    #[serde(default)]
    pub sweeps: Vec<u32>,
}

impl IndexEntry {
    pub fn new(record: &RawFileRecord, mut sweeps: Vec<u32>) -> Self {
        sweeps.sort_unstable();
        sweeps.dedup();
        Self {
            key: record.normalized_key.clone(),
            timestamp: record.timestamp,
            code: record.code.clone(),
            sweeps,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_entries: usize,
    pub max_age: Option<Duration>,
}

/// Result of merging a batch into a [`FileIndex`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// New entries that are in the index after retention.
    pub added: Vec<IndexEntry>,
    /// Entries that were indexed before the merge and fell out of retention.
    pub evicted: Vec<IndexEntry>,
    /// New entries that retention dropped immediately.
    pub rejected: Vec<IndexEntry>,
    /// New entries skipped because their key was already indexed.
    pub duplicates: usize,
}

impl MergeOutcome {
    /// Every entry whose blobs are no longer referenced by the index.
    pub fn unreferenced(&self) -> impl Iterator<Item = &IndexEntry> {
        self.evicted.iter().chain(self.rejected.iter())
    }

    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.evicted.is_empty()
    }
}

/// Processed keys of one `(level, product)`, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndex {
    #[serde(default)]
    pub entries: Vec<IndexEntry>,
}

impl FileIndex {
    pub fn key(level: Level, product: &str) -> String {
        format!("lists/nexrad_level{}_{}_files.json", level, product)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|e| e.key == key)
    }

    pub fn keys(&self) -> HashSet<&str> {
        self.entries.iter().map(|e| e.key.as_str()).collect()
    }

    /// Number of entries per product code. Entries without a code are not
    /// counted.
    pub fn code_counts(&self) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        for code in self.entries.iter().filter_map(|e| e.code.as_ref()) {
            *counts.entry(code.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Appends `batch`, skipping keys that are already present, re-sorts by
    /// timestamp and applies `policy`.
    ///
    /// The age cutoff is measured from the newest added entry, or from `now`
    /// when nothing was added.
    pub fn merge(
        &mut self,
        batch: Vec<IndexEntry>,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut seen: HashSet<String> = self.entries.iter().map(|e| e.key.clone()).collect();
        let mut new_keys = HashSet::new();

        for entry in batch {
            if !seen.insert(entry.key.clone()) {
                outcome.duplicates += 1;
                continue;
            }
            new_keys.insert(entry.key.clone());
            self.entries.push(entry);
        }
        self.entries
            .sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.key.cmp(&b.key)));

        let mut removed = Vec::new();
        if let Some(max_age) = policy.max_age {
            let reference = self
                .entries
                .iter()
                .filter(|e| new_keys.contains(&e.key))
                .map(|e| e.timestamp)
                .max()
                .unwrap_or(now);
            let cutoff = reference - max_age;
            let (keep, old): (Vec<_>, Vec<_>) = self
                .entries
                .drain(..)
                .partition(|e| e.timestamp >= cutoff);
            self.entries = keep;
            removed.extend(old);
        }
        if self.entries.len() > policy.max_entries {
            let excess = self.entries.len() - policy.max_entries;
            removed.extend(self.entries.drain(..excess));
        }

        for entry in removed {
            if new_keys.remove(&entry.key) {
                outcome.rejected.push(entry);
            } else {
                outcome.evicted.push(entry);
            }
        }
        outcome.added = self
            .entries
            .iter()
            .filter(|e| new_keys.contains(&e.key))
            .cloned()
            .collect();
        outcome
    }
}

/// Per product, the number of indexed files carrying each product code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductCodeRegistry(BTreeMap<String, BTreeMap<String, u64>>);

impl ProductCodeRegistry {
    pub const KEY: &'static str = "codes/options.json";

    pub fn count(&self, product: &str, code: &str) -> u64 {
        self.0
            .get(product)
            .and_then(|codes| codes.get(code))
            .copied()
            .unwrap_or(0)
    }

    pub fn counts(&self, product: &str) -> Option<&BTreeMap<String, u64>> {
        self.0.get(product)
    }

    pub fn increment(&mut self, product: &str, code: &str) {
        *self
            .0
            .entry(product.to_string())
            .or_default()
            .entry(code.to_string())
            .or_insert(0) += 1;
    }

    /// Decrements a count, never below zero. Codes reaching zero are removed.
    pub fn decrement(&mut self, product: &str, code: &str) {
        let Some(codes) = self.0.get_mut(product) else {
            return;
        };
        if let Some(count) = codes.get_mut(code) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                codes.remove(code);
            }
        }
        if codes.is_empty() {
            self.0.remove(product);
        }
    }

    /// Applies the code changes of a merge.
    pub fn apply(&mut self, product: &str, outcome: &MergeOutcome) {
        for code in outcome.added.iter().filter_map(|e| e.code.as_ref()) {
            self.increment(product, code);
        }
        for code in outcome.evicted.iter().filter_map(|e| e.code.as_ref()) {
            self.decrement(product, code);
        }
    }

    /// Forces the counts of `product` to match `index`. Returns true when the
    /// stored counts had drifted.
    pub fn reconcile(&mut self, product: &str, index: &FileIndex) -> bool {
        let expected = index.code_counts();
        let current = self.0.get(product).cloned().unwrap_or_default();
        if current == expected {
            return false;
        }
        warn!(
            product,
            ?current,
            ?expected,
            "product code counts drifted from file index, rewriting"
        );
        if expected.is_empty() {
            self.0.remove(product);
        } else {
            self.0.insert(product.to_string(), expected);
        }
        true
    }
}

/// Last update time of every product, in epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFlags {
    #[serde(default)]
    pub updates: BTreeMap<String, u64>,
}

impl UpdateFlags {
    pub const KEY: &'static str = "flags/update_flags.json";

    pub fn set(&mut self, product: &str, epoch_ms: u64) {
        self.updates.insert(product.to_string(), epoch_ms);
    }

    pub fn get(&self, product: &str) -> Option<u64> {
        self.updates.get(product).copied()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::test_objects::tests::{index_entry, minutes_after_base};

    fn policy(max_entries: usize) -> RetentionPolicy {
        RetentionPolicy {
            max_entries,
            max_age: None,
        }
    }

    #[test]
    fn test_merge_skips_existing_keys_and_sorts() {
        let mut index = FileIndex::default();
        index.merge(
            vec![index_entry("B", 10, None), index_entry("A", 5, None)],
            &policy(10),
            minutes_after_base(10),
        );
        let outcome = index.merge(
            vec![index_entry("A", 5, None), index_entry("C", 7, None)],
            &policy(10),
            minutes_after_base(10),
        );

        assert_eq!(1, outcome.duplicates);
        assert_eq!(vec!["C".to_string()], keys(&outcome.added));
        assert_eq!(
            vec!["A", "C", "B"],
            index.entries.iter().map(|e| e.key.as_str()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_merge_caps_to_max_entries() {
        let mut index = FileIndex::default();
        let full: Vec<_> = (0..100)
            .map(|i| index_entry(&format!("OLD{:03}", i), i, None))
            .collect();
        index.merge(full, &policy(100), minutes_after_base(100));
        assert_eq!(100, index.len());

        let fresh: Vec<_> = (0..10)
            .map(|i| index_entry(&format!("NEW{:03}", i), 200 + i, None))
            .collect();
        let outcome = index.merge(fresh, &policy(100), minutes_after_base(210));

        assert_eq!(100, index.len());
        assert_eq!(10, outcome.added.len());
        assert_eq!(
            (0..10).map(|i| format!("OLD{:03}", i)).collect::<Vec<_>>(),
            keys(&outcome.evicted)
        );
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn test_merge_age_cutoff_uses_newest_added_entry() {
        let max_age = Some(Duration::minutes(60));
        let mut index = FileIndex::default();
        index.merge(
            vec![index_entry("A", 0, None), index_entry("B", 50, None)],
            &RetentionPolicy {
                max_entries: 10,
                max_age: None,
            },
            minutes_after_base(50),
        );

        // Newest added is at 100, so the cutoff is 40 regardless of `now`.
        let outcome = index.merge(
            vec![index_entry("C", 100, None), index_entry("D", 30, None)],
            &RetentionPolicy {
                max_entries: 10,
                max_age,
            },
            minutes_after_base(1_000),
        );
        assert_eq!(vec!["A".to_string()], keys(&outcome.evicted));
        assert_eq!(vec!["D".to_string()], keys(&outcome.rejected));
        assert_eq!(vec!["C".to_string()], keys(&outcome.added));
        assert_eq!(
            vec!["B", "C"],
            index.entries.iter().map(|e| e.key.as_str()).collect::<Vec<_>>()
        );

        // Nothing added: cutoff is measured from now.
        let outcome = index.merge(
            vec![],
            &RetentionPolicy {
                max_entries: 10,
                max_age,
            },
            minutes_after_base(140),
        );
        assert_eq!(vec!["B".to_string()], keys(&outcome.evicted));
        assert!(outcome.changed());
    }

    #[test]
    fn test_registry_tracks_index_codes() {
        let mut index = FileIndex::default();
        let mut registry = ProductCodeRegistry::default();

        let outcome = index.merge(
            vec![
                index_entry("A", 0, Some("HHC")),
                index_entry("B", 1, Some("HHC")),
                index_entry("C", 2, Some("EET")),
            ],
            &policy(2),
            minutes_after_base(2),
        );
        registry.apply("hydrometeor", &outcome);
        assert_eq!(1, registry.count("hydrometeor", "HHC"));
        assert_eq!(1, registry.count("hydrometeor", "EET"));
        assert!(!registry.reconcile("hydrometeor", &index));

        let outcome = index.merge(
            vec![index_entry("D", 3, Some("HHC")), index_entry("E", 4, Some("HHC"))],
            &policy(2),
            minutes_after_base(4),
        );
        registry.apply("hydrometeor", &outcome);
        assert_eq!(2, registry.count("hydrometeor", "HHC"));
        assert_eq!(0, registry.count("hydrometeor", "EET"));
        assert_eq!(index.code_counts(), registry.counts("hydrometeor").cloned().unwrap());
    }

    #[test]
    fn test_registry_never_negative_and_reconciles() {
        let mut registry = ProductCodeRegistry::default();
        registry.decrement("precipitation", "DAA");
        registry.increment("precipitation", "DAA");
        registry.decrement("precipitation", "DAA");
        registry.decrement("precipitation", "DAA");
        assert_eq!(0, registry.count("precipitation", "DAA"));
        assert!(registry.counts("precipitation").is_none());

        registry.increment("precipitation", "DTA");
        let index = FileIndex {
            entries: vec![index_entry("A", 0, Some("DAA"))],
        };
        assert!(registry.reconcile("precipitation", &index));
        assert_eq!(1, registry.count("precipitation", "DAA"));
        assert_eq!(0, registry.count("precipitation", "DTA"));
    }

    #[test]
    fn test_documents_json_shape() {
        let mut registry = ProductCodeRegistry::default();
        registry.increment("hydrometeor", "HHC");
        assert_eq!(
            r#"{"hydrometeor":{"HHC":1}}"#,
            serde_json::to_string(&registry).unwrap()
        );

        let mut flags = UpdateFlags::default();
        flags.set("reflectivity", 1_744_212_600_000);
        assert_eq!(
            r#"{"updates":{"reflectivity":1744212600000}}"#,
            serde_json::to_string(&flags).unwrap()
        );

        let index: FileIndex = serde_json::from_str(
            r#"{"entries":[{"key":"KPDT20250409_153000_V06","timestamp":"2025-04-09T15:30:00Z","sweeps":[0,1]}]}"#,
        )
        .unwrap();
        assert_eq!(
            Utc.with_ymd_and_hms(2025, 4, 9, 15, 30, 0).unwrap(),
            index.entries[0].timestamp
        );
        assert_eq!(None, index.entries[0].code);
        assert_eq!(
            "lists/nexrad_level2_reflectivity_files.json",
            FileIndex::key(Level::Level2, "reflectivity")
        );
    }

    fn keys(entries: &[IndexEntry]) -> Vec<String> {
        entries.iter().map(|e| e.key.clone()).collect()
    }
}
