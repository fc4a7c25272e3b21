//! Trigger deduplicator
//!
//! Sliding-window guard consulted before a pipeline run is created. The
//! window is anchored to the original admission: a rejected duplicate
//! does not extend it. Expired entries are purged only by the explicit
//! cleanup pass, never on the check path.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Dedup ledger entry
#[derive(Debug, Clone)]
pub struct TriggerRecord {
    pub key: String,
    pub triggered_at: DateTime<Utc>,
    pub pipeline_run_id: Uuid,
}

/// Outcome of a trigger check
///
/// A duplicate is a defined outcome carrying the original reference,
/// not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerVerdict {
    Admitted,
    Duplicate {
        original_run_id: Uuid,
        original_at: DateTime<Utc>,
    },
}

pub struct TriggerDeduplicator {
    window: Duration,
    records: Mutex<HashMap<String, TriggerRecord>>,
}

impl TriggerDeduplicator {
    /// A zero-length window disables deduplication entirely
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Check the key and, if admitted, record it with the resulting run id
    ///
    /// `force` bypasses the check while still updating the record.
    pub fn check_and_record(&self, key: &str, run_id: Uuid, force: bool) -> TriggerVerdict {
        if self.window.is_zero() {
            return TriggerVerdict::Admitted;
        }

        let mut records = self.records.lock().unwrap();

        if !force {
            if let Some(existing) = records.get(key) {
                let age = Utc::now() - existing.triggered_at;
                let window =
                    chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero());
                if age < window {
                    debug!("Trigger {} rejected as duplicate of run {}", key, existing.pipeline_run_id);
                    // Window stays anchored to the original admission
                    return TriggerVerdict::Duplicate {
                        original_run_id: existing.pipeline_run_id,
                        original_at: existing.triggered_at,
                    };
                }
            }
        }

        records.insert(
            key.to_string(),
            TriggerRecord {
                key: key.to_string(),
                triggered_at: Utc::now(),
                pipeline_run_id: run_id,
            },
        );
        TriggerVerdict::Admitted
    }

    /// Undo an admission that never produced a persisted run
    ///
    /// Removes the entry only while it still carries `run_id`, so a
    /// later admission under the same key is left untouched. Returns
    /// whether an entry was removed.
    pub fn retract(&self, key: &str, run_id: Uuid) -> bool {
        let mut records = self.records.lock().unwrap();
        let ours = records
            .get(key)
            .is_some_and(|existing| existing.pipeline_run_id == run_id);
        if ours {
            records.remove(key);
            debug!("Retracted trigger record {} for run {}", key, run_id);
        }
        ours
    }

    /// Non-mutating probe
    pub fn would_admit(&self, key: &str) -> bool {
        if self.window.is_zero() {
            return true;
        }
        let records = self.records.lock().unwrap();
        match records.get(key) {
            Some(existing) => {
                let window =
                    chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero());
                Utc::now() - existing.triggered_at >= window
            }
            None => true,
        }
    }

    /// Rehydrate the ledger from persisted records at startup
    pub fn hydrate(&self, persisted: Vec<TriggerRecord>) {
        let mut records = self.records.lock().unwrap();
        for record in persisted {
            records.insert(record.key.clone(), record);
        }
    }

    /// Purge entries older than the window; returns how many were removed
    pub fn cleanup(&self) -> usize {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero());
        let cutoff = Utc::now() - window;

        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, r| r.triggered_at >= cutoff);
        let removed = before - records.len();

        if removed > 0 {
            info!("Purged {} expired trigger record(s)", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backdate(dedup: &TriggerDeduplicator, key: &str, secs: i64) {
        let mut records = dedup.records.lock().unwrap();
        if let Some(r) = records.get_mut(key) {
            r.triggered_at = Utc::now() - chrono::Duration::seconds(secs);
        }
    }

    #[test]
    fn test_first_admitted_repeat_rejected() {
        let dedup = TriggerDeduplicator::new(Duration::from_secs(60));
        let run = Uuid::new_v4();

        assert_eq!(
            dedup.check_and_record("push:repo-1:main", run, false),
            TriggerVerdict::Admitted
        );

        match dedup.check_and_record("push:repo-1:main", Uuid::new_v4(), false) {
            TriggerVerdict::Duplicate { original_run_id, .. } => {
                assert_eq!(original_run_id, run)
            }
            other => panic!("expected duplicate, got {:?}", other),
        }
    }

    #[test]
    fn test_admitted_again_after_window() {
        let dedup = TriggerDeduplicator::new(Duration::from_secs(60));
        dedup.check_and_record("push:repo-1:main", Uuid::new_v4(), false);
        backdate(&dedup, "push:repo-1:main", 61);

        assert_eq!(
            dedup.check_and_record("push:repo-1:main", Uuid::new_v4(), false),
            TriggerVerdict::Admitted
        );
    }

    #[test]
    fn test_window_anchored_to_original_admission() {
        let dedup = TriggerDeduplicator::new(Duration::from_secs(60));
        let run = Uuid::new_v4();
        dedup.check_and_record("push:repo-1:main", run, false);
        backdate(&dedup, "push:repo-1:main", 45);

        // A rejected duplicate does not slide the window forward
        let _ = dedup.check_and_record("push:repo-1:main", Uuid::new_v4(), false);
        backdate(&dedup, "push:repo-1:main", 61);

        assert!(dedup.would_admit("push:repo-1:main"));
    }

    #[test]
    fn test_zero_window_disables_dedup() {
        let dedup = TriggerDeduplicator::new(Duration::ZERO);
        for _ in 0..3 {
            assert_eq!(
                dedup.check_and_record("push:repo-1:main", Uuid::new_v4(), false),
                TriggerVerdict::Admitted
            );
        }
    }

    #[test]
    fn test_force_bypasses_but_records() {
        let dedup = TriggerDeduplicator::new(Duration::from_secs(60));
        let first = Uuid::new_v4();
        let forced = Uuid::new_v4();
        dedup.check_and_record("manual:repo-1:main", first, false);

        assert_eq!(
            dedup.check_and_record("manual:repo-1:main", forced, true),
            TriggerVerdict::Admitted
        );

        // The forced run is now the recorded original
        match dedup.check_and_record("manual:repo-1:main", Uuid::new_v4(), false) {
            TriggerVerdict::Duplicate { original_run_id, .. } => {
                assert_eq!(original_run_id, forced)
            }
            other => panic!("expected duplicate, got {:?}", other),
        }
    }

    #[test]
    fn test_retract_reopens_the_key() {
        let dedup = TriggerDeduplicator::new(Duration::from_secs(60));
        let run = Uuid::new_v4();
        dedup.check_and_record("push:repo-1:main", run, false);

        assert!(dedup.retract("push:repo-1:main", run));
        assert_eq!(
            dedup.check_and_record("push:repo-1:main", Uuid::new_v4(), false),
            TriggerVerdict::Admitted
        );
    }

    #[test]
    fn test_retract_ignores_superseded_entries() {
        let dedup = TriggerDeduplicator::new(Duration::from_secs(60));
        let stale = Uuid::new_v4();
        let current = Uuid::new_v4();
        dedup.check_and_record("manual:repo-1:main", stale, false);
        dedup.check_and_record("manual:repo-1:main", current, true);

        assert!(!dedup.retract("manual:repo-1:main", stale));
        match dedup.check_and_record("manual:repo-1:main", Uuid::new_v4(), false) {
            TriggerVerdict::Duplicate { original_run_id, .. } => {
                assert_eq!(original_run_id, current)
            }
            other => panic!("expected duplicate, got {:?}", other),
        }
    }

    #[test]
    fn test_cleanup_purges_only_expired() {
        let dedup = TriggerDeduplicator::new(Duration::from_secs(60));
        dedup.check_and_record("push:repo-1:main", Uuid::new_v4(), false);
        dedup.check_and_record("push:repo-2:main", Uuid::new_v4(), false);
        backdate(&dedup, "push:repo-1:main", 120);

        assert_eq!(dedup.cleanup(), 1);
        assert_eq!(dedup.len(), 1);
        assert!(dedup.would_admit("push:repo-1:main"));
    }
}
