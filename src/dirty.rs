use crate::tables::RecordId;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// Dirty set shared between the write path and the backup worker. The cache
/// guards it with its own lock, separate from the main write lock, so dirty
/// bookkeeping never waits on backup I/O and vice versa.
#[derive(Debug, Default)]
pub struct DirtyTracker {
    marks: HashMap<RecordId, DateTime<Utc>>,
    last_backup: HashMap<RecordId, Instant>,
}

impl DirtyTracker {
    pub fn load(rows: impl IntoIterator<Item = (RecordId, DateTime<Utc>)>) -> Self {
        DirtyTracker { marks: rows.into_iter().collect(), last_backup: HashMap::new() }
    }

    pub fn mark(&mut self, record: RecordId, stamp: DateTime<Utc>) {
        self.marks.insert(record, stamp);
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    pub fn ids(&self) -> BTreeSet<RecordId> {
        self.marks.keys().copied().collect()
    }

    /// Snapshot of up to `limit` dirty records eligible for backup: records
    /// backed up less than `min_gap` ago are held back for a later cycle.
    /// Non-destructive; marks are cleared individually via `clear_if` once a
    /// snapshot lands.
    pub fn take_batch(&self, limit: usize, min_gap: Duration) -> Vec<(RecordId, DateTime<Utc>)> {
        let mut eligible: Vec<(RecordId, DateTime<Utc>)> = self
            .marks
            .iter()
            .filter(|(record, _)| {
                self.last_backup.get(record).map(|at| at.elapsed() >= min_gap).unwrap_or(true)
            })
            .map(|(record, stamp)| (*record, *stamp))
            .collect();
        eligible.sort_by_key(|(record, _)| *record);
        eligible.truncate(limit);
        eligible
    }

    /// Clear a record's mark only if it has not been re-dirtied since the
    /// batch was captured.
    pub fn clear_if(&mut self, record: RecordId, stamp: DateTime<Utc>) -> bool {
        if self.marks.get(&record) == Some(&stamp) {
            self.marks.remove(&record);
            true
        } else {
            false
        }
    }

    pub fn note_backup(&mut self, record: RecordId) {
        self.last_backup.insert(record, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_respects_newer_marks() {
        let mut tracker = DirtyTracker::default();
        let first = Utc::now();
        tracker.mark(1, first);
        let newer = first + chrono::Duration::seconds(1);
        tracker.mark(1, newer);
        assert!(!tracker.clear_if(1, first), "stale stamp must not clear a newer mark");
        assert_eq!(tracker.len(), 1);
        assert!(tracker.clear_if(1, newer));
        assert!(tracker.is_empty());
    }

    #[test]
    fn batch_holds_back_recently_backed_up_records() {
        let mut tracker = DirtyTracker::default();
        let now = Utc::now();
        tracker.mark(1, now);
        tracker.mark(2, now);
        tracker.note_backup(2);
        let batch = tracker.take_batch(10, Duration::from_secs(60));
        assert_eq!(batch.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![1]);
        let batch = tracker.take_batch(10, Duration::ZERO);
        assert_eq!(batch.len(), 2, "zero gap admits everything");
    }

    #[test]
    fn batch_is_ordered_and_bounded() {
        let mut tracker = DirtyTracker::default();
        let now = Utc::now();
        for id in [9u64, 3, 7, 1] {
            tracker.mark(id, now);
        }
        let batch = tracker.take_batch(3, Duration::ZERO);
        assert_eq!(batch.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![1, 3, 7]);
    }
}
