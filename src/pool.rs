//! Lifecycle-state pools: the set of segment ids currently in one
//! lifecycle state for one array.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;

use log::{trace, warn};
use parking_lot::Mutex;

use crate::{ArrayId, Metrics, SegmentId, SegmentState};

/// A thread-safe unordered collection of segment ids associated with
/// one lifecycle state, e.g. the free pool or the victim pool.
///
/// Membership is reconciled from segment-state transitions that may
/// legitimately race with pool housekeeping, so duplicate adds and
/// removes of absent ids are logged anomalies rather than fatal errors.
#[derive(Debug)]
pub struct SegmentPool {
    array_id: ArrayId,
    state: SegmentState,
    segments: Mutex<BTreeSet<SegmentId>>,
    // cached size, kept consistent with the set under the same lock so
    // it can be read without taking the lock
    count: AtomicUsize,
    metrics: Arc<Metrics>,
}

impl SegmentPool {
    pub fn new(
        array_id: ArrayId,
        state: SegmentState,
        metrics: Arc<Metrics>,
    ) -> SegmentPool {
        SegmentPool {
            array_id,
            state,
            segments: Mutex::new(BTreeSet::new()),
            count: AtomicUsize::new(0),
            metrics,
        }
    }

    pub fn array_id(&self) -> ArrayId {
        self.array_id
    }

    pub fn state(&self) -> SegmentState {
        self.state
    }

    /// Removes and returns the lowest-id member for determinism, or
    /// `None` if the pool is empty.
    pub fn pop(&self) -> Option<SegmentId> {
        let mut segments = self.segments.lock();
        let popped = segments.pop_first();

        if let Some(segment_id) = popped {
            self.count.store(segments.len(), SeqCst);
            trace!(
                "popped segment {} from {:?} pool of array {}, {} remain",
                segment_id,
                self.state,
                self.array_id,
                segments.len()
            );
        }

        popped
    }

    /// Idempotent insert. A duplicate add is an anomaly, not an error.
    pub fn add(&self, segment_id: SegmentId) {
        let mut segments = self.segments.lock();
        if !segments.insert(segment_id) {
            warn!(
                "duplicate add of segment {} to {:?} pool of array {}",
                segment_id, self.state, self.array_id
            );
            self.metrics.pool_duplicate_add();
        }
        self.count.store(segments.len(), SeqCst);
        trace!(
            "added segment {} to {:?} pool of array {}, now {}",
            segment_id,
            self.state,
            self.array_id,
            segments.len()
        );
    }

    /// Removes `segment_id` if present and reports whether it was. The
    /// caller may race with a concurrent pop, so absence is an anomaly,
    /// not an error.
    pub fn remove(&self, segment_id: SegmentId) -> bool {
        let mut segments = self.segments.lock();
        let removed = segments.remove(&segment_id);
        self.count.store(segments.len(), SeqCst);

        if removed {
            trace!(
                "removed segment {} from {:?} pool of array {}, {} remain",
                segment_id,
                self.state,
                self.array_id,
                segments.len()
            );
        } else {
            warn!(
                "failed to remove segment {} from {:?} pool of array {}",
                segment_id, self.state, self.array_id
            );
            self.metrics.pool_missed_remove();
        }

        removed
    }

    pub fn contains(&self, segment_id: SegmentId) -> bool {
        self.segments.lock().contains(&segment_id)
    }

    pub fn len(&self) -> usize {
        self.segments.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The cached size, readable without the pool lock by call sites
    /// that only need a recent value.
    pub fn len_cached(&self) -> usize {
        self.count.load(SeqCst)
    }

    /// A copy of the full membership set for diagnostics and rebuild.
    pub fn snapshot(&self) -> BTreeSet<SegmentId> {
        self.segments.lock().clone()
    }

    /// Clears the pool; used when the array reinitializes pool
    /// membership from persisted state.
    pub fn reset(&self) {
        let mut segments = self.segments.lock();
        let size_before_clear = segments.len();
        segments.clear();
        self.count.store(0, SeqCst);
        trace!(
            "reset {:?} pool of array {}, previous size {}",
            self.state,
            self.array_id,
            size_before_clear
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool() -> SegmentPool {
        SegmentPool::new(0, SegmentState::Free, Arc::new(Metrics::default()))
    }

    #[test]
    fn pop_on_empty_pool_returns_none() {
        let pool = test_pool();
        assert_eq!(pool.pop(), None);
    }

    #[test]
    fn add_then_pop_returns_lowest_id() {
        let pool = test_pool();
        pool.add(9);
        pool.add(3);
        pool.add(5);
        assert_eq!(pool.pop(), Some(3));
        assert_eq!(pool.pop(), Some(5));
        assert_eq!(pool.pop(), Some(9));
        assert_eq!(pool.pop(), None);
    }

    #[test]
    fn size_tracks_adds_and_removes() {
        let pool = test_pool();
        for segment_id in 0..10 {
            pool.add(segment_id);
        }
        for segment_id in 0..4 {
            assert!(pool.remove(segment_id));
        }
        assert_eq!(pool.len(), 6);
        assert_eq!(pool.len_cached(), 6);
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let pool = test_pool();
        pool.add(1);
        pool.add(1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn remove_of_absent_id_reports_false() {
        let pool = test_pool();
        pool.add(1);
        assert!(!pool.remove(2));
        assert!(pool.contains(1));
    }

    #[test]
    fn reset_clears_membership_and_count() {
        let pool = test_pool();
        pool.add(1);
        pool.add(2);
        pool.reset();
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.len_cached(), 0);
        assert_eq!(pool.snapshot().len(), 0);
    }

    #[test]
    fn snapshot_copies_membership() {
        let pool = test_pool();
        pool.add(4);
        pool.add(2);
        let snapshot = pool.snapshot();
        assert!(snapshot.contains(&2) && snapshot.contains(&4));
        // mutating the pool afterward leaves the snapshot alone
        pool.pop();
        assert_eq!(snapshot.len(), 2);
    }
}
