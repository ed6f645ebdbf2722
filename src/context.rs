//! The accounting umbrella for one array: the segment record table plus
//! the free and victim pools, with decrement-to-zero releases wired back
//! into pool membership.
//!
//! Lock order: a segment's lock is always taken before a pool's lock,
//! since segment transitions are the trigger for pool membership
//! changes. No operation here holds both at once; the record methods
//! release the segment lock before pool housekeeping runs.

use std::sync::Arc;

use log::debug;

use crate::{
    Config, DecrementOutcome, Metrics, SegmentId, SegmentPool,
    SegmentRecord, SegmentState,
};

pub struct SegmentContext {
    config: Config,
    segments: Vec<SegmentRecord>,
    free_pool: SegmentPool,
    victim_pool: SegmentPool,
    metrics: Arc<Metrics>,
}

impl SegmentContext {
    /// Create the context with every segment `Free` and in the free
    /// pool.
    pub fn new(config: Config, metrics: Arc<Metrics>) -> SegmentContext {
        let segments = (0..config.segments)
            .map(|segment_id| SegmentRecord::new(config.array_id, segment_id))
            .collect();

        let free_pool = SegmentPool::new(
            config.array_id,
            SegmentState::Free,
            metrics.clone(),
        );
        for segment_id in 0..config.segments {
            free_pool.add(segment_id);
        }

        let victim_pool = SegmentPool::new(
            config.array_id,
            SegmentState::Victim,
            metrics.clone(),
        );

        debug!(
            "segment context for array {} starting with {} free segments",
            config.array_id, config.segments
        );

        SegmentContext { config, segments, free_pool, victim_pool, metrics }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The record for `segment_id`.
    ///
    /// # Panics
    /// Panics if `segment_id` is out of range for the array, which is a
    /// programming error in the caller.
    pub fn segment(&self, segment_id: SegmentId) -> &SegmentRecord {
        &self.segments[segment_id as usize]
    }

    /// Pop a free segment and claim it for write-buffer use, or `None`
    /// if no free segment remains.
    pub fn allocate_free_segment(&self) -> Option<SegmentId> {
        let segment_id = self.free_pool.pop()?;
        self.segment(segment_id).move_to_nvram_state();
        Some(segment_id)
    }

    /// Close `segment_id` out of the write buffer. Returns `true` when
    /// the segment was already empty and went straight back to the free
    /// pool.
    pub fn close_segment(&self, segment_id: SegmentId) -> bool {
        let freed = self.segment(segment_id).move_to_ssd_or_free_if_empty();
        if freed {
            self.free_pool.add(segment_id);
            self.metrics.segment_freed();
        }
        freed
    }

    /// Select `segment_id` as a GC victim. Fails without mutating when
    /// the segment is no longer SSD-resident.
    pub fn select_victim(&self, segment_id: SegmentId) -> bool {
        let selected = self.segment(segment_id).move_to_victim_state();
        if selected {
            self.victim_pool.add(segment_id);
        }
        selected
    }

    pub fn increase_valid_block_count(
        &self,
        segment_id: SegmentId,
        count: u32,
    ) -> u32 {
        self.segment(segment_id).increase_valid_block_count(count)
    }

    /// Decrement `segment_id`'s valid-block count, returning the
    /// released segment to the free pool (and dropping it from the
    /// victim pool if it was one) when the count crosses zero.
    pub fn decrease_valid_block_count(
        &self,
        segment_id: SegmentId,
        count: u32,
        allow_victim_release: bool,
    ) -> DecrementOutcome {
        let outcome = self
            .segment(segment_id)
            .decrease_valid_block_count(count, allow_victim_release);

        match outcome {
            DecrementOutcome::Released { previous } => {
                if previous == SegmentState::Victim {
                    self.victim_pool.remove(segment_id);
                }
                self.free_pool.add(segment_id);
                self.metrics.segment_freed();
            }
            DecrementOutcome::Underflowed => {
                self.metrics.valid_count_underflow();
            }
            DecrementOutcome::Occupied(_) => {}
        }

        outcome
    }

    pub fn increase_occupied_stripe_count(
        &self,
        segment_id: SegmentId,
    ) -> u32 {
        self.segment(segment_id).increase_occupied_stripe_count()
    }

    pub fn valid_block_count_if_ssd(
        &self,
        segment_id: SegmentId,
    ) -> Option<u32> {
        self.segment(segment_id).valid_block_count_if_ssd()
    }

    pub fn free_segment_count(&self) -> usize {
        self.free_pool.len()
    }

    pub fn victim_segment_count(&self) -> usize {
        self.victim_pool.len()
    }

    pub fn free_pool(&self) -> &SegmentPool {
        &self.free_pool
    }

    pub fn victim_pool(&self) -> &SegmentPool {
        &self.victim_pool
    }

    /// Clear both pools and repopulate them from the current record
    /// states; used when the array reinitializes membership after
    /// rebuild or replay.
    pub fn reset_pools(&self) {
        self.free_pool.reset();
        self.victim_pool.reset();

        for record in &self.segments {
            match record.state() {
                SegmentState::Free => self.free_pool.add(record.segment_id()),
                SegmentState::Victim => {
                    self.victim_pool.add(record.segment_id())
                }
                SegmentState::Nvram | SegmentState::Ssd => {}
            }
        }

        debug!(
            "reset pools of array {}: {} free, {} victims",
            self.config.array_id,
            self.free_pool.len(),
            self.victim_pool.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_context() -> SegmentContext {
        let config = Config { segments: 4, ..Config::default() };
        SegmentContext::new(config, Arc::new(Metrics::default()))
    }

    #[test]
    fn allocation_drains_the_free_pool() {
        let ctx = small_context();
        for expected in 0..4 {
            assert_eq!(ctx.allocate_free_segment(), Some(expected));
        }
        assert_eq!(ctx.allocate_free_segment(), None);
        assert_eq!(ctx.free_segment_count(), 0);
    }

    #[test]
    fn full_lifecycle_returns_segment_to_free_pool() {
        let ctx = small_context();
        let segment_id = ctx.allocate_free_segment().unwrap();

        ctx.increase_valid_block_count(segment_id, 8);
        ctx.increase_occupied_stripe_count(segment_id);
        assert!(!ctx.close_segment(segment_id));
        assert_eq!(ctx.valid_block_count_if_ssd(segment_id), Some(8));

        assert!(ctx.select_victim(segment_id));
        assert_eq!(ctx.victim_segment_count(), 1);
        assert_eq!(ctx.valid_block_count_if_ssd(segment_id), None);

        // GC relocates the victim's valid blocks, invalidating them here
        assert_eq!(
            ctx.decrease_valid_block_count(segment_id, 8, true),
            DecrementOutcome::Released { previous: SegmentState::Victim }
        );
        assert_eq!(ctx.victim_segment_count(), 0);
        assert!(ctx.free_pool().contains(segment_id));
        assert_eq!(ctx.segment(segment_id).occupied_stripe_count(), 0);
    }

    #[test]
    fn empty_segment_closes_straight_back_to_free() {
        let ctx = small_context();
        let segment_id = ctx.allocate_free_segment().unwrap();
        assert!(ctx.close_segment(segment_id));
        assert!(ctx.free_pool().contains(segment_id));
    }

    #[test]
    fn victim_without_release_flag_stays_victim() {
        let ctx = small_context();
        let segment_id = ctx.allocate_free_segment().unwrap();
        ctx.increase_valid_block_count(segment_id, 1);
        ctx.close_segment(segment_id);
        ctx.select_victim(segment_id);

        assert_eq!(
            ctx.decrease_valid_block_count(segment_id, 1, false),
            DecrementOutcome::Occupied(SegmentState::Victim)
        );
        assert_eq!(ctx.victim_segment_count(), 1);
        assert!(!ctx.free_pool().contains(segment_id));
    }

    #[test]
    fn reset_pools_rebuilds_membership_from_states() {
        let ctx = small_context();
        let a = ctx.allocate_free_segment().unwrap();
        let b = ctx.allocate_free_segment().unwrap();
        ctx.increase_valid_block_count(b, 1);
        ctx.close_segment(b);
        ctx.select_victim(b);

        ctx.reset_pools();
        assert_eq!(ctx.free_segment_count(), 2);
        assert!(!ctx.free_pool().contains(a));
        assert_eq!(ctx.victim_pool().snapshot().into_iter().collect::<Vec<_>>(), vec![b]);
    }
}
