//! Per-segment accounting state and the lifecycle state machine.
//!
//! A segment starts `Free`, is claimed for write-buffer use (`Nvram`),
//! closes out to the main store (`Ssd`), may be chosen for garbage
//! collection (`Victim`), and returns to `Free` when its last valid
//! block is invalidated. The decrement-to-zero path is the single place
//! a segment can autonomously leave the live pools, so it is serialized
//! against explicit state transitions by the per-segment lock; counter
//! increments never change state and stay lock-free.

use std::sync::atomic::{
    AtomicI64, AtomicU32,
    Ordering::SeqCst,
};

use log::{error, trace, warn};
use parking_lot::Mutex;

use crate::{ArrayId, SegmentId};

/// Lifecycle state of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Unused, eligible for allocation.
    Free,
    /// Backing in-progress stripe writes in the write buffer.
    Nvram,
    /// Closed out to the main store.
    Ssd,
    /// Selected for garbage collection.
    Victim,
}

/// The outcome of a valid-block decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecrementOutcome {
    /// The count reached zero and the segment was released to `Free`.
    Released {
        /// The state the segment was released from.
        previous: SegmentState,
    },
    /// Blocks remain valid (or release was not permitted from the
    /// current state); no transition happened.
    Occupied(SegmentState),
    /// More blocks were invalidated than were valid. The raw counter is
    /// left negative and no transition happens; this indicates a bug in
    /// the caller's accounting.
    Underflowed,
}

/// Mutable accounting state for one segment.
///
/// The valid-block counter is kept in a signed atomic so that an
/// underflow is observable as a negative total rather than a wrapped
/// one. State reads and writes that must be consistent with a
/// concurrent decrement-to-zero all go through `lock`.
#[derive(Debug)]
pub struct SegmentRecord {
    valid_block_count: AtomicI64,
    occupied_stripe_count: AtomicU32,
    state: Mutex<SegmentState>,
    array_id: ArrayId,
    segment_id: SegmentId,
}

impl SegmentRecord {
    pub fn new(array_id: ArrayId, segment_id: SegmentId) -> SegmentRecord {
        SegmentRecord {
            valid_block_count: AtomicI64::new(0),
            occupied_stripe_count: AtomicU32::new(0),
            state: Mutex::new(SegmentState::Free),
            array_id,
            segment_id,
        }
    }

    /// Construct a record with injected preconditions, for tests and
    /// diagnostic tooling only.
    #[doc(hidden)]
    pub fn new_with_state(
        array_id: ArrayId,
        segment_id: SegmentId,
        valid_block_count: u32,
        occupied_stripe_count: u32,
        state: SegmentState,
    ) -> SegmentRecord {
        SegmentRecord {
            valid_block_count: AtomicI64::new(i64::from(valid_block_count)),
            occupied_stripe_count: AtomicU32::new(occupied_stripe_count),
            state: Mutex::new(state),
            array_id,
            segment_id,
        }
    }

    pub fn array_id(&self) -> ArrayId {
        self.array_id
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn valid_block_count(&self) -> u32 {
        self.valid_block_count.load(SeqCst).max(0) as u32
    }

    /// Direct counter setter, for test and diagnostic injection only;
    /// normal operation must go through the accounting path.
    #[doc(hidden)]
    pub fn set_valid_block_count(&self, count: u32) {
        self.valid_block_count.store(i64::from(count), SeqCst);
    }

    pub fn occupied_stripe_count(&self) -> u32 {
        self.occupied_stripe_count.load(SeqCst)
    }

    pub fn set_occupied_stripe_count(&self, count: u32) {
        self.occupied_stripe_count.store(count, SeqCst);
    }

    /// Returns the new occupied-stripe total.
    pub fn increase_occupied_stripe_count(&self) -> u32 {
        self.occupied_stripe_count.fetch_add(1, SeqCst) + 1
    }

    pub fn state(&self) -> SegmentState {
        *self.state.lock()
    }

    /// Direct state setter, for test and diagnostic injection only;
    /// normal operation must go through the transition methods.
    #[doc(hidden)]
    pub fn set_state(&self, new_state: SegmentState) {
        let mut state = self.state.lock();
        trace!(
            "segment {} of array {} set from {:?} to {:?} by direct setter",
            self.segment_id,
            self.array_id,
            *state,
            new_state
        );
        *state = new_state;
    }

    /// Lock-free atomic add; returns the new total. Never changes state.
    pub fn increase_valid_block_count(&self, inc: u32) -> u32 {
        let new_total =
            self.valid_block_count.fetch_add(i64::from(inc), SeqCst)
                + i64::from(inc);
        new_total.max(0) as u32
    }

    /// Atomically subtracts `dec` from the valid-block count, releasing
    /// the segment to `Free` if the count reaches zero while release is
    /// permitted from the current state. `Ssd` segments are always
    /// eligible; `Victim` segments only when `allow_victim_release` is
    /// set.
    pub fn decrease_valid_block_count(
        &self,
        dec: u32,
        allow_victim_release: bool,
    ) -> DecrementOutcome {
        let mut state = self.state.lock();
        let decreased =
            self.valid_block_count.fetch_sub(i64::from(dec), SeqCst)
                - i64::from(dec);

        if decreased == 0 {
            let release = match *state {
                SegmentState::Ssd => true,
                SegmentState::Victim => allow_victim_release,
                _ => false,
            };

            if release {
                let previous = *state;
                self.move_to_free(&mut state);
                return DecrementOutcome::Released { previous };
            }
        } else if decreased < 0 {
            error!(
                "valid block count UNDERFLOWED on segment {} of array {}: \
                 decremented {} to total {}",
                self.segment_id, self.array_id, dec, decreased
            );
            return DecrementOutcome::Underflowed;
        }

        DecrementOutcome::Occupied(*state)
    }

    /// Claim this segment to back write-buffer stripes.
    ///
    /// # Panics
    /// Panics unless the segment is currently `Free`; requesting this
    /// transition from any other state is a programming error that
    /// would corrupt accounting if allowed to continue.
    pub fn move_to_nvram_state(&self) {
        let mut state = self.state.lock();
        if *state != SegmentState::Free {
            error!(
                "failed to move to NVRAM state. segment state {:?} \
                 valid count {} occupied stripe count {} segment {} array {}",
                *state,
                self.valid_block_count.load(SeqCst),
                self.occupied_stripe_count.load(SeqCst),
                self.segment_id,
                self.array_id
            );
            panic!(
                "segment {} of array {} moved to NVRAM from {:?}",
                self.segment_id, self.array_id, *state
            );
        }

        *state = SegmentState::Nvram;
        trace!(
            "segment {} of array {} moved from Free to Nvram",
            self.segment_id,
            self.array_id
        );
    }

    /// Close this segment out of the write buffer: if every block in it
    /// has already been invalidated, it goes straight back to `Free`
    /// (returning `true`); otherwise it moves to `Ssd` (returning
    /// `false`).
    pub fn move_to_ssd_or_free_if_empty(&self) -> bool {
        let mut state = self.state.lock();

        if self.valid_block_count.load(SeqCst) == 0 {
            self.move_to_free(&mut state);
            true
        } else {
            let previous = *state;
            *state = SegmentState::Ssd;
            trace!(
                "segment {} of array {} moved from {:?} to Ssd",
                self.segment_id,
                self.array_id,
                previous
            );
            false
        }
    }

    /// Select this segment as a GC victim. Legal only from `Ssd`;
    /// returns `false` without mutating otherwise, since the segment
    /// may legitimately have been released underneath the caller.
    pub fn move_to_victim_state(&self) -> bool {
        let mut state = self.state.lock();
        if *state != SegmentState::Ssd {
            warn!(
                "cannot move segment {} of array {} to victim state \
                 as it is {:?}, not Ssd",
                self.segment_id, self.array_id, *state
            );
            return false;
        }

        *state = SegmentState::Victim;
        trace!(
            "segment {} of array {} moved from Ssd to Victim",
            self.segment_id,
            self.array_id
        );
        true
    }

    /// Returns the valid-block count only while the segment is `Ssd`,
    /// so victim-selection policy never scores a segment that changed
    /// state underneath it.
    pub fn valid_block_count_if_ssd(&self) -> Option<u32> {
        let state = self.state.lock();
        if *state == SegmentState::Ssd {
            Some(self.valid_block_count.load(SeqCst).max(0) as u32)
        } else {
            None
        }
    }

    fn move_to_free(
        &self,
        state: &mut parking_lot::MutexGuard<'_, SegmentState>,
    ) {
        self.occupied_stripe_count.store(0, SeqCst);
        self.valid_block_count.store(0, SeqCst);
        let previous = **state;
        **state = SegmentState::Free;
        trace!(
            "segment {} of array {} moved from {:?} to Free",
            self.segment_id,
            self.array_id,
            previous
        );
    }
}
