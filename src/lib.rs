//! `segmap` is the segment-management core of a log-structured flash
//! storage engine: per-segment valid-block accounting with a lifecycle
//! state machine, lifecycle-state pools, and the asynchronous reverse-map
//! page IO engine that persists and restores the block-to-address reverse
//! mapping used to rebuild forward maps and drive garbage collection.
//!
//! It must maintain these critical safety properties:
//!
//! A. A segment may only return to the free pool through the accounting
//!    path, when its valid-block count reaches zero while it is resident
//!    on SSD (or is a GC victim, when victim release is permitted).
//! B. The completion continuation of a reverse-map operation fires after
//!    every constituent page has completed, exactly once, regardless of
//!    the order in which pages complete.
//!
//! Decrements that cross zero are serialized against explicit state
//! transitions by a per-segment lock, so a stray decrement can never race
//! a victim assignment into double-freeing a segment. Plain counter
//! increments do not participate in transitions and stay lock-free.

mod config;
mod context;
mod file;
mod metrics;
mod oneshot;
mod pool;
mod result;
mod revmap;
mod segment;
mod threadpool;

pub use self::{
    config::Config,
    context::SegmentContext,
    file::{FilePageIo, IoOpcode, PageFile, PageIoRequest},
    metrics::Metrics,
    oneshot::{OneShot, OneShotFiller},
    pool::SegmentPool,
    result::{Error, Result},
    revmap::{
        IoDirection, MapFlushState, ReverseMapIo, ReverseMapManager,
        ReverseMapPack,
    },
    segment::{DecrementOutcome, SegmentRecord, SegmentState},
    threadpool::ThreadPool,
};

/// The id of one erase-unit-sized segment within an array.
pub type SegmentId = u32;

/// The id of the array a segment belongs to.
pub type ArrayId = u32;

/// The virtual id of a stripe, which is also the index of its
/// reverse-map pack within the reverse-map file.
pub type StripeId = u32;

/// A logical block address recorded in the reverse map.
pub type BlkAddr = u64;

/// A deferred unit of work handed to the scheduler when a reverse-map
/// operation completes.
pub type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// Length in bytes of one packed reverse-map entry: a little-endian
/// `BlkAddr` followed by a little-endian volume id.
pub(crate) const REVMAP_ENTRY_LEN: usize = 12;

/// Sentinel block address marking a reverse-map entry that has not been
/// mapped yet.
pub(crate) const UNMAP_RBA: BlkAddr = BlkAddr::MAX;
