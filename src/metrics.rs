use std::sync::atomic::{
    AtomicU64,
    Ordering::{Acquire, Relaxed},
};

/// A metric collector handed to each component at construction.
///
/// Counters are bumped with relaxed atomics on hot paths; readers that
/// want a consistent-enough view load with acquire ordering.
#[derive(Default, Debug)]
pub struct Metrics {
    pub revmap_pages_issued: AtomicU64,
    pub revmap_pages_completed: AtomicU64,
    pub segments_freed: AtomicU64,
    pub pool_duplicate_adds: AtomicU64,
    pub pool_missed_removes: AtomicU64,
    pub valid_count_underflows: AtomicU64,
}

impl Metrics {
    #[inline]
    pub fn revmap_page_issued(&self) {
        self.revmap_pages_issued.fetch_add(1, Relaxed);
    }

    #[inline]
    pub fn revmap_page_completed(&self) {
        self.revmap_pages_completed.fetch_add(1, Relaxed);
    }

    #[inline]
    pub fn segment_freed(&self) {
        self.segments_freed.fetch_add(1, Relaxed);
    }

    #[inline]
    pub fn pool_duplicate_add(&self) {
        self.pool_duplicate_adds.fetch_add(1, Relaxed);
    }

    #[inline]
    pub fn pool_missed_remove(&self) {
        self.pool_missed_removes.fetch_add(1, Relaxed);
    }

    #[inline]
    pub fn valid_count_underflow(&self) {
        self.valid_count_underflows.fetch_add(1, Relaxed);
    }

    pub fn print_profile(&self) {
        println!("segmap profile:");
        println!(
            "reverse map pages issued: {}",
            self.revmap_pages_issued.load(Acquire)
        );
        println!(
            "reverse map pages completed: {}",
            self.revmap_pages_completed.load(Acquire)
        );
        println!("segments freed: {}", self.segments_freed.load(Acquire));
        println!(
            "pool duplicate adds: {}",
            self.pool_duplicate_adds.load(Acquire)
        );
        println!(
            "pool missed removes: {}",
            self.pool_missed_removes.load(Acquire)
        );
        println!(
            "valid count underflows: {}",
            self.valid_count_underflows.load(Acquire)
        );
    }
}
