use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tempdir::TempDir;

use segmap::{
    Config, FilePageIo, MapFlushState, Metrics, ReverseMapManager,
    ThreadPool,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            Instant::now() < deadline,
            "condition not reached within timeout"
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn manager_over_temp_file(
    config: &Config,
) -> (TempDir, Arc<Metrics>, ReverseMapManager) {
    let tmp = TempDir::new("segmap").unwrap();
    let pool = ThreadPool::new("revmap");
    let file = Arc::new(
        FilePageIo::open(
            tmp.path().join("revmap"),
            config.revmap_whole_file_size(),
            pool.clone(),
        )
        .unwrap(),
    );
    let metrics = Arc::new(Metrics::default());
    let manager = ReverseMapManager::new(
        config.clone(),
        file,
        pool,
        metrics.clone(),
    );
    (tmp, metrics, manager)
}

#[test]
fn flush_then_load_round_trips_entries() {
    init_logger();

    let config = Config::default();
    let (_tmp, metrics, manager) = manager_over_temp_file(&config);
    let pages_per_stripe = u64::from(config.revmap_pages_per_stripe());

    let pack = manager.alloc_pack(5, 2);
    for block_offset in 0..u64::from(config.blocks_per_stripe()) {
        pack.update_entry(block_offset, 1_000 + block_offset, 3).unwrap();
    }

    let flushed = Arc::new(AtomicUsize::new(0));
    let continuation: segmap::Continuation = {
        let flushed = flushed.clone();
        Box::new(move || {
            flushed.fetch_add(1, SeqCst);
        })
    };
    let operation = manager.flush(pack, Some(continuation)).unwrap();
    assert_eq!(operation.issued_io_count(), pages_per_stripe);

    operation.wait_pending_io_done();
    assert_eq!(operation.flush_state(), MapFlushState::FlushDone);
    assert_eq!(operation.io_error(), 0);
    manager.wait_all_pending_io_done();
    wait_until(|| flushed.load(SeqCst) == 1);

    // a fresh pack for the same stripe, deliberately assigned a stale
    // write-buffer lsid that the loaded header must correct
    let restored = manager.alloc_pack(5, 0);
    let operation = manager.load(restored.clone(), None).unwrap();
    operation.wait_pending_io_done();
    manager.wait_all_pending_io_done();

    assert_eq!(operation.io_error(), 0);
    assert!(restored.header_is_valid());
    assert_eq!(restored.wb_lsid(), 2);
    for block_offset in 0..u64::from(config.blocks_per_stripe()) {
        assert_eq!(
            restored.entry(block_offset).unwrap(),
            Some((1_000 + block_offset, 3))
        );
    }

    assert_eq!(
        metrics.revmap_pages_issued.load(SeqCst),
        2 * pages_per_stripe
    );
    assert_eq!(
        metrics.revmap_pages_completed.load(SeqCst),
        2 * pages_per_stripe
    );
}

#[test]
fn stripes_flush_to_disjoint_file_regions() {
    init_logger();

    let config = Config::default();
    let (_tmp, _metrics, manager) = manager_over_temp_file(&config);

    for vsid in [0, 1, 7] {
        let pack = manager.alloc_pack(vsid, vsid + 10);
        pack.update_entry(0, u64::from(vsid) * 100, vsid).unwrap();
        manager.flush(pack, None).unwrap();
    }
    manager.wait_all_pending_io_done();

    for vsid in [0, 1, 7] {
        let restored = manager.alloc_pack(vsid, 0);
        let operation = manager.load(restored.clone(), None).unwrap();
        operation.wait_pending_io_done();
        assert_eq!(
            restored.entry(0).unwrap(),
            Some((u64::from(vsid) * 100, vsid))
        );
        assert_eq!(restored.wb_lsid(), vsid + 10);
    }
    manager.wait_all_pending_io_done();
}

#[test]
fn wait_all_pending_io_done_drains_concurrent_operations() {
    init_logger();

    let config = Config::default();
    let (_tmp, _metrics, manager) = manager_over_temp_file(&config);

    let completions = Arc::new(AtomicUsize::new(0));
    let stripes = 16;
    let mut order: Vec<u32> = (0..stripes).collect();
    order.shuffle(&mut rand::rng());
    for vsid in order {
        let pack = manager.alloc_pack(vsid, vsid);
        pack.update_entry(1, u64::from(vsid), 0).unwrap();
        let completions = completions.clone();
        manager
            .flush(
                pack,
                Some(Box::new(move || {
                    completions.fetch_add(1, SeqCst);
                })),
            )
            .unwrap();
    }

    manager.wait_all_pending_io_done();
    assert_eq!(manager.pending_io_count(), 0);
    wait_until(|| completions.load(SeqCst) == stripes as usize);
}

#[test]
fn out_of_bounds_stripe_fails_at_submission() {
    init_logger();

    let config = Config::default();
    let (_tmp, _metrics, manager) = manager_over_temp_file(&config);

    // one past the end of the preallocated file
    let pack = manager.alloc_pack(config.total_stripes(), 0);
    assert!(manager.flush(pack, None).is_err());
    assert_eq!(manager.pending_io_count(), 0);
}
