//! The reverse-map page IO engine.
//!
//! A `ReverseMapPack` holds one stripe's reverse mapping as a header
//! page (index 0) followed by packed map pages. A `ReverseMapIo`
//! orchestrates the asynchronous page reads or writes that persist or
//! restore one pack, tracking completion by count because pages may
//! complete in any order, and invoking a single-shot continuation
//! exactly once when every page has finished. The `ReverseMapManager`
//! owns the backing file and the in-flight operation table.

use std::io;
use std::sync::atomic::{
    AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8,
    Ordering::SeqCst,
};
use std::sync::Arc;

use fnv::FnvHashMap;
use log::{error, trace};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    BlkAddr, Config, Continuation, Error, IoOpcode, Metrics, PageFile,
    PageIoRequest, Result, StripeId, ThreadPool, REVMAP_ENTRY_LEN,
    UNMAP_RBA,
};

const HEADER_MAGIC: u32 = 0x7265_766d;
const HEADER_VERSION: u32 = 1;

/// Whether an operation moves pages from the file into the pack or the
/// other way around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Load,
    Flush,
}

/// Progress of one reverse-map operation. The name is historical; the
/// same flag covers both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MapFlushState {
    Flushing = 0,
    FlushDone = 1,
}

fn flush_state_from_u8(raw: u8) -> MapFlushState {
    match raw {
        0 => MapFlushState::Flushing,
        _ => MapFlushState::FlushDone,
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct PackHeader {
    magic: u32,
    version: u32,
    vsid: StripeId,
    wb_lsid: StripeId,
    num_pages: u32,
}

fn pack_entry(rba: BlkAddr, volume_id: u32) -> [u8; REVMAP_ENTRY_LEN] {
    let mut bytes = [0; REVMAP_ENTRY_LEN];
    bytes[..8].copy_from_slice(&rba.to_le_bytes());
    bytes[8..].copy_from_slice(&volume_id.to_le_bytes());
    bytes
}

fn unpack_entry(bytes: &[u8]) -> (BlkAddr, u32) {
    let rba = BlkAddr::from_le_bytes(bytes[..8].try_into().unwrap());
    let volume_id = u32::from_le_bytes(bytes[8..].try_into().unwrap());
    (rba, volume_id)
}

/// One stripe's reverse-map pack: the block-offset-to-logical-address
/// mapping that lets replay reconstruct forward maps and GC relocate
/// still-valid blocks.
///
/// Page buffers are shared with in-flight IO completions, so each page
/// sits behind its own lock.
#[derive(Debug)]
pub struct ReverseMapPack {
    vsid: AtomicU32,
    wb_lsid: AtomicU32,
    page_size: usize,
    blocks_per_stripe: u32,
    pages: Vec<Arc<Mutex<Vec<u8>>>>,
    header_valid: AtomicBool,
}

impl ReverseMapPack {
    pub fn new(
        config: &Config,
        vsid: StripeId,
        wb_lsid: StripeId,
    ) -> ReverseMapPack {
        let page_count = config.revmap_pages_per_stripe() as usize;
        assert!(
            page_count >= 2,
            "a reverse map pack needs a header page and at least one \
             map page"
        );

        let pages = (0..page_count)
            .map(|_| Arc::new(Mutex::new(vec![0; config.revmap_page_size])))
            .collect();

        let pack = ReverseMapPack {
            vsid: AtomicU32::new(vsid),
            wb_lsid: AtomicU32::new(wb_lsid),
            page_size: config.revmap_page_size,
            blocks_per_stripe: config.blocks_per_stripe(),
            pages,
            header_valid: AtomicBool::new(false),
        };
        pack.assign(wb_lsid, vsid);
        pack
    }

    /// Re-target this pack to a stripe: clear every map entry back to
    /// unmapped and seal a fresh header.
    pub fn assign(&self, wb_lsid: StripeId, vsid: StripeId) {
        self.vsid.store(vsid, SeqCst);
        self.wb_lsid.store(wb_lsid, SeqCst);
        for page in self.pages.iter().skip(1) {
            page.lock().fill(0xff);
        }
        self.seal_header();
        self.header_valid.store(true, SeqCst);
        trace!("assigned reverse map pack to vsid {} wb lsid {}", vsid, wb_lsid);
    }

    pub fn vsid(&self) -> StripeId {
        self.vsid.load(SeqCst)
    }

    pub fn wb_lsid(&self) -> StripeId {
        self.wb_lsid.load(SeqCst)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn header_is_valid(&self) -> bool {
        self.header_valid.load(SeqCst)
    }

    pub(crate) fn page(&self, index: usize) -> Arc<Mutex<Vec<u8>>> {
        self.pages[index].clone()
    }

    fn entries_per_page(&self) -> usize {
        self.page_size / REVMAP_ENTRY_LEN
    }

    fn entry_location(&self, block_offset: u64) -> Result<(usize, usize)> {
        if block_offset >= u64::from(self.blocks_per_stripe) {
            return Err(Error::Unsupported(format!(
                "block offset {} is outside a stripe of {} blocks",
                block_offset, self.blocks_per_stripe
            )));
        }
        let index = block_offset as usize;
        let page = 1 + index / self.entries_per_page();
        let byte = (index % self.entries_per_page()) * REVMAP_ENTRY_LEN;
        Ok((page, byte))
    }

    /// Record that the block at `block_offset` within this stripe now
    /// holds the data for `rba` of volume `volume_id`.
    pub fn update_entry(
        &self,
        block_offset: u64,
        rba: BlkAddr,
        volume_id: u32,
    ) -> Result<()> {
        let (page, byte) = self.entry_location(block_offset)?;
        let mut guard = self.pages[page].lock();
        guard[byte..byte + REVMAP_ENTRY_LEN]
            .copy_from_slice(&pack_entry(rba, volume_id));
        Ok(())
    }

    /// The `(rba, volume_id)` recorded for `block_offset`, or `None`
    /// if the block has not been mapped.
    pub fn entry(
        &self,
        block_offset: u64,
    ) -> Result<Option<(BlkAddr, u32)>> {
        let (page, byte) = self.entry_location(block_offset)?;
        let guard = self.pages[page].lock();
        let (rba, volume_id) =
            unpack_entry(&guard[byte..byte + REVMAP_ENTRY_LEN]);
        if rba == UNMAP_RBA {
            Ok(None)
        } else {
            Ok(Some((rba, volume_id)))
        }
    }

    /// Serialize the header into page 0, guarded by a crc of the
    /// serialized bytes.
    fn seal_header(&self) {
        let header = PackHeader {
            magic: HEADER_MAGIC,
            version: HEADER_VERSION,
            vsid: self.vsid.load(SeqCst),
            wb_lsid: self.wb_lsid.load(SeqCst),
            num_pages: self.pages.len() as u32,
        };
        let body = bincode::serialize(&header)
            .expect("a plain header struct always serializes");
        assert!(8 + body.len() <= self.page_size);

        let mut page = self.pages[0].lock();
        page[..4].copy_from_slice(&crc32fast::hash(&body).to_le_bytes());
        page[4..8].copy_from_slice(&(body.len() as u32).to_le_bytes());
        page[8..8 + body.len()].copy_from_slice(&body);
    }

    /// Parse and validate page 0 after a load. Called from the IO
    /// completion path as soon as the header page is in memory, so
    /// header-dependent reconstruction never waits for unrelated map
    /// pages.
    pub fn header_loaded(&self) -> Result<()> {
        let vsid = self.vsid.load(SeqCst);
        let page = self.pages[0].lock();

        let crc_expected =
            u32::from_le_bytes(page[..4].try_into().unwrap());
        let body_len =
            u32::from_le_bytes(page[4..8].try_into().unwrap()) as usize;
        if 8 + body_len > self.page_size {
            return Err(Error::Corruption { vsid });
        }

        let body = &page[8..8 + body_len];
        if crc32fast::hash(body) != crc_expected {
            return Err(Error::Corruption { vsid });
        }

        let header: PackHeader = bincode::deserialize(body)
            .map_err(|_| Error::Corruption { vsid })?;

        if header.magic != HEADER_MAGIC
            || header.version != HEADER_VERSION
            || header.num_pages != self.pages.len() as u32
            || header.vsid != vsid
        {
            return Err(Error::Corruption { vsid });
        }

        self.wb_lsid.store(header.wb_lsid, SeqCst);
        self.header_valid.store(true, SeqCst);
        trace!("reconstructed reverse map header for stripe {}", vsid);
        Ok(())
    }
}

/// One in-flight load or flush of a pack's pages.
///
/// Completion is tracked by count rather than by an expected-next-index
/// sequence because the underlying IO completes out of order; the only
/// index that matters is 0, the header page. The continuation is taken
/// out of its slot before being handed to the scheduler, so re-entrant
/// completions can never fire it twice.
pub struct ReverseMapIo {
    pack: Arc<ReverseMapPack>,
    direction: IoDirection,
    file: Arc<dyn PageFile>,
    file_offset: u64,
    flush_state: AtomicU8,
    io_error: AtomicI32,
    done_pages: AtomicU32,
    issued_io_count: AtomicU64,
    total_io_count: AtomicU64,
    continuation: Mutex<Option<Continuation>>,
    scheduler: ThreadPool,
    notify: Box<dyn Fn(&ReverseMapIo) + Send + Sync>,
    metrics: Arc<Metrics>,
}

impl ReverseMapIo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pack: Arc<ReverseMapPack>,
        continuation: Option<Continuation>,
        file: Arc<dyn PageFile>,
        file_offset: u64,
        direction: IoDirection,
        metrics: Arc<Metrics>,
        scheduler: ThreadPool,
        notify: Box<dyn Fn(&ReverseMapIo) + Send + Sync>,
    ) -> Arc<ReverseMapIo> {
        Arc::new(ReverseMapIo {
            pack,
            direction,
            file,
            file_offset,
            flush_state: AtomicU8::new(MapFlushState::FlushDone as u8),
            io_error: AtomicI32::new(0),
            done_pages: AtomicU32::new(0),
            issued_io_count: AtomicU64::new(0),
            total_io_count: AtomicU64::new(0),
            continuation: Mutex::new(continuation),
            scheduler,
            notify,
            metrics,
        })
    }

    /// Issue one asynchronous read per page of the pack.
    pub fn load(this: &Arc<ReverseMapIo>) -> Result<()> {
        ReverseMapIo::issue_pages(this, IoOpcode::Read)
    }

    /// Issue one asynchronous write per page of the pack.
    pub fn flush(this: &Arc<ReverseMapIo>) -> Result<()> {
        ReverseMapIo::issue_pages(this, IoOpcode::Write)
    }

    fn issue_pages(
        this: &Arc<ReverseMapIo>,
        opcode: IoOpcode,
    ) -> Result<()> {
        this.flush_state
            .store(MapFlushState::Flushing as u8, SeqCst);

        let page_count = this.pack.page_count();
        let page_size = this.pack.page_size();
        this.total_io_count.store(page_count as u64, SeqCst);

        let mut offset = this.file_offset;
        for index in 0..page_count {
            let page_index = index as u32;
            let operation = this.clone();
            let request = PageIoRequest {
                opcode,
                offset,
                len: page_size,
                buf: this.pack.page(index),
                page_index,
                vsid: this.pack.vsid(),
                completion: Box::new(move |res| {
                    operation.page_io_done(page_index, res)
                }),
            };

            if let Err(e) = this.file.submit(request) {
                error!(
                    "failed to submit reverse map page {} for stripe {}: {}",
                    index,
                    this.pack.vsid(),
                    e
                );
                this.record_error(&e);
                this.flush_state
                    .store(MapFlushState::FlushDone as u8, SeqCst);
                // drop rather than invoke: the operation gives up
                // waiting, though already-issued pages still complete
                // behind it
                drop(this.continuation.lock().take());
                return Err(e.into());
            }

            offset += page_size as u64;
            this.issued_io_count.fetch_add(1, SeqCst);
            this.metrics.revmap_page_issued();
        }

        Ok(())
    }

    fn record_error(&self, e: &io::Error) {
        let code = e.raw_os_error().unwrap_or(-1);
        let _ = self.io_error.compare_exchange(0, code, SeqCst, SeqCst);
    }

    fn page_io_done(&self, page_index: u32, res: io::Result<()>) {
        if let Err(ref e) = res {
            error!(
                "reverse map page {} io error for stripe {}: {}",
                page_index,
                self.pack.vsid(),
                e
            );
            self.record_error(e);
        }

        self.metrics.revmap_page_completed();
        let done = self.done_pages.fetch_add(1, SeqCst) + 1;

        if self.direction == IoDirection::Load && page_index == 0 {
            // the pack cannot be interpreted without its header, so a
            // reconstruction failure here is unrecoverable
            if let Err(e) = self.pack.header_loaded() {
                error!(
                    "failed to reconstruct reverse map header for \
                     stripe {}: {}",
                    self.pack.vsid(),
                    e
                );
                panic!(
                    "reverse map pack for stripe {} is uninterpretable \
                     without its header: {}",
                    self.pack.vsid(),
                    e
                );
            }
        }

        if u64::from(done) == self.total_io_count.load(SeqCst) {
            self.flush_state
                .store(MapFlushState::FlushDone as u8, SeqCst);

            let continuation = self.continuation.lock().take();
            if let Some(continuation) = continuation {
                // the completion context must not recurse into the
                // allocation path synchronously, so the continuation
                // runs deferred on the scheduler
                self.scheduler.spawn(continuation);
            }

            (self.notify)(self);
        }
    }

    /// Spin until the operation is no longer in flight. Intentionally
    /// lock-free and allocation-free so it can be called from
    /// performance-sensitive paths, at the cost of burning CPU.
    pub fn wait_pending_io_done(&self) {
        while self.flush_state() == MapFlushState::Flushing {
            std::hint::spin_loop();
        }
    }

    pub fn flush_state(&self) -> MapFlushState {
        flush_state_from_u8(self.flush_state.load(SeqCst))
    }

    pub fn issued_io_count(&self) -> u64 {
        self.issued_io_count.load(SeqCst)
    }

    /// The first non-zero error code observed across submissions and
    /// page completions, or 0 if none.
    pub fn io_error(&self) -> i32 {
        self.io_error.load(SeqCst)
    }
}

/// Allocates packs, drives their loads and flushes against the backing
/// reverse-map file, and tracks in-flight operations so callers can
/// drain them before teardown.
pub struct ReverseMapManager {
    config: Config,
    file: Arc<dyn PageFile>,
    scheduler: ThreadPool,
    metrics: Arc<Metrics>,
    inflight: Arc<Mutex<FnvHashMap<u64, Arc<ReverseMapIo>>>>,
    next_op_id: AtomicU64,
}

impl ReverseMapManager {
    pub fn new(
        config: Config,
        file: Arc<dyn PageFile>,
        scheduler: ThreadPool,
        metrics: Arc<Metrics>,
    ) -> ReverseMapManager {
        ReverseMapManager {
            config,
            file,
            scheduler,
            metrics,
            inflight: Arc::new(Mutex::new(FnvHashMap::default())),
            next_op_id: AtomicU64::new(0),
        }
    }

    pub fn alloc_pack(
        &self,
        vsid: StripeId,
        wb_lsid: StripeId,
    ) -> Arc<ReverseMapPack> {
        Arc::new(ReverseMapPack::new(&self.config, vsid, wb_lsid))
    }

    /// Begin restoring `pack` from the file. `continuation` runs once,
    /// deferred, after every page has completed.
    pub fn load(
        &self,
        pack: Arc<ReverseMapPack>,
        continuation: Option<Continuation>,
    ) -> Result<Arc<ReverseMapIo>> {
        self.start_io(pack, continuation, IoDirection::Load)
    }

    /// Begin persisting `pack` to the file. `continuation` runs once,
    /// deferred, after every page has completed.
    pub fn flush(
        &self,
        pack: Arc<ReverseMapPack>,
        continuation: Option<Continuation>,
    ) -> Result<Arc<ReverseMapIo>> {
        self.start_io(pack, continuation, IoDirection::Flush)
    }

    fn start_io(
        &self,
        pack: Arc<ReverseMapPack>,
        continuation: Option<Continuation>,
        direction: IoDirection,
    ) -> Result<Arc<ReverseMapIo>> {
        let op_id = self.next_op_id.fetch_add(1, SeqCst);
        let file_offset = u64::from(pack.vsid())
            * self.config.revmap_file_size_per_stripe();

        let inflight = self.inflight.clone();
        let notify = Box::new(move |_operation: &ReverseMapIo| {
            inflight.lock().remove(&op_id);
        });

        let operation = ReverseMapIo::new(
            pack,
            continuation,
            self.file.clone(),
            file_offset,
            direction,
            self.metrics.clone(),
            self.scheduler.clone(),
            notify,
        );

        // register before issuing so a fast completion finds its entry
        self.inflight.lock().insert(op_id, operation.clone());

        let res = match direction {
            IoDirection::Load => ReverseMapIo::load(&operation),
            IoDirection::Flush => ReverseMapIo::flush(&operation),
        };

        if let Err(e) = res {
            // the operation gave up waiting, so its notify hook will
            // never fire; unregister here or the zombie would wedge
            // wait_all_pending_io_done
            self.inflight.lock().remove(&op_id);
            return Err(e);
        }

        Ok(operation)
    }

    pub fn pending_io_count(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Spin until every in-flight operation has notified completion.
    pub fn wait_all_pending_io_done(&self) {
        loop {
            if self.inflight.lock().is_empty() {
                return;
            }
            std::hint::spin_loop();
        }
    }

    pub fn file_size_per_stripe(&self) -> u64 {
        self.config.revmap_file_size_per_stripe()
    }

    pub fn whole_file_size(&self) -> u64 {
        self.config.revmap_whole_file_size()
    }
}
