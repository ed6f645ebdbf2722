//! Asynchronous page IO against the reverse-map file.
//!
//! Submission never waits for completion: `submit` validates the
//! request, hands the positional read or write to the threadpool, and
//! returns. The completion closure runs on a worker thread with the
//! result of the transfer.

use std::fmt::{self, Debug};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use fault_injection::{annotate, fallible};
use fs2::FileExt as _;
use parking_lot::Mutex;

use crate::{StripeId, ThreadPool};

/// The transfer direction of one page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOpcode {
    Read,
    Write,
}

/// One asynchronous page request: a contiguous byte range at an
/// absolute file offset, addressed by a 0-based page index within its
/// pack, with a completion that fires exactly once when the transfer
/// finishes or fails.
pub struct PageIoRequest {
    pub opcode: IoOpcode,
    pub offset: u64,
    pub len: usize,
    pub buf: Arc<Mutex<Vec<u8>>>,
    pub page_index: u32,
    pub vsid: StripeId,
    pub completion: Box<dyn FnOnce(io::Result<()>) + Send + 'static>,
}

impl Debug for PageIoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageIoRequest")
            .field("opcode", &self.opcode)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("page_index", &self.page_index)
            .field("vsid", &self.vsid)
            .finish()
    }
}

/// The asynchronous-submit primitive the reverse-map IO engine issues
/// pages against. `submit` returns an immediate error if the request
/// cannot be started; transfer errors are delivered to the request's
/// completion instead.
pub trait PageFile: Send + Sync {
    fn submit(&self, request: PageIoRequest) -> io::Result<()>;
}

#[cfg(unix)]
mod sys_io {
    use std::io;
    use std::os::unix::fs::FileExt;

    use fault_injection::maybe;

    pub fn read_exact_at(
        file: &std::fs::File,
        buf: &mut [u8],
        offset: u64,
    ) -> io::Result<()> {
        maybe!(file.read_exact_at(buf, offset))
    }

    pub fn write_all_at(
        file: &std::fs::File,
        buf: &[u8],
        offset: u64,
    ) -> io::Result<()> {
        maybe!(file.write_all_at(buf, offset))
    }
}

#[cfg(windows)]
mod sys_io {
    use std::io;
    use std::os::windows::fs::FileExt;

    use fault_injection::{annotate, maybe};

    pub fn read_exact_at(
        file: &std::fs::File,
        mut buf: &mut [u8],
        mut offset: u64,
    ) -> io::Result<()> {
        while !buf.is_empty() {
            match maybe!(file.seek_read(buf, offset)) {
                Ok(0) => break,
                Ok(n) => {
                    let tmp = buf;
                    buf = &mut tmp[n..];
                    offset += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(annotate!(e)),
            }
        }
        if !buf.is_empty() {
            Err(annotate!(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer"
            )))
        } else {
            Ok(())
        }
    }

    pub fn write_all_at(
        file: &std::fs::File,
        mut buf: &[u8],
        mut offset: u64,
    ) -> io::Result<()> {
        while !buf.is_empty() {
            match maybe!(file.seek_write(buf, offset)) {
                Ok(0) => {
                    return Err(annotate!(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    )));
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(annotate!(e)),
            }
        }
        Ok(())
    }
}

/// A `PageFile` backed by a preallocated, exclusively locked file on
/// disk, with transfers executed on the shared threadpool.
#[derive(Debug)]
pub struct FilePageIo {
    file: Arc<fs::File>,
    len: u64,
    pool: ThreadPool,
}

impl FilePageIo {
    /// Open (creating if needed) and exclusively lock the reverse-map
    /// file, preallocating it to `len` bytes.
    pub fn open<P: AsRef<Path>>(
        path: P,
        len: u64,
        pool: ThreadPool,
    ) -> io::Result<FilePageIo> {
        let file = fallible!(fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path.as_ref()));
        fallible!(file.try_lock_exclusive());
        fallible!(file.set_len(len));

        Ok(FilePageIo { file: Arc::new(file), len, pool })
    }

    /// Flush file contents and metadata to the device.
    pub fn sync(&self) -> io::Result<()> {
        fallible!(self.file.sync_all());
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PageFile for FilePageIo {
    fn submit(&self, request: PageIoRequest) -> io::Result<()> {
        let end = request
            .offset
            .checked_add(request.len as u64)
            .ok_or_else(|| {
                annotate!(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "page request offset overflow"
                ))
            })?;
        if end > self.len {
            return Err(annotate!(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "page request {:?} extends past file length {}",
                    request, self.len
                )
            )));
        }

        let file = self.file.clone();
        let PageIoRequest { opcode, offset, len, buf, completion, .. } =
            request;

        self.pool.spawn(move || {
            let res = match opcode {
                IoOpcode::Read => {
                    let mut guard = buf.lock();
                    sys_io::read_exact_at(&file, &mut guard[..len], offset)
                }
                IoOpcode::Write => {
                    let guard = buf.lock();
                    sys_io::write_all_at(&file, &guard[..len], offset)
                }
            };
            (completion)(res);
        });

        Ok(())
    }
}
