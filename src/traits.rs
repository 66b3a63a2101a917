//! Storage collaborators.
//!
//! The [Vfs] trait gives synchronous, string-keyed access to files: sizes, ranged reads, ranged writes, and whole-file
//! replacement.  The cache uses it directly for everything that may block (statting the TOC, appending blobs, rewriting
//! the TOC), and hands the reads that must not block to an [AsyncIo].
//!
//! [AsyncIo] is the non-blocking read primitive: begin a read, get back an opaque [IoRequestId], then poll it until the
//! bytes are available.
use std::io::Error as IoError;

/// String-keyed file storage.
pub trait Vfs: Send + Sync + 'static {
    /// Size of the file at `key`, or `None` if there is no such file.
    fn file_size(&self, key: &str) -> Result<Option<u64>, IoError>;

    /// Read exactly `len` bytes starting at `offset`.
    fn read_at(&self, key: &str, offset: u64, len: usize) -> Result<Vec<u8>, IoError>;

    /// Write `data` at `offset`, creating the file if needed and growing it as necessary.
    fn write_at(&self, key: &str, offset: u64, data: &[u8]) -> Result<(), IoError>;

    /// Replace the entire contents of the file at `key`.
    fn replace(&self, key: &str, data: &[u8]) -> Result<(), IoError>;
}

/// Opaque handle to an outstanding [AsyncIo] read.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IoRequestId(u64);

impl IoRequestId {
    pub fn new(value: u64) -> IoRequestId {
        IoRequestId(value)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Non-blocking reads.
///
/// Every id returned from [AsyncIo::begin_read] must eventually be consumed by [AsyncIo::try_finish_read] returning
/// `Some` or by [AsyncIo::finish_read].  Polling an id which was never issued or was already consumed returns an error.
pub trait AsyncIo: Send + Sync + 'static {
    fn begin_read(&self, key: &str, offset: u64, len: usize) -> IoRequestId;

    /// `None` while the read is still in flight.
    fn try_finish_read(&self, id: IoRequestId) -> Option<Result<Vec<u8>, IoError>>;

    /// Block until the read completes.
    fn finish_read(&self, id: IoRequestId) -> Result<Vec<u8>, IoError> {
        loop {
            if let Some(result) = self.try_finish_read(id) {
                return result;
            }
            std::thread::yield_now();
        }
    }
}

pub(crate) fn unknown_io_request(id: IoRequestId) -> IoError {
    IoError::new(
        std::io::ErrorKind::InvalidInput,
        format!("unknown io request {}", id.get()),
    )
}
