//! Deterministic collaborators for tests.
use std::collections::{HashMap, HashSet};
use std::io::{Error as IoError, ErrorKind};
use std::sync::{Arc, Once};

use parking_lot::Mutex;

use crate::*;

pub(crate) const TOC_FILE: &str = "test.toc";
pub(crate) const CACHE_FILE: &str = "test.cache";

struct PendingRead {
    key: String,
    offset: u64,
    len: usize,
}

#[derive(Default)]
struct ManualState {
    next_id: u64,
    pending: HashMap<IoRequestId, PendingRead>,
    done: HashMap<IoRequestId, Result<Vec<u8>, IoError>>,
    failing_keys: HashSet<String>,
}

/// An [AsyncIo] whose reads only complete when the test says so.
pub(crate) struct ManualAsyncIo {
    vfs: Arc<MemoryVfs>,
    state: Mutex<ManualState>,
}

impl ManualAsyncIo {
    pub(crate) fn new(vfs: Arc<MemoryVfs>) -> Arc<ManualAsyncIo> {
        Arc::new(ManualAsyncIo {
            vfs,
            state: Default::default(),
        })
    }

    fn perform(&self, failing: &HashSet<String>, read: PendingRead) -> Result<Vec<u8>, IoError> {
        if failing.contains(&read.key) {
            return Err(IoError::new(ErrorKind::Other, "injected read failure"));
        }
        self.vfs.read_at(&read.key, read.offset, read.len)
    }

    /// Complete every read issued so far.
    pub(crate) fn complete_all(&self) {
        let mut state = self.state.lock();
        let pending: Vec<_> = state.pending.drain().collect();
        for (id, read) in pending {
            let result = self.perform(&state.failing_keys, read);
            state.done.insert(id, result);
        }
    }

    /// Make every read of `key` completed from now on fail.
    pub(crate) fn fail_reads_of(&self, key: &str) {
        self.state.lock().failing_keys.insert(key.to_string());
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl AsyncIo for ManualAsyncIo {
    fn begin_read(&self, key: &str, offset: u64, len: usize) -> IoRequestId {
        let mut state = self.state.lock();
        let id = IoRequestId::new(state.next_id);
        state.next_id += 1;
        state.pending.insert(
            id,
            PendingRead {
                key: key.to_string(),
                offset,
                len,
            },
        );
        id
    }

    fn try_finish_read(&self, id: IoRequestId) -> Option<Result<Vec<u8>, IoError>> {
        let mut state = self.state.lock();
        if let Some(result) = state.done.remove(&id) {
            return Some(result);
        }
        if state.pending.contains_key(&id) {
            return None;
        }
        Some(Err(unknown_io_request(id)))
    }

    fn finish_read(&self, id: IoRequestId) -> Result<Vec<u8>, IoError> {
        let mut state = self.state.lock();
        if let Some(read) = state.pending.remove(&id) {
            return self.perform(&state.failing_keys, read);
        }
        state
            .done
            .remove(&id)
            .unwrap_or_else(|| Err(unknown_io_request(id)))
    }
}

pub(crate) fn memory_backend() -> (Arc<MemoryVfs>, Arc<ManualAsyncIo>) {
    let vfs = Arc::new(MemoryVfs::new());
    let io = ManualAsyncIo::new(vfs.clone());
    (vfs, io)
}

pub(crate) fn make_cache(vfs: &Arc<MemoryVfs>, io: &Arc<ManualAsyncIo>) -> Cache {
    Cache::new(
        "test",
        Platform::Pc,
        TOC_FILE,
        CACHE_FILE,
        vfs.clone(),
        io.clone(),
    )
    .unwrap()
}

/// A [Vfs] over a [MemoryVfs] which can't stat one file.
pub(crate) struct UnstattableVfs {
    inner: Arc<MemoryVfs>,
    key: String,
}

impl UnstattableVfs {
    pub(crate) fn new(inner: Arc<MemoryVfs>, key: &str) -> Arc<UnstattableVfs> {
        Arc::new(UnstattableVfs {
            inner,
            key: key.to_string(),
        })
    }
}

impl Vfs for UnstattableVfs {
    fn file_size(&self, key: &str) -> Result<Option<u64>, IoError> {
        if key == self.key {
            return Err(IoError::new(ErrorKind::PermissionDenied, "injected stat failure"));
        }
        self.inner.file_size(key)
    }

    fn read_at(&self, key: &str, offset: u64, len: usize) -> Result<Vec<u8>, IoError> {
        self.inner.read_at(key, offset, len)
    }

    fn write_at(&self, key: &str, offset: u64, data: &[u8]) -> Result<(), IoError> {
        self.inner.write_at(key, offset, data)
    }

    fn replace(&self, key: &str, data: &[u8]) -> Result<(), IoError> {
        self.inner.replace(key, data)
    }
}

/// Keeps every log record so tests can look for messages.  Tests run in parallel, so look for something unique to
/// the test, such as a cache name.
struct RecordingLogger {
    records: Mutex<Vec<(log::Level, String)>>,
}

impl log::Log for RecordingLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        self.records
            .lock()
            .push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

static LOGGER: RecordingLogger = RecordingLogger {
    records: parking_lot::const_mutex(Vec::new()),
};
static LOGGER_INIT: Once = Once::new();

pub(crate) fn record_logs() {
    LOGGER_INIT.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(log::LevelFilter::Trace);
        }
    });
}

/// Number of records at `level` or more severe containing `needle`.
pub(crate) fn logged(level: log::Level, needle: &str) -> usize {
    LOGGER
        .records
        .lock()
        .iter()
        .filter(|(l, message)| *l <= level && message.contains(needle))
        .count()
}
