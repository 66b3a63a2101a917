//! [ThreadedAsyncIo] implements [AsyncIo] over any [Vfs] with a small pool of worker threads.
//!
//! Requests go to the workers over one shared channel; results come back over another and are drained into a table
//! keyed by [IoRequestId] whenever someone polls.
use std::io::{Error as IoError, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::*;

type ReadTable =
    std::collections::HashMap<IoRequestId, Option<Result<Vec<u8>, IoError>>, ahash::RandomState>;

#[derive(Debug, Clone, derive_builder::Builder)]
pub struct AsyncIoConfig {
    /// Number of threads performing reads.  At least one thread is always started.
    #[builder(default = "2")]
    pub worker_threads: usize,
}

impl Default for AsyncIoConfig {
    fn default() -> Self {
        AsyncIoConfig { worker_threads: 2 }
    }
}

struct ReadRequest {
    id: IoRequestId,
    key: String,
    offset: u64,
    len: usize,
}

struct ReadResult {
    id: IoRequestId,
    result: Result<Vec<u8>, IoError>,
}

// Takes requests off the shared channel until the finish channel is signalled.
struct IoWorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl IoWorkerThread {
    fn new<V: Vfs>(
        vfs: Arc<V>,
        request_rx: Receiver<ReadRequest>,
        result_tx: Sender<ReadResult>,
        thread_index: usize,
    ) -> Result<IoWorkerThread, IoError> {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
        let join_handle = std::thread::Builder::new()
            .name(format!("asset io {}", thread_index))
            .spawn(move || loop {
                crossbeam_channel::select! {
                    recv(request_rx) -> msg => {
                        let request = match msg {
                            Ok(request) => request,
                            Err(_) => return,
                        };
                        log::trace!(
                            "Start read of {} bytes at {} from {} ({:?})",
                            request.len,
                            request.offset,
                            request.key,
                            request.id
                        );
                        let result = vfs.read_at(&request.key, request.offset, request.len);
                        if result_tx.send(ReadResult { id: request.id, result }).is_err() {
                            return;
                        }
                    },
                    recv(finish_rx) -> _msg => {
                        return;
                    }
                }
            })?;

        Ok(IoWorkerThread {
            finish_tx,
            join_handle,
        })
    }
}

pub struct ThreadedAsyncIo {
    request_tx: Sender<ReadRequest>,
    result_rx: Receiver<ReadResult>,
    /// `None` while in flight.
    reads: Mutex<ReadTable>,
    next_id: AtomicU64,
    worker_threads: Vec<IoWorkerThread>,
}

impl ThreadedAsyncIo {
    pub fn new<V: Vfs>(vfs: Arc<V>, config: AsyncIoConfig) -> Result<ThreadedAsyncIo, IoError> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded();
        let (result_tx, result_rx) = crossbeam_channel::unbounded();

        let thread_count = config.worker_threads.max(1);
        let mut worker_threads = Vec::with_capacity(thread_count);
        for thread_index in 0..thread_count {
            worker_threads.push(IoWorkerThread::new(
                vfs.clone(),
                request_rx.clone(),
                result_tx.clone(),
                thread_index,
            )?);
        }

        Ok(ThreadedAsyncIo {
            request_tx,
            result_rx,
            reads: Default::default(),
            next_id: AtomicU64::new(0),
            worker_threads,
        })
    }

    fn store_result(reads: &mut ReadTable, result: ReadResult) {
        match reads.get_mut(&result.id) {
            Some(slot) => *slot = Some(result.result),
            None => log::warn!("Dropping result for unknown io request {:?}", result.id),
        }
    }

    fn take(&self, reads: &mut ReadTable, id: IoRequestId) -> Option<Result<Vec<u8>, IoError>> {
        for result in self.result_rx.try_iter() {
            Self::store_result(reads, result);
        }

        match reads.get(&id) {
            None => Some(Err(unknown_io_request(id))),
            Some(None) => None,
            Some(Some(_)) => reads.remove(&id).flatten(),
        }
    }
}

impl AsyncIo for ThreadedAsyncIo {
    fn begin_read(&self, key: &str, offset: u64, len: usize) -> IoRequestId {
        let id = IoRequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.reads.lock().insert(id, None);

        let request = ReadRequest {
            id,
            key: key.to_string(),
            offset,
            len,
        };
        if self.request_tx.send(request).is_err() {
            self.reads.lock().insert(
                id,
                Some(Err(IoError::new(
                    ErrorKind::BrokenPipe,
                    "io worker threads have stopped",
                ))),
            );
        }
        id
    }

    fn try_finish_read(&self, id: IoRequestId) -> Option<Result<Vec<u8>, IoError>> {
        let mut reads = self.reads.lock();
        self.take(&mut reads, id)
    }

    fn finish_read(&self, id: IoRequestId) -> Result<Vec<u8>, IoError> {
        loop {
            if let Some(result) = self.try_finish_read(id) {
                return result;
            }

            // Results for other requests may arrive first; those are stored and we go around again.
            match self.result_rx.recv_timeout(Duration::from_millis(1)) {
                Ok(result) => Self::store_result(&mut self.reads.lock(), result),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(IoError::new(
                        ErrorKind::BrokenPipe,
                        "io worker threads have stopped",
                    ))
                }
            }
        }
    }
}

impl Drop for ThreadedAsyncIo {
    fn drop(&mut self) {
        for worker_thread in &self.worker_threads {
            let _ = worker_thread.finish_tx.send(());
        }

        for worker_thread in self.worker_threads.drain(..) {
            if worker_thread.join_handle.join().is_err() {
                log::error!("An io worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_io() -> (Arc<MemoryVfs>, ThreadedAsyncIo) {
        let vfs = Arc::new(MemoryVfs::new());
        vfs.insert("blob", b"0123456789".to_vec());
        let config = AsyncIoConfigBuilder::default()
            .worker_threads(3)
            .build()
            .unwrap();
        let io = ThreadedAsyncIo::new(vfs.clone(), config).unwrap();
        (vfs, io)
    }

    #[test]
    fn reads_complete() {
        let (_vfs, io) = make_io();

        let ids: Vec<_> = (0..8).map(|i| io.begin_read("blob", i, 2)).collect();
        for (i, id) in ids.into_iter().enumerate().rev() {
            let expected = format!("{}{}", i, i + 1);
            assert_eq!(io.finish_read(id).unwrap(), expected.as_bytes());
        }
    }

    #[test]
    fn polling_eventually_completes() {
        let (_vfs, io) = make_io();
        let id = io.begin_read("blob", 4, 3);
        let result = loop {
            if let Some(r) = io.try_finish_read(id) {
                break r;
            }
            std::thread::yield_now();
        };
        assert_eq!(result.unwrap(), b"456");

        // Consumed ids are no longer known.
        assert!(io.try_finish_read(id).unwrap().is_err());
    }

    #[test]
    fn errors_are_delivered() {
        let (_vfs, io) = make_io();
        let missing = io.begin_read("missing", 0, 1);
        let short = io.begin_read("blob", 8, 4);
        assert_eq!(io.finish_read(missing).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(io.finish_read(short).unwrap_err().kind(), ErrorKind::UnexpectedEof);
    }
}
