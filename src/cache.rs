//! The [Cache] maps `(path, sub-data index)` keys to byte ranges of a single append-only blob file, indexed by a
//! table of contents stored next to it.
//!
//! Loading the TOC is a non-blocking protocol: [Cache::begin_load_toc] issues an [AsyncIo] read, then
//! [Cache::try_finish_load_toc] is polled until it returns `true`.  A cache with no TOC on disk is simply empty.  The
//! only blocking entry point is [Cache::enforce_toc_load].
//!
//! Writes go through [Cache::cache_entry], which appends the data to the blob, updates the index, and rewrites the TOC.
//! Writers are serialized against each other; lookups never wait for them.
use std::io::Error as IoError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::*;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Platform {
    Pc,
    Ps3,
    Xbox360,
}

impl Platform {
    /// Directory name used for this platform's caches.
    pub fn name(&self) -> &'static str {
        match self {
            Platform::Pc => "pc",
            Platform::Ps3 => "ps3",
            Platform::Xbox360 => "xbox360",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub path: AssetPath,
    pub sub_data_index: u32,
}

/// Location of one cached blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: AssetPath,
    pub sub_data_index: u32,
    pub offset: u64,
    pub size: u32,
    pub timestamp: i64,
}

impl CacheEntry {
    pub fn key(&self) -> EntryKey {
        EntryKey {
            path: self.path.clone(),
            sub_data_index: self.sub_data_index,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache name must not be empty")]
    EmptyName,
    #[error("cache \"{0}\" needs both a TOC file name and a cache file name")]
    MissingFileName(String),
    #[error("cannot cache data for the null path")]
    NullPath,
    #[error("{size} bytes is larger than the largest possible cache entry")]
    EntryTooLarge { size: usize },
    #[error("the TOC of cache \"{0}\" could not be loaded, refusing to overwrite it")]
    TocUnavailable(String),
    #[error("cache I/O failed")]
    Io(#[from] IoError),
    #[error(transparent)]
    Toc(#[from] TocError),
}

#[derive(Debug)]
enum TocState {
    Idle,
    Loading(IoRequestId),
    Loaded,
}

pub struct Cache {
    name: String,
    platform: Platform,
    toc_file_name: String,
    cache_file_name: String,
    vfs: Arc<dyn Vfs>,
    io: Arc<dyn AsyncIo>,
    toc_state: Mutex<TocState>,
    toc_loaded: AtomicBool,
    entries: DashMap<EntryKey, CacheEntry, ahash::RandomState>,
    /// Keys in insertion order, for ordinal access.
    ordinals: RwLock<Vec<EntryKey>>,
    /// Serializes blob appends and TOC rewrites.
    writer: Mutex<()>,
}

impl Cache {
    /// Set up a cache.  No I/O happens until the TOC is loaded or an entry is written.
    pub fn new(
        name: &str,
        platform: Platform,
        toc_file_name: &str,
        cache_file_name: &str,
        vfs: Arc<dyn Vfs>,
        io: Arc<dyn AsyncIo>,
    ) -> Result<Cache, CacheError> {
        if name.is_empty() {
            return Err(CacheError::EmptyName);
        }
        if toc_file_name.is_empty() || cache_file_name.is_empty() {
            return Err(CacheError::MissingFileName(name.to_string()));
        }

        Ok(Cache {
            name: name.to_string(),
            platform,
            toc_file_name: toc_file_name.to_string(),
            cache_file_name: cache_file_name.to_string(),
            vfs,
            io,
            toc_state: Mutex::new(TocState::Idle),
            toc_loaded: AtomicBool::new(false),
            entries: DashMap::with_hasher(Default::default()),
            ordinals: Default::default(),
            writer: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn toc_file_name(&self) -> &str {
        &self.toc_file_name
    }

    pub fn cache_file_name(&self) -> &str {
        &self.cache_file_name
    }

    /// Start reading the TOC.
    ///
    /// Returns `false` only if the TOC could not even be inspected.  A missing or empty TOC finishes the load
    /// immediately.
    pub fn begin_load_toc(&self) -> bool {
        let mut state = self.toc_state.lock();
        match *state {
            TocState::Loading(_) => {
                log::warn!(
                    "Cache \"{}\" TOC load requested while one is already in progress",
                    self.name
                );
                return true;
            }
            TocState::Loaded => return true,
            TocState::Idle => {}
        }

        let size = match self.vfs.file_size(&self.toc_file_name) {
            Ok(Some(size)) if size > 0 => size,
            Ok(_) => {
                log::info!(
                    "No TOC found for cache \"{}\" at \"{}\", starting empty",
                    self.name,
                    self.toc_file_name
                );
                *state = TocState::Loaded;
                self.toc_loaded.store(true, Ordering::Release);
                return true;
            }
            Err(e) => {
                log::error!(
                    "Failed to inspect TOC \"{}\" of cache \"{}\": {}",
                    self.toc_file_name,
                    self.name,
                    e
                );
                return false;
            }
        };

        let size = match usize::try_from(size) {
            Ok(size) if size < u32::MAX as usize => size,
            _ => {
                log::error!(
                    "TOC \"{}\" is too large to load ({} bytes)",
                    self.toc_file_name,
                    size
                );
                return false;
            }
        };

        log::debug!("Loading TOC \"{}\" ({} bytes)", self.toc_file_name, size);
        *state = TocState::Loading(self.io.begin_read(&self.toc_file_name, 0, size));
        true
    }

    /// Poll an outstanding TOC load.
    ///
    /// Returns `true` once the TOC is usable, which includes a load that failed and left the cache empty, and when no
    /// load is in progress.
    pub fn try_finish_load_toc(&self) -> bool {
        let mut state = self.toc_state.lock();
        let id = match *state {
            TocState::Loaded => return true,
            TocState::Idle => {
                log::warn!(
                    "Cache \"{}\" has no TOC load in progress to finish",
                    self.name
                );
                return true;
            }
            TocState::Loading(id) => id,
        };

        match self.io.try_finish_read(id) {
            None => return false,
            Some(Ok(bytes)) => self.finalize_toc_load(&bytes),
            Some(Err(e)) => {
                log::error!(
                    "Failed to read TOC \"{}\" of cache \"{}\": {}",
                    self.toc_file_name,
                    self.name,
                    e
                );
            }
        }

        *state = TocState::Loaded;
        self.toc_loaded.store(true, Ordering::Release);
        true
    }

    fn finalize_toc_load(&self, bytes: &[u8]) {
        let _writer = self.writer.lock();

        match read_toc(bytes) {
            Ok(parsed) => {
                let mut ordinals = self.ordinals.write();
                let count = parsed.len();
                for entry in parsed {
                    let key = entry.key();
                    // Entries written while the TOC was loading are newer than what's on disk.
                    if self.entries.contains_key(&key) {
                        continue;
                    }
                    self.entries.insert(key.clone(), entry);
                    ordinals.push(key);
                }
                log::debug!(
                    "Loaded {} entries from TOC \"{}\"",
                    count,
                    self.toc_file_name
                );
            }
            Err(e) => {
                log::error!(
                    "TOC \"{}\" of cache \"{}\" is corrupt, discarding all entries: {}",
                    self.toc_file_name,
                    self.name,
                    e
                );
                self.entries.clear();
                self.ordinals.write().clear();
            }
        }
    }

    pub fn is_toc_loaded(&self) -> bool {
        self.toc_loaded.load(Ordering::Acquire)
    }

    /// Load the TOC, blocking until it's done.  Returns `false` if the TOC could not be inspected.
    pub fn enforce_toc_load(&self) -> bool {
        if self.is_toc_loaded() {
            return true;
        }

        log::info!("Block-loading TOC of cache \"{}\"", self.name);
        let in_flight = matches!(*self.toc_state.lock(), TocState::Loading(_));
        if !in_flight && !self.begin_load_toc() {
            return false;
        }
        while !self.try_finish_load_toc() {
            std::thread::yield_now();
        }
        self.is_toc_loaded()
    }

    pub fn find_entry(&self, path: &AssetPath, sub_data_index: u32) -> Option<CacheEntry> {
        let key = EntryKey {
            path: path.clone(),
            sub_data_index,
        };
        self.entries.get(&key).map(|e| e.value().clone())
    }

    pub fn entry_count(&self) -> usize {
        self.ordinals.read().len()
    }

    /// Entry by insertion order.
    pub fn entry(&self, index: usize) -> Option<CacheEntry> {
        let key = self.ordinals.read().get(index)?.clone();
        self.entries.get(&key).map(|e| e.value().clone())
    }

    /// Snapshot of every entry, in insertion order.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let ordinals = self.ordinals.read();
        ordinals
            .iter()
            .filter_map(|k| self.entries.get(k).map(|e| e.value().clone()))
            .collect()
    }

    /// Append `data` to the blob file and record it under `(path, sub_data_index)`, replacing any previous entry.
    ///
    /// The TOC is loaded first if it isn't already, so that rewriting it doesn't lose what's on disk.  If it can't be,
    /// nothing is written.
    pub fn cache_entry(
        &self,
        path: &AssetPath,
        sub_data_index: u32,
        data: &[u8],
        timestamp: i64,
    ) -> Result<(), CacheError> {
        if path.is_empty() {
            return Err(CacheError::NullPath);
        }
        let size =
            u32::try_from(data.len()).map_err(|_| CacheError::EntryTooLarge { size: data.len() })?;

        if !self.enforce_toc_load() {
            return Err(CacheError::TocUnavailable(self.name.clone()));
        }

        let _writer = self.writer.lock();
        let offset = self.vfs.file_size(&self.cache_file_name)?.unwrap_or(0);

        log::info!(
            "Caching \"{}\" (sub-data {}) to \"{}\" ({} bytes @ offset {})",
            path,
            sub_data_index,
            self.cache_file_name,
            size,
            offset
        );
        self.vfs
            .write_at(&self.cache_file_name, offset, data)
            .map_err(|e| {
                log::error!(
                    "Failed to write \"{}\" to \"{}\": {}",
                    path,
                    self.cache_file_name,
                    e
                );
                e
            })?;

        let entry = CacheEntry {
            path: path.clone(),
            sub_data_index,
            offset,
            size,
            timestamp,
        };
        let key = entry.key();
        if self.entries.insert(key.clone(), entry).is_none() {
            self.ordinals.write().push(key);
        }

        if let Err(e) = self.write_toc() {
            log::error!(
                "Failed to rewrite TOC \"{}\" of cache \"{}\": {}",
                self.toc_file_name,
                self.name,
                e
            );
        }

        Ok(())
    }

    /// Must be called with the writer lock held.
    fn write_toc(&self) -> Result<(), CacheError> {
        let bytes = write_toc(&self.entries())?;
        self.vfs.replace(&self.toc_file_name, &bytes)?;
        Ok(())
    }

    /// Start reading the bytes of `entry` from the blob file.
    pub fn begin_read_entry(&self, entry: &CacheEntry) -> IoRequestId {
        self.io
            .begin_read(&self.cache_file_name, entry.offset, entry.size as usize)
    }

    pub fn try_finish_read(&self, id: IoRequestId) -> Option<Result<Vec<u8>, IoError>> {
        self.io.try_finish_read(id)
    }

    pub fn finish_read(&self, id: IoRequestId) -> Result<Vec<u8>, IoError> {
        self.io.finish_read(id)
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if let TocState::Loading(id) = *self.toc_state.get_mut() {
            if let Err(e) = self.io.finish_read(id) {
                log::debug!("Outstanding TOC read failed during shutdown: {}", e);
            }
        }
    }
}
