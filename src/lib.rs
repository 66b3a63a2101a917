//! Asset identity, table-of-contents caches, and tick-driven package loading for a game engine.
//!
//! Everything an engine loads is named by an [AssetPath]: an interned chain of package (`/`) and object (`:`)
//! segments, optionally ending in an instance index (`*3`).  Interned paths compare and hash in constant time, so
//! they make good map keys.
//!
//! Cooked object data lives in caches.  A [Cache] is a pair of files: an append-only blob file holding the serialized
//! objects, and a TOC mapping `(path, sub-data index)` to a byte range of the blob.  [CacheManager] hands out one
//! cache per name and platform.  All file access goes through the [Vfs] trait, and reads the loader waits on go
//! through [AsyncIo], which starts a read and lets the caller poll for it later.  [FilesystemVfs], [MemoryVfs], and
//! [ThreadedAsyncIo] are the provided implementations.
//!
//! Objects are loaded by a [PackageLoader], one per package.  Loads never block: callers start them, call
//! [PackageLoader::tick] (usually via [LoosePackageLoaderMap::tick_package_loaders]) until they finish, and get back
//! a [LoadedObject] plus the [LinkTable] of objects it depends on.  The provided loader is [CachePackageLoader],
//! which reads records in the format written by [ObjectRecordWriter].
//!
//! To use this crate, build a [CacheManager] over your [Vfs] and [AsyncIo], wrap it in a
//! [CachePackageLoaderFactory], and hand that to a [LoosePackageLoaderMap].
mod asset_path;
mod async_io;
mod byte_io;
mod cache;
mod cache_manager;
mod cache_package_loader;
mod filesystem_vfs;
mod loader_map;
mod memory_vfs;
mod package_loader;
mod record;
mod request_pool;
mod toc;
mod traits;

#[cfg(test)]
mod test_support;

pub use asset_path::*;
pub use async_io::*;
pub use byte_io::*;
pub use cache::*;
pub use cache_manager::*;
pub use cache_package_loader::*;
pub use filesystem_vfs::*;
pub use loader_map::*;
pub use memory_vfs::*;
pub use package_loader::*;
pub use record::*;
pub use request_pool::*;
pub use toc::*;
pub use traits::*;
