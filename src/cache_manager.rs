//! The [CacheManager] hands out one [Cache] per name and platform, creating them on first use.
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::*;

#[derive(Debug, Clone, derive_builder::Builder)]
pub struct CacheManagerConfig {
    /// Directory, relative to the VFS root, holding one subdirectory per platform.
    #[builder(default = "\"cache\".to_string()", setter(into))]
    pub cache_directory: String,
    #[builder(default = "\"toc\".to_string()", setter(into))]
    pub toc_extension: String,
    #[builder(default = "\"cache\".to_string()", setter(into))]
    pub cache_extension: String,
}

impl Default for CacheManagerConfig {
    fn default() -> Self {
        CacheManagerConfig {
            cache_directory: "cache".to_string(),
            toc_extension: "toc".to_string(),
            cache_extension: "cache".to_string(),
        }
    }
}

pub struct CacheManager {
    config: CacheManagerConfig,
    vfs: Arc<dyn Vfs>,
    io: Arc<dyn AsyncIo>,
    caches: DashMap<(String, Platform), Arc<Cache>, ahash::RandomState>,
}

impl CacheManager {
    pub fn new(vfs: Arc<dyn Vfs>, io: Arc<dyn AsyncIo>, config: CacheManagerConfig) -> CacheManager {
        CacheManager {
            config,
            vfs,
            io,
            caches: DashMap::with_hasher(Default::default()),
        }
    }

    pub fn config(&self) -> &CacheManagerConfig {
        &self.config
    }

    /// Get the cache for `name` on `platform`, creating it if this is the first request.
    pub fn get_cache(&self, name: &str, platform: Platform) -> Result<Arc<Cache>, CacheError> {
        if let Some(cache) = self.caches.get(&(name.to_string(), platform)) {
            return Ok(cache.value().clone());
        }

        match self.caches.entry((name.to_string(), platform)) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(e) => {
                let cache = Arc::new(Cache::new(
                    name,
                    platform,
                    &self.file_name(name, platform, &self.config.toc_extension),
                    &self.file_name(name, platform, &self.config.cache_extension),
                    self.vfs.clone(),
                    self.io.clone(),
                )?);
                log::debug!(
                    "Created cache \"{}\" for {} at \"{}\"",
                    name,
                    platform,
                    cache.cache_file_name()
                );
                e.insert(cache.clone());
                Ok(cache)
            }
        }
    }

    pub fn cache_count(&self) -> usize {
        self.caches.len()
    }

    fn file_name(&self, name: &str, platform: Platform, extension: &str) -> String {
        if self.config.cache_directory.is_empty() {
            format!("{}/{}.{}", platform, name, extension)
        } else {
            format!(
                "{}/{}/{}.{}",
                self.config.cache_directory, platform, name, extension
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_support::*;

    #[test]
    fn one_cache_per_name_and_platform() {
        let (vfs, io) = memory_backend();
        let manager = CacheManager::new(vfs, io, Default::default());

        let a = manager.get_cache("objects", Platform::Pc).unwrap();
        let b = manager.get_cache("objects", Platform::Pc).unwrap();
        let c = manager.get_cache("objects", Platform::Xbox360).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(manager.cache_count(), 2);

        assert_eq!(a.toc_file_name(), "cache/pc/objects.toc");
        assert_eq!(a.cache_file_name(), "cache/pc/objects.cache");
        assert_eq!(c.cache_file_name(), "cache/xbox360/objects.cache");

        assert!(matches!(
            manager.get_cache("", Platform::Pc),
            Err(CacheError::EmptyName)
        ));
    }

    #[test]
    fn custom_layout() {
        let (vfs, io) = memory_backend();
        let config = CacheManagerConfigBuilder::default()
            .cache_directory("")
            .toc_extension("htoc")
            .build()
            .unwrap();
        let manager = CacheManager::new(vfs, io, config);
        let cache = manager.get_cache("meshes", Platform::Ps3).unwrap();
        assert_eq!(cache.toc_file_name(), "ps3/meshes.htoc");
        assert_eq!(cache.cache_file_name(), "ps3/meshes.cache");
    }

    #[test]
    fn concurrent_creation() {
        let (vfs, io) = memory_backend();
        let manager = Arc::new(CacheManager::new(vfs, io, Default::default()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || manager.get_cache("shared", Platform::Pc).unwrap())
            })
            .collect();
        let caches: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for cache in &caches[1..] {
            assert!(Arc::ptr_eq(&caches[0], cache));
        }
    }
}
