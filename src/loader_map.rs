//! [LoosePackageLoaderMap] owns one [PackageLoader] per package, created on first use.
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::*;

/// Builds the loader for a package.  `source` is what the new loader should use to reach other packages.
pub trait PackageLoaderFactory: Send + Sync {
    fn create_package_loader(
        &self,
        package: &AssetPath,
        source: Weak<dyn PackageLoaderSource>,
    ) -> Option<Arc<dyn PackageLoader>>;
}

/// Creates [CachePackageLoader]s reading from one cache of a [CacheManager].
pub struct CachePackageLoaderFactory {
    manager: Arc<CacheManager>,
    cache_name: String,
    platform: Platform,
    config: LoaderConfig,
}

impl CachePackageLoaderFactory {
    pub fn new(
        manager: Arc<CacheManager>,
        cache_name: &str,
        platform: Platform,
        config: LoaderConfig,
    ) -> CachePackageLoaderFactory {
        CachePackageLoaderFactory {
            manager,
            cache_name: cache_name.to_string(),
            platform,
            config,
        }
    }
}

impl PackageLoaderFactory for CachePackageLoaderFactory {
    fn create_package_loader(
        &self,
        package: &AssetPath,
        source: Weak<dyn PackageLoaderSource>,
    ) -> Option<Arc<dyn PackageLoader>> {
        match CachePackageLoader::initialize(
            package.clone(),
            &self.manager,
            &self.cache_name,
            self.platform,
            self.config.clone(),
            Some(source),
        ) {
            Ok(loader) => Some(loader as Arc<dyn PackageLoader>),
            Err(e) => {
                log::error!(
                    "Could not create a loader for package \"{}\" from cache \"{}\": {}",
                    package,
                    self.cache_name,
                    e
                );
                None
            }
        }
    }
}

pub struct LoosePackageLoaderMap {
    loaders: DashMap<AssetPath, Arc<dyn PackageLoader>, ahash::RandomState>,
    factory: Box<dyn PackageLoaderFactory>,
    self_ref: Weak<LoosePackageLoaderMap>,
}

impl LoosePackageLoaderMap {
    pub fn new(factory: Box<dyn PackageLoaderFactory>) -> Arc<LoosePackageLoaderMap> {
        Arc::new_cyclic(|self_ref| LoosePackageLoaderMap {
            loaders: DashMap::with_hasher(Default::default()),
            factory,
            self_ref: self_ref.clone(),
        })
    }

    /// Get the loader of the package owning `path`, creating and preloading it on first use.
    ///
    /// Creation happens under the map's entry lock for that package, so racing callers all see the same loader.
    pub fn get_package_loader(&self, path: &AssetPath) -> Option<Arc<dyn PackageLoader>> {
        let package = path.package();
        if package.is_empty() {
            log::debug!("\"{}\" is not inside a package", path);
            return None;
        }

        if let Some(loader) = self.loaders.get(&package) {
            return Some(loader.value().clone());
        }

        match self.loaders.entry(package) {
            Entry::Occupied(e) => Some(e.get().clone()),
            Entry::Vacant(e) => {
                let source: Weak<dyn PackageLoaderSource> = self.self_ref.clone();
                let loader = self.factory.create_package_loader(e.key(), source)?;
                if !loader.begin_preload() {
                    log::warn!("Preload of package \"{}\" could not be started", e.key());
                }
                log::debug!("Registered loader for package \"{}\"", e.key());
                e.insert(loader.clone());
                Some(loader)
            }
        }
    }

    /// Tick every registered loader once.
    ///
    /// Loaders registered while this runs are picked up by the next call.
    pub fn tick_package_loaders(&self) {
        let loaders: Vec<Arc<dyn PackageLoader>> =
            self.loaders.iter().map(|l| l.value().clone()).collect();
        for loader in loaders {
            loader.tick();
        }
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}

impl PackageLoaderSource for LoosePackageLoaderMap {
    fn package_loader(&self, path: &AssetPath) -> Option<Arc<dyn PackageLoader>> {
        self.get_package_loader(path)
    }
}
