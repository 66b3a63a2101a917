//! The [PackageLoader] contract: asynchronous, tick-driven loading of the objects of one package.
//!
//! A load goes through [LoadState]s as the loader is ticked.  Callers start a load with
//! [PackageLoader::begin_load_object], poll [PackageLoader::try_finish_load_object], and get back the loaded object
//! plus its [LinkTable].  Every id handed to a caller, including the ones inside a link table, carries one reference
//! which the caller gives back by finishing or abandoning it.
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::*;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeserializePhase {
    /// Links are parsed and the request waits for required links to become usable.
    LinkTable,
    Properties,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LoadState {
    /// Waiting for the package to preload, or for the read of the object's data to complete.
    Issued,
    /// The data has arrived and is being validated.
    AsyncReading,
    Deserializing(DeserializePhase),
    Preloaded,
    Error,
}

impl LoadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoadState::Preloaded | LoadState::Error)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LinkKind {
    Type,
    Template,
    Owner,
    Reference,
}

/// A request living in some loader, possibly not the one that produced the link.
#[derive(Clone)]
pub struct LinkRequest {
    pub loader: Arc<dyn PackageLoader>,
    pub id: RequestId,
}

impl fmt::Debug for LinkRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkRequest")
            .field("package", self.loader.package_path())
            .field("id", &self.id)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct LinkEntry {
    pub kind: LinkKind,
    pub path: AssetPath,
    /// `None` for an optional link which did not resolve.
    pub request: Option<LinkRequest>,
}

/// What a request is waiting on, as seen from another loader.
///
/// Lets a loader release wait cycles that span packages: a set of requests which only wait on each other can't fail,
/// so every request in it may move on.
#[derive(Clone, Debug)]
pub enum LinkWait {
    /// Not waiting on links; the request is in this state.
    State(LoadState),
    /// Waiting on its links, and every required link not yet usable is a request which is itself waiting on its links.
    WaitsOn(Vec<LinkRequest>),
    /// Waiting on a link which hasn't got its own links yet, or which failed.
    Blocked,
}

#[derive(Clone, Debug, Default)]
pub struct LinkTable {
    pub links: Vec<LinkEntry>,
}

impl LinkTable {
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LinkEntry> {
        self.links.iter()
    }

    pub fn of_kind(&self, kind: LinkKind) -> impl Iterator<Item = &LinkEntry> {
        self.links.iter().filter(move |l| l.kind == kind)
    }

    /// Give back every reference this table holds.
    pub fn abandon_all(self) {
        for link in self.links {
            if let Some(request) = link.request {
                request.loader.abandon_load_object(request.id);
            }
        }
    }
}

/// A preloaded object: its source data and where the regions of interest are within it.
#[derive(Clone, Debug)]
pub struct LoadedObject {
    path: AssetPath,
    is_package: bool,
    timestamp: i64,
    buffer: Arc<[u8]>,
    properties: Range<usize>,
    persistent_resource: Range<usize>,
}

impl LoadedObject {
    /// Packages carry no data.
    pub(crate) fn package(path: AssetPath) -> LoadedObject {
        LoadedObject {
            path,
            is_package: true,
            timestamp: 0,
            buffer: Arc::from(Vec::new()),
            properties: 0..0,
            persistent_resource: 0..0,
        }
    }

    pub(crate) fn from_record(
        path: AssetPath,
        timestamp: i64,
        buffer: Arc<[u8]>,
        regions: &RecordRegions,
    ) -> LoadedObject {
        LoadedObject {
            path,
            is_package: false,
            timestamp,
            buffer,
            properties: regions.properties.clone(),
            persistent_resource: regions.persistent_resource.clone(),
        }
    }

    pub fn path(&self) -> &AssetPath {
        &self.path
    }

    pub fn is_package(&self) -> bool {
        self.is_package
    }

    /// Timestamp of the source the cached data was built from.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn buffer(&self) -> &Arc<[u8]> {
        &self.buffer
    }

    pub fn property_range(&self) -> Range<usize> {
        self.properties.clone()
    }

    pub fn persistent_resource_range(&self) -> Range<usize> {
        self.persistent_resource.clone()
    }

    pub fn property_data(&self) -> &[u8] {
        &self.buffer[self.properties.clone()]
    }

    pub fn persistent_resource_data(&self) -> &[u8] {
        &self.buffer[self.persistent_resource.clone()]
    }
}

#[derive(Clone, Debug)]
pub struct FinishedLoad {
    pub object: Arc<LoadedObject>,
    pub links: LinkTable,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum LoadError {
    #[error("\"{0}\" is not in the cache")]
    NotFound(AssetPath),
    #[error("failed to read the cached data of \"{path}\"")]
    Io {
        path: AssetPath,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("the cached data of \"{path}\" is malformed")]
    Record {
        path: AssetPath,
        #[source]
        source: RecordError,
    },
    #[error("{kind:?} link \"{link}\" of \"{path}\" could not be loaded")]
    UnresolvedLink {
        path: AssetPath,
        kind: LinkKind,
        link: AssetPath,
    },
    #[error("load request {0:?} is not known to this loader")]
    UnknownRequest(RequestId),
}

pub trait PackageLoader: Send + Sync {
    /// The package this loader is responsible for.
    fn package_path(&self) -> &AssetPath;

    /// Start preparing the package.  Returns `false` if that could not be started.
    fn begin_preload(&self) -> bool;

    /// `true` once the package is ready for object loads to proceed.
    fn try_finish_preload(&self) -> bool;

    /// Start loading an object.  Never blocks.  Loads of the same path share one request.
    fn begin_load_object(&self, path: &AssetPath) -> RequestId;

    /// `None` until the request reaches a terminal state.  Consumes one reference on `Some`.
    fn try_finish_load_object(&self, id: RequestId) -> Option<Result<FinishedLoad, LoadError>>;

    /// Give up one reference without waiting for the result.
    fn abandon_load_object(&self, id: RequestId);

    /// Current state, or `None` if the id is not live.
    fn request_state(&self, id: RequestId) -> Option<LoadState>;

    /// What the request is waiting on, or `None` if the id is not live.  Never blocks on other loaders.
    fn link_wait(&self, id: RequestId) -> Option<LinkWait>;

    /// Make progress on every outstanding request.  Never blocks.
    fn tick(&self);

    fn object_count(&self) -> usize;

    fn object_path(&self, index: usize) -> Option<AssetPath>;
}

/// Anything that can hand out the loader for the package owning a path.
pub trait PackageLoaderSource: Send + Sync {
    fn package_loader(&self, path: &AssetPath) -> Option<Arc<dyn PackageLoader>>;
}
