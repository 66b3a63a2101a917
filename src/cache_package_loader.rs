//! [CachePackageLoader] loads the objects of one package out of a [Cache].
//!
//! Each object load is a pooled request moved along by [PackageLoader::tick], at most one state per tick:
//!
//! - `Issued`: waits for the package to preload, looks up the cache entry, then waits for the read of its bytes.
//! - `AsyncReading`: validates the record regions, parses the link table, and starts a load for every link.
//! - `Deserializing(LinkTable)`: waits until every required link is usable.
//! - `Deserializing(Properties)`: fixes the property and persistent-resource ranges, then `Preloaded`.
//!
//! Links into this package are requests of this loader.  Links into other packages go through the
//! [PackageLoaderSource], and every call into another loader happens with our own lock released: a tick collects the
//! cross-package work under the lock, runs it unlocked, then applies the results under the lock again.
//!
//! Requests waiting on each other in a cycle are released together once nothing in the cycle waits on anything else.
//! A required link which fails fails every request waiting on it.
//!
//! Requests are kept alive by caller references.  Links between requests of this loader don't count as references;
//! instead, anything no longer reachable from a referenced request is reclaimed, which also takes care of link cycles.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::*;

type IdMap<K, V> = HashMap<K, V, ahash::RandomState>;
type IdSet<K> = HashSet<K, ahash::RandomState>;
/// Statuses of required links into other packages, by request and link index.
type ExternalStatuses = IdMap<(RequestId, usize), LinkStatus>;

/// Give up on proving a cross-package wait cycle after visiting this many requests.
const MAX_WAIT_WALK: usize = 4096;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    struct LoadFlags: u8 {
        const PRELOADED = 1 << 0;
        const ERROR = 1 << 1;
    }
}

#[derive(Debug, Clone, derive_builder::Builder)]
pub struct LoaderConfig {
    /// Number of request slots to reserve up front.
    #[builder(default = "64")]
    pub request_pool_capacity: usize,
    /// If false, a generic reference which can't be loaded is dropped from the link table instead of failing the
    /// object holding it.  Type, template, and owner links are always required.
    #[builder(default = "true")]
    pub references_required: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            request_pool_capacity: 64,
            references_required: true,
        }
    }
}

/// A request we hold in another loader.
#[derive(Clone)]
struct ExternalLink {
    loader: Weak<dyn PackageLoader>,
    id: RequestId,
}

impl ExternalLink {
    fn release(&self) {
        if let Some(loader) = self.loader.upgrade() {
            loader.abandon_load_object(self.id);
        }
    }
}

enum LinkTarget {
    Local(RequestId),
    External(ExternalLink),
    /// Waiting to be handed to the owning package's loader.
    Deferred,
    Unresolved,
}

struct LinkSlot {
    kind: LinkKind,
    path: AssetPath,
    required: bool,
    target: LinkTarget,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LinkStatus {
    Ready,
    Pending,
    /// Waiting on a request of this loader which is itself waiting on its links.
    WaitsOn(RequestId),
    Failed,
}

struct LoadRequest {
    path: AssetPath,
    state: LoadState,
    flags: LoadFlags,
    /// Tick in which the state last changed.
    changed_at: u64,
    /// References held by callers.
    consumers: u32,
    entry: Option<CacheEntry>,
    read: Option<IoRequestId>,
    /// Nothing references this request any more; drop it once the read completes.
    reclaim: bool,
    buffer: Option<Arc<[u8]>>,
    regions: Option<RecordRegions>,
    links: Vec<LinkSlot>,
    object: Option<Arc<LoadedObject>>,
    error: Option<LoadError>,
}

impl LoadRequest {
    fn new(path: AssetPath, tick: u64) -> LoadRequest {
        LoadRequest {
            path,
            state: LoadState::Issued,
            flags: LoadFlags::empty(),
            changed_at: tick,
            consumers: 0,
            entry: None,
            read: None,
            reclaim: false,
            buffer: None,
            regions: None,
            links: Vec::new(),
            object: None,
            error: None,
        }
    }

    fn transition(&mut self, state: LoadState, tick: u64) {
        log::trace!("\"{}\": {:?} -> {:?}", self.path, self.state, state);
        self.state = state;
        self.changed_at = tick;
        match state {
            LoadState::Preloaded => self.flags.insert(LoadFlags::PRELOADED),
            LoadState::Error => self.flags.insert(LoadFlags::ERROR),
            _ => {}
        }
    }

    fn fail(&mut self, error: LoadError, tick: u64) {
        self.buffer = None;
        self.error = Some(error);
        self.transition(LoadState::Error, tick);
    }

    fn is_terminal(&self) -> bool {
        self.flags
            .intersects(LoadFlags::PRELOADED | LoadFlags::ERROR)
    }
}

enum Export {
    Local(RequestId),
    External(ExternalLink),
    Dropped,
}

struct LoaderState {
    requests: RequestPool<LoadRequest>,
    by_path: IdMap<AssetPath, RequestId>,
    preload_started: bool,
    preloaded: bool,
    objects: Vec<AssetPath>,
    tick: u64,
}

pub struct CachePackageLoader {
    package: AssetPath,
    cache: Arc<Cache>,
    config: LoaderConfig,
    source: Option<Weak<dyn PackageLoaderSource>>,
    self_ref: Weak<CachePackageLoader>,
    state: Mutex<LoaderState>,
}

impl CachePackageLoader {
    /// Create a loader for `package` over `cache`.  Links into other packages are resolved through `source`, if any.
    pub fn new(
        package: AssetPath,
        cache: Arc<Cache>,
        config: LoaderConfig,
        source: Option<Weak<dyn PackageLoaderSource>>,
    ) -> Arc<CachePackageLoader> {
        let state = LoaderState {
            requests: RequestPool::with_capacity(config.request_pool_capacity),
            by_path: Default::default(),
            preload_started: false,
            preloaded: false,
            objects: Vec::new(),
            tick: 0,
        };

        Arc::new_cyclic(|self_ref| CachePackageLoader {
            package,
            cache,
            config,
            source,
            self_ref: self_ref.clone(),
            state: Mutex::new(state),
        })
    }

    /// Create a loader for `package` over the named cache of `manager`.
    pub fn initialize(
        package: AssetPath,
        manager: &CacheManager,
        cache_name: &str,
        platform: Platform,
        config: LoaderConfig,
        source: Option<Weak<dyn PackageLoaderSource>>,
    ) -> Result<Arc<CachePackageLoader>, CacheError> {
        let cache = manager.get_cache(cache_name, platform)?;
        Ok(CachePackageLoader::new(package, cache, config, source))
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Number of requests currently held, including ones only kept alive by links.
    pub fn live_request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    fn poll_preload(&self, state: &mut LoaderState) -> bool {
        if state.preloaded {
            return true;
        }
        if !state.preload_started || !self.cache.try_finish_load_toc() || !self.cache.is_toc_loaded() {
            return false;
        }

        state.objects = self
            .cache
            .entries()
            .into_iter()
            .filter(|e| e.sub_data_index == 0 && e.path.package() == self.package)
            .map(|e| e.path)
            .collect();
        state.preloaded = true;
        log::debug!(
            "Preloaded package \"{}\" ({} objects)",
            self.package,
            state.objects.len()
        );
        true
    }

    fn issue_read(&self, request: &mut LoadRequest, tick: u64) {
        match self.cache.find_entry(&request.path, 0) {
            Some(entry) => {
                log::trace!(
                    "Reading {} bytes at {} for \"{}\"",
                    entry.size,
                    entry.offset,
                    request.path
                );
                request.read = Some(self.cache.begin_read_entry(&entry));
                request.entry = Some(entry);
            }
            None => {
                log::debug!(
                    "\"{}\" is not in cache \"{}\"",
                    request.path,
                    self.cache.name()
                );
                request.fail(LoadError::NotFound(request.path.clone()), tick);
            }
        }
    }

    /// Find the live request for `path` or start a new one, without taking a reference.
    fn find_or_create(&self, state: &mut LoaderState, path: &AssetPath, tick: u64) -> RequestId {
        if let Some(&id) = state.by_path.get(path) {
            if state.requests.contains(id) {
                return id;
            }
        }

        let mut request = LoadRequest::new(path.clone(), tick);
        if path.is_empty() {
            request.fail(LoadError::NotFound(path.clone()), tick);
        } else if path.is_package() {
            request.object = Some(Arc::new(LoadedObject::package(path.clone())));
            request.transition(LoadState::Preloaded, tick);
        } else if state.preloaded {
            self.issue_read(&mut request, tick);
        }

        let id = state.requests.insert(request);
        state.by_path.insert(path.clone(), id);
        log::debug!("Added load request for \"{}\" ({:?})", path, id);
        id
    }

    fn link_target(&self, state: &mut LoaderState, path: &AssetPath, tick: u64) -> LinkTarget {
        if path.package() == self.package {
            LinkTarget::Local(self.find_or_create(state, path, tick))
        } else if self.source.is_some() {
            LinkTarget::Deferred
        } else {
            log::warn!(
                "Loader for \"{}\" has no way to load \"{}\" from another package",
                self.package,
                path
            );
            LinkTarget::Unresolved
        }
    }

    /// Ask the loader of another package for `path`.  Must be called without our lock held.
    fn resolve_external(&self, path: &AssetPath) -> LinkTarget {
        let source = match self.source.as_ref().and_then(|s| s.upgrade()) {
            Some(source) => source,
            None => {
                log::warn!("No package loaders available to resolve \"{}\"", path);
                return LinkTarget::Unresolved;
            }
        };

        match source.package_loader(path) {
            Some(loader) => {
                let id = loader.begin_load_object(path);
                LinkTarget::External(ExternalLink {
                    loader: Arc::downgrade(&loader),
                    id,
                })
            }
            None => {
                log::warn!("No package loader for \"{}\"", path);
                LinkTarget::Unresolved
            }
        }
    }

    fn plan_links(&self, path: &AssetPath, data: LinkTableData) -> Vec<(LinkKind, AssetPath, bool)> {
        let owner = if data.owner.is_empty() {
            path.parent()
        } else {
            data.owner
        };

        let mut links = Vec::with_capacity(3 + data.references.len());
        for (kind, link) in [
            (LinkKind::Type, data.type_path),
            (LinkKind::Template, data.template),
            (LinkKind::Owner, owner),
        ] {
            if !link.is_empty() {
                links.push((kind, link, true));
            }
        }
        links.extend(
            data.references
                .into_iter()
                .map(|r| (LinkKind::Reference, r, self.config.references_required)),
        );
        links
    }

    fn step_request(&self, state: &mut LoaderState, id: RequestId, tick: u64) {
        let preloaded = state.preloaded;
        let request = match state.requests.get_mut(id) {
            Some(r) if r.changed_at < tick => r,
            _ => return,
        };

        let current = request.state;
        match current {
            LoadState::Issued => self.step_issued(request, preloaded, tick),
            LoadState::AsyncReading => self.step_link_table(state, id, tick),
            LoadState::Deserializing(DeserializePhase::Properties) => {
                Self::step_properties(request, tick)
            }
            // Link waits are settled after talking to other loaders.
            LoadState::Deserializing(DeserializePhase::LinkTable)
            | LoadState::Preloaded
            | LoadState::Error => {}
        }
    }

    fn step_issued(&self, request: &mut LoadRequest, preloaded: bool, tick: u64) {
        let read = match request.read {
            Some(read) => read,
            None => {
                if preloaded && !request.reclaim {
                    self.issue_read(request, tick);
                }
                return;
            }
        };

        let result = match self.cache.try_finish_read(read) {
            Some(result) => result,
            None => return,
        };
        request.read = None;

        if request.reclaim {
            log::trace!("Discarding data of abandoned request for \"{}\"", request.path);
            return;
        }

        match result {
            Ok(bytes) => {
                request.buffer = Some(Arc::from(bytes));
                request.transition(LoadState::AsyncReading, tick);
            }
            Err(e) => {
                log::error!("Failed to read cached data of \"{}\": {}", request.path, e);
                let error = LoadError::Io {
                    path: request.path.clone(),
                    source: Arc::new(e),
                };
                request.fail(error, tick);
            }
        }
    }

    fn step_link_table(&self, state: &mut LoaderState, id: RequestId, tick: u64) {
        let (path, buffer) = match state.requests.get(id) {
            Some(LoadRequest {
                path,
                buffer: Some(buffer),
                ..
            }) => (path.clone(), buffer.clone()),
            _ => return,
        };

        let parsed = RecordRegions::read(&buffer).and_then(|regions| {
            let links = LinkTableData::read(&buffer[regions.link_table.clone()])?;
            Ok((regions, links))
        });
        let (regions, data) = match parsed {
            Ok(parsed) => parsed,
            Err(source) => {
                log::error!("Cached data of \"{}\" is malformed: {}", path, source);
                if let Some(request) = state.requests.get_mut(id) {
                    request.fail(LoadError::Record { path, source }, tick);
                }
                return;
            }
        };

        let mut links = Vec::new();
        for (kind, link_path, required) in self.plan_links(&path, data) {
            let target = self.link_target(state, &link_path, tick);
            links.push(LinkSlot {
                kind,
                path: link_path,
                required,
                target,
            });
        }

        if let Some(request) = state.requests.get_mut(id) {
            log::debug!("Read link table of \"{}\" ({} links)", path, links.len());
            request.regions = Some(regions);
            request.links = links;
            request.transition(LoadState::Deserializing(DeserializePhase::LinkTable), tick);
        }
    }

    fn step_properties(request: &mut LoadRequest, tick: u64) {
        let (buffer, regions) = match (request.buffer.take(), request.regions.as_ref()) {
            (Some(buffer), Some(regions)) => (buffer, regions),
            _ => return,
        };

        let timestamp = request.entry.as_ref().map_or(0, |e| e.timestamp);
        request.object = Some(Arc::new(LoadedObject::from_record(
            request.path.clone(),
            timestamp,
            buffer,
            regions,
        )));
        log::debug!("Preloaded \"{}\"", request.path);
        request.transition(LoadState::Preloaded, tick);
    }

    fn link_status(
        state: &LoaderState,
        owner: RequestId,
        index: usize,
        slot: &LinkSlot,
        external: &ExternalStatuses,
        waiting: &IdSet<RequestId>,
    ) -> LinkStatus {
        match &slot.target {
            LinkTarget::Unresolved => LinkStatus::Failed,
            LinkTarget::Deferred => LinkStatus::Pending,
            LinkTarget::Local(id) => match state.requests.get(*id).map(|r| r.state) {
                None | Some(LoadState::Error) => LinkStatus::Failed,
                Some(LoadState::Preloaded)
                | Some(LoadState::Deserializing(DeserializePhase::Properties)) => LinkStatus::Ready,
                Some(LoadState::Deserializing(DeserializePhase::LinkTable)) if waiting.contains(id) => {
                    LinkStatus::WaitsOn(*id)
                }
                Some(_) => LinkStatus::Pending,
            },
            LinkTarget::External(_) => external
                .get(&(owner, index))
                .copied()
                .unwrap_or(LinkStatus::Pending),
        }
    }

    /// Status of a required link into another package.  Must be called without our lock held.
    ///
    /// The link is ready once its request can no longer fail: it is past its link table, or everything it still
    /// waits on, transitively and across loaders, is waiting on the same set of requests.
    fn external_status(link: &ExternalLink) -> LinkStatus {
        let root = match link.loader.upgrade() {
            Some(root) => root,
            None => return LinkStatus::Failed,
        };

        let mut visited: IdSet<(usize, RequestId)> = Default::default();
        let mut stack = vec![(root, link.id)];
        while let Some((loader, id)) = stack.pop() {
            if !visited.insert((Arc::as_ptr(&loader) as *const () as usize, id)) {
                continue;
            }
            if visited.len() > MAX_WAIT_WALK {
                log::warn!("Gave up walking the wait graph of {:?}", link.id);
                return LinkStatus::Pending;
            }

            let is_root = visited.len() == 1;
            match loader.link_wait(id) {
                None | Some(LinkWait::State(LoadState::Error)) if is_root => return LinkStatus::Failed,
                // Fails on its own; whoever waits on it finds out from its loader.
                None | Some(LinkWait::State(LoadState::Error)) => return LinkStatus::Pending,
                Some(LinkWait::State(LoadState::Preloaded))
                | Some(LinkWait::State(LoadState::Deserializing(DeserializePhase::Properties))) => {}
                Some(LinkWait::State(_)) | Some(LinkWait::Blocked) => return LinkStatus::Pending,
                Some(LinkWait::WaitsOn(edges)) => {
                    stack.extend(edges.into_iter().map(|e| (e.loader, e.id)))
                }
            }
        }
        LinkStatus::Ready
    }

    /// Statuses of the required links of a waiting request.
    fn required_statuses(
        state: &LoaderState,
        id: RequestId,
        external: &ExternalStatuses,
        waiting: &IdSet<RequestId>,
    ) -> Vec<(usize, LinkStatus)> {
        state.requests.get(id).map_or_else(Vec::new, |request| {
            request
                .links
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.required)
                .map(|(i, slot)| (i, Self::link_status(state, id, i, slot, external, waiting)))
                .collect()
        })
    }

    /// Move requests waiting on their links along: fail the ones with a failed required link, then release every
    /// request which doesn't depend, directly or through other waiting requests, on a link that isn't ready yet.
    fn resolve_links(
        &self,
        state: &mut LoaderState,
        external: &ExternalStatuses,
        tick: u64,
    ) {
        let mut waiting: IdSet<RequestId> = state
            .requests
            .iter()
            .filter(|(_, r)| {
                r.state == LoadState::Deserializing(DeserializePhase::LinkTable) && r.changed_at < tick
            })
            .map(|(id, _)| id)
            .collect();
        if waiting.is_empty() {
            return;
        }

        // Failing one request can fail the ones waiting on it, so go until nothing changes.
        loop {
            let mut failures = Vec::new();
            for &id in &waiting {
                let statuses = Self::required_statuses(state, id, external, &waiting);
                if let Some((index, _)) = statuses.into_iter().find(|(_, s)| *s == LinkStatus::Failed) {
                    failures.push((id, index));
                }
            }
            if failures.is_empty() {
                break;
            }

            for (id, index) in failures {
                waiting.remove(&id);
                if let Some(request) = state.requests.get_mut(id) {
                    let slot = &request.links[index];
                    log::warn!(
                        "{:?} link \"{}\" of \"{}\" failed to load",
                        slot.kind,
                        slot.path,
                        request.path
                    );
                    let error = LoadError::UnresolvedLink {
                        path: request.path.clone(),
                        kind: slot.kind,
                        link: slot.path.clone(),
                    };
                    request.fail(error, tick);
                }
            }
        }

        let statuses: IdMap<RequestId, Vec<LinkStatus>> = waiting
            .iter()
            .map(|&id| {
                let statuses = Self::required_statuses(state, id, external, &waiting)
                    .into_iter()
                    .map(|(_, s)| s)
                    .collect();
                (id, statuses)
            })
            .collect();

        let mut blocked: IdSet<RequestId> = statuses
            .iter()
            .filter(|(_, s)| s.contains(&LinkStatus::Pending))
            .map(|(id, _)| *id)
            .collect();
        loop {
            let newly_blocked: Vec<RequestId> = statuses
                .iter()
                .filter(|(id, _)| !blocked.contains(*id))
                .filter(|(_, s)| {
                    s.iter().any(|status| match status {
                        LinkStatus::WaitsOn(dep) => blocked.contains(dep),
                        _ => false,
                    })
                })
                .map(|(id, _)| *id)
                .collect();
            if newly_blocked.is_empty() {
                break;
            }
            blocked.extend(newly_blocked);
        }

        for id in waiting.difference(&blocked) {
            if let Some(request) = state.requests.get_mut(*id) {
                request.transition(LoadState::Deserializing(DeserializePhase::Properties), tick);
            }
        }
    }

    /// Drop every request that no caller can reach any more, returning the references they held in other loaders.
    fn collect_garbage(&self, state: &mut LoaderState) -> Vec<ExternalLink> {
        let mut reachable: IdSet<RequestId> = Default::default();
        let mut stack: Vec<RequestId> = state
            .requests
            .iter()
            .filter(|(_, r)| r.consumers > 0)
            .map(|(id, _)| id)
            .collect();
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(request) = state.requests.get(id) {
                stack.extend(request.links.iter().filter_map(|slot| match slot.target {
                    LinkTarget::Local(dep) => Some(dep),
                    _ => None,
                }));
            }
        }

        let mut releases = Vec::new();
        for id in state.requests.ids() {
            let request = match state.requests.get_mut(id) {
                Some(request) => request,
                None => continue,
            };

            if reachable.contains(&id) {
                request.reclaim = false;
                continue;
            }
            if request.read.is_some() {
                if !request.reclaim {
                    log::debug!(
                        "Reclaiming request for \"{}\" once its read completes",
                        request.path
                    );
                    request.reclaim = true;
                }
                continue;
            }

            if let Some(request) = state.requests.remove(id) {
                if state.by_path.get(&request.path) == Some(&id) {
                    state.by_path.remove(&request.path);
                }
                log::trace!("Released request for \"{}\" ({:?})", request.path, id);
                releases.extend(request.links.into_iter().filter_map(|slot| match slot.target {
                    LinkTarget::External(link) => Some(link),
                    _ => None,
                }));
            }
        }
        releases
    }

    fn export_target(state: &LoaderState, slot: &LinkSlot) -> Export {
        match &slot.target {
            LinkTarget::Local(id) => match state.requests.get(*id) {
                Some(dep) if dep.state != LoadState::Error => Export::Local(*id),
                _ => Export::Dropped,
            },
            LinkTarget::External(link) => Export::External(link.clone()),
            LinkTarget::Deferred | LinkTarget::Unresolved => Export::Dropped,
        }
    }
}

impl PackageLoader for CachePackageLoader {
    fn package_path(&self) -> &AssetPath {
        &self.package
    }

    fn begin_preload(&self) -> bool {
        if self.state.lock().preloaded {
            return true;
        }

        log::debug!(
            "Preloading package \"{}\" from cache \"{}\"",
            self.package,
            self.cache.name()
        );
        if !self.cache.begin_load_toc() {
            // Same as having nothing cached: every load of this package fails with `NotFound`.
            log::error!(
                "Could not read the TOC for package \"{}\", treating it as empty",
                self.package
            );
            self.state.lock().preloaded = true;
            return false;
        }

        let mut state = self.state.lock();
        state.preload_started = true;
        self.poll_preload(&mut state);
        true
    }

    fn try_finish_preload(&self) -> bool {
        let mut state = self.state.lock();
        self.poll_preload(&mut state)
    }

    fn begin_load_object(&self, path: &AssetPath) -> RequestId {
        let mut state = self.state.lock();
        let tick = state.tick;
        let id = self.find_or_create(&mut state, path, tick);
        if let Some(request) = state.requests.get_mut(id) {
            request.consumers += 1;
            request.reclaim = false;
        }
        id
    }

    fn try_finish_load_object(&self, id: RequestId) -> Option<Result<FinishedLoad, LoadError>> {
        let (result, exports, releases) = {
            let mut state = self.state.lock();
            let request = match state.requests.get(id) {
                Some(request) => request,
                None => return Some(Err(LoadError::UnknownRequest(id))),
            };
            if !request.is_terminal() {
                return None;
            }

            let result = match (&request.error, &request.object) {
                (Some(error), _) => Err(error.clone()),
                (None, Some(object)) => Ok(object.clone()),
                (None, None) => Err(LoadError::UnknownRequest(id)),
            };

            let mut exports = Vec::new();
            if result.is_ok() {
                exports = request
                    .links
                    .iter()
                    .map(|slot| (slot.kind, slot.path.clone(), Self::export_target(&state, slot)))
                    .collect::<Vec<_>>();
                for (_, _, export) in &exports {
                    if let Export::Local(dep) = export {
                        if let Some(dep) = state.requests.get_mut(*dep) {
                            dep.consumers += 1;
                        }
                    }
                }
            }

            if let Some(request) = state.requests.get_mut(id) {
                request.consumers = request.consumers.saturating_sub(1);
            }
            let releases = self.collect_garbage(&mut state);
            (result, exports, releases)
        };

        // References in other loaders are taken without our lock held.
        let links = exports
            .into_iter()
            .map(|(kind, path, export)| {
                let request = match export {
                    Export::Local(id) => self
                        .self_ref
                        .upgrade()
                        .map(|loader| LinkRequest { loader, id }),
                    Export::External(link) => link.loader.upgrade().map(|loader| {
                        let id = loader.begin_load_object(&path);
                        LinkRequest { loader, id }
                    }),
                    Export::Dropped => None,
                };
                LinkEntry {
                    kind,
                    path,
                    request,
                }
            })
            .collect();

        for link in releases {
            link.release();
        }

        Some(result.map(|object| FinishedLoad {
            object,
            links: LinkTable { links },
        }))
    }

    fn abandon_load_object(&self, id: RequestId) {
        let releases = {
            let mut state = self.state.lock();
            match state.requests.get_mut(id) {
                Some(request) => request.consumers = request.consumers.saturating_sub(1),
                None => {
                    log::warn!("Abandoning unknown load request {:?}", id);
                    return;
                }
            }
            self.collect_garbage(&mut state)
        };

        for link in releases {
            link.release();
        }
    }

    fn request_state(&self, id: RequestId) -> Option<LoadState> {
        self.state.lock().requests.get(id).map(|r| r.state)
    }

    fn link_wait(&self, id: RequestId) -> Option<LinkWait> {
        let state = self.state.lock();
        let request = state.requests.get(id)?;
        if request.state != LoadState::Deserializing(DeserializePhase::LinkTable) {
            return Some(LinkWait::State(request.state));
        }

        let mut edges = Vec::new();
        for slot in request.links.iter().filter(|s| s.required) {
            let edge = match &slot.target {
                LinkTarget::Local(dep) => match state.requests.get(*dep).map(|r| r.state) {
                    Some(LoadState::Preloaded)
                    | Some(LoadState::Deserializing(DeserializePhase::Properties)) => continue,
                    Some(LoadState::Deserializing(DeserializePhase::LinkTable)) => self
                        .self_ref
                        .upgrade()
                        .map(|loader| LinkRequest { loader, id: *dep }),
                    _ => None,
                },
                LinkTarget::External(link) => link
                    .loader
                    .upgrade()
                    .map(|loader| LinkRequest { loader, id: link.id }),
                LinkTarget::Deferred | LinkTarget::Unresolved => None,
            };
            match edge {
                Some(edge) => edges.push(edge),
                None => return Some(LinkWait::Blocked),
            }
        }
        Some(LinkWait::WaitsOn(edges))
    }

    fn tick(&self) {
        let (tick, deferred, polls, releases) = {
            let mut state = self.state.lock();
            state.tick += 1;
            let tick = state.tick;

            self.poll_preload(&mut state);
            for id in state.requests.ids() {
                self.step_request(&mut state, id, tick);
            }
            let releases = self.collect_garbage(&mut state);

            let mut deferred = Vec::new();
            let mut polls = Vec::new();
            for (id, request) in state.requests.iter() {
                let waiting = request.state == LoadState::Deserializing(DeserializePhase::LinkTable)
                    && request.changed_at < tick;
                for (index, slot) in request.links.iter().enumerate() {
                    match &slot.target {
                        LinkTarget::Deferred if request.state != LoadState::Error => {
                            deferred.push((id, index, slot.path.clone()))
                        }
                        LinkTarget::External(link) if waiting && slot.required => {
                            polls.push((id, index, link.clone()))
                        }
                        _ => {}
                    }
                }
            }
            (tick, deferred, polls, releases)
        };

        let resolved: Vec<_> = deferred
            .into_iter()
            .map(|(id, index, path)| (id, index, self.resolve_external(&path)))
            .collect();
        let external: ExternalStatuses = polls
            .into_iter()
            .map(|(id, index, link)| ((id, index), Self::external_status(&link)))
            .collect();
        for link in releases {
            link.release();
        }

        let stale = {
            let mut state = self.state.lock();
            let mut stale = Vec::new();
            for (id, index, target) in resolved {
                let slot = state
                    .requests
                    .get_mut(id)
                    .and_then(|r| r.links.get_mut(index))
                    .filter(|slot| matches!(slot.target, LinkTarget::Deferred));
                match (slot, target) {
                    (Some(slot), target) => slot.target = target,
                    // The request went away while we were asking.
                    (None, LinkTarget::External(link)) => stale.push(link),
                    (None, _) => {}
                }
            }

            self.resolve_links(&mut state, &external, tick);
            stale
        };

        for link in stale {
            link.release();
        }
    }

    fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    fn object_path(&self, index: usize) -> Option<AssetPath> {
        self.state.lock().objects.get(index).cloned()
    }
}

impl Drop for CachePackageLoader {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for id in state.requests.ids() {
            let request = match state.requests.remove(id) {
                Some(request) => request,
                None => continue,
            };

            if let Some(read) = request.read {
                if let Err(e) = self.cache.finish_read(read) {
                    log::debug!("Outstanding read of \"{}\" failed during shutdown: {}", request.path, e);
                }
            }
            for slot in request.links {
                if let LinkTarget::External(link) = slot.target {
                    link.release();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_support::*;

    fn path(s: &str) -> AssetPath {
        AssetPath::parse(s).unwrap()
    }

    fn setup() -> (Arc<MemoryVfs>, Arc<ManualAsyncIo>, Arc<Cache>) {
        let (vfs, io) = memory_backend();
        let cache = Arc::new(make_cache(&vfs, &io));
        (vfs, io, cache)
    }

    fn store(cache: &Cache, object: &str, record: ObjectRecordWriter) {
        cache
            .cache_entry(&path(object), 0, &record.encode().unwrap(), 7)
            .unwrap();
    }

    fn make_loader(cache: &Arc<Cache>, config: LoaderConfig) -> Arc<CachePackageLoader> {
        let loader = CachePackageLoader::new(path("/LoaderTest"), cache.clone(), config, None);
        assert!(loader.begin_preload());
        assert!(loader.try_finish_preload());
        loader
    }

    fn run(io: &ManualAsyncIo, loader: &CachePackageLoader) {
        for _ in 0..32 {
            io.complete_all();
            loader.tick();
        }
    }

    fn finish(loader: &CachePackageLoader, id: RequestId) -> Result<FinishedLoad, LoadError> {
        loader
            .try_finish_load_object(id)
            .expect("Request should be terminal")
    }

    #[test]
    fn packages_resolve_immediately() {
        let (_vfs, _io, cache) = setup();
        let loader = make_loader(&cache, Default::default());

        let id = loader.begin_load_object(&path("/LoaderTest"));
        assert_eq!(loader.request_state(id), Some(LoadState::Preloaded));
        let loaded = finish(&loader, id).unwrap();
        assert!(loaded.object.is_package());
        assert!(loaded.object.property_data().is_empty());
        assert!(loaded.links.is_empty());
    }

    #[test]
    fn missing_objects_are_not_found() {
        let (_vfs, _io, cache) = setup();
        let loader = make_loader(&cache, Default::default());

        let id = loader.begin_load_object(&path("/LoaderTest:Missing"));
        assert_eq!(loader.request_state(id), Some(LoadState::Error));
        match finish(&loader, id) {
            Err(LoadError::NotFound(p)) => assert_eq!(p, path("/LoaderTest:Missing")),
            other => panic!("Expected not found, got {:?}", other),
        }
        assert!(matches!(
            loader.try_finish_load_object(id),
            Some(Err(LoadError::UnknownRequest(_)))
        ));
    }

    #[test]
    fn one_transition_per_tick() {
        let (_vfs, io, cache) = setup();
        store(
            &cache,
            "/LoaderTest:A",
            ObjectRecordWriter::new()
                .properties(&b"props"[..])
                .persistent_resource(&b"resource"[..]),
        );
        let loader = make_loader(&cache, Default::default());

        let id = loader.begin_load_object(&path("/LoaderTest:A"));
        for _ in 0..5 {
            loader.tick();
            assert_eq!(loader.request_state(id), Some(LoadState::Issued));
        }
        assert!(loader.try_finish_load_object(id).is_none());

        io.complete_all();
        let expected = [
            LoadState::AsyncReading,
            LoadState::Deserializing(DeserializePhase::LinkTable),
            LoadState::Deserializing(DeserializePhase::Properties),
            LoadState::Preloaded,
        ];
        for state in expected.iter() {
            loader.tick();
            assert_eq!(loader.request_state(id).as_ref(), Some(state));
        }

        let loaded = finish(&loader, id).unwrap();
        assert_eq!(loaded.object.path(), &path("/LoaderTest:A"));
        assert_eq!(loaded.object.property_data(), b"props");
        assert_eq!(loaded.object.persistent_resource_data(), b"resource");
        assert_eq!(loaded.object.timestamp(), 7);

        // No explicit owner, so the owner is the parent.
        assert_eq!(loaded.links.len(), 1);
        let owner = &loaded.links.links[0];
        assert_eq!(owner.kind, LinkKind::Owner);
        assert_eq!(owner.path, path("/LoaderTest"));
        let request = owner.request.as_ref().unwrap();
        assert_eq!(request.loader.package_path(), &path("/LoaderTest"));
        let owner_object = request.loader.try_finish_load_object(request.id).unwrap().unwrap();
        assert!(owner_object.object.is_package());
    }

    #[test]
    fn waits_for_preload() {
        let (vfs, io, cache) = setup();
        store(&cache, "/LoaderTest:Late", ObjectRecordWriter::new());

        // A fresh cache over the same files has to read the TOC first.
        let cache = Arc::new(make_cache(&vfs, &io));
        let loader = CachePackageLoader::new(path("/LoaderTest"), cache, Default::default(), None);
        assert!(loader.begin_preload());
        assert!(!loader.try_finish_preload());

        let id = loader.begin_load_object(&path("/LoaderTest:Late"));
        for _ in 0..3 {
            loader.tick();
            assert_eq!(loader.request_state(id), Some(LoadState::Issued));
        }
        // Only the TOC read is outstanding.
        assert_eq!(io.pending_count(), 1);

        io.complete_all();
        loader.tick();
        assert!(loader.try_finish_preload());
        assert_eq!(loader.object_count(), 1);
        assert_eq!(io.pending_count(), 1);
        assert_eq!(loader.request_state(id), Some(LoadState::Issued));

        run(&io, &loader);
        assert!(finish(&loader, id).is_ok());
    }

    #[test]
    fn required_link_failure_propagates() {
        let (_vfs, io, cache) = setup();
        store(
            &cache,
            "/LoaderTest:A",
            ObjectRecordWriter::new()
                .reference(path("/LoaderTest:B"))
                .reference(path("/LoaderTest:C"))
                .reference(path("/LoaderTest:D")),
        );
        store(&cache, "/LoaderTest:B", ObjectRecordWriter::new());
        store(&cache, "/LoaderTest:C", ObjectRecordWriter::new());
        cache
            .cache_entry(&path("/LoaderTest:D"), 0, b"junk", 1)
            .unwrap();
        let loader = make_loader(&cache, Default::default());

        let a = loader.begin_load_object(&path("/LoaderTest:A"));
        let b = loader.begin_load_object(&path("/LoaderTest:B"));
        let c = loader.begin_load_object(&path("/LoaderTest:C"));
        run(&io, &loader);

        match finish(&loader, a) {
            Err(LoadError::UnresolvedLink { path: p, kind, link }) => {
                assert_eq!(p, path("/LoaderTest:A"));
                assert_eq!(kind, LinkKind::Reference);
                assert_eq!(link, path("/LoaderTest:D"));
            }
            other => panic!("Expected an unresolved link, got {:?}", other),
        }
        assert!(finish(&loader, b).is_ok());
        assert!(finish(&loader, c).is_ok());

        let d = loader.begin_load_object(&path("/LoaderTest:D"));
        run(&io, &loader);
        assert!(matches!(finish(&loader, d), Err(LoadError::Record { .. })));
    }

    #[test]
    fn required_type_link_failure() {
        let (_vfs, io, cache) = setup();
        store(
            &cache,
            "/LoaderTest:Typed",
            ObjectRecordWriter::new().type_path(path("/LoaderTest:NoSuchType")),
        );
        let loader = make_loader(&cache, Default::default());

        let id = loader.begin_load_object(&path("/LoaderTest:Typed"));
        run(&io, &loader);
        assert!(matches!(
            finish(&loader, id),
            Err(LoadError::UnresolvedLink {
                kind: LinkKind::Type,
                ..
            })
        ));
    }

    #[test]
    fn optional_references_are_dropped() {
        let (_vfs, io, cache) = setup();
        store(
            &cache,
            "/LoaderTest:A",
            ObjectRecordWriter::new()
                .reference(path("/LoaderTest:B"))
                .reference(path("/LoaderTest:D")),
        );
        store(&cache, "/LoaderTest:B", ObjectRecordWriter::new());
        cache
            .cache_entry(&path("/LoaderTest:D"), 0, b"junk", 1)
            .unwrap();
        let config = LoaderConfigBuilder::default()
            .references_required(false)
            .build()
            .unwrap();
        let loader = make_loader(&cache, config);

        let a = loader.begin_load_object(&path("/LoaderTest:A"));
        run(&io, &loader);
        let loaded = finish(&loader, a).unwrap();

        let references: Vec<_> = loaded.links.of_kind(LinkKind::Reference).collect();
        assert_eq!(references.len(), 2);
        assert!(references[0].request.is_some());
        assert_eq!(references[1].path, path("/LoaderTest:D"));
        assert!(references[1].request.is_none());
        loaded.links.abandon_all();
    }

    #[test]
    fn link_cycles_are_released() {
        let (_vfs, io, cache) = setup();
        store(
            &cache,
            "/LoaderTest:A",
            ObjectRecordWriter::new().reference(path("/LoaderTest:B")),
        );
        store(
            &cache,
            "/LoaderTest:B",
            ObjectRecordWriter::new().reference(path("/LoaderTest:A")),
        );
        store(
            &cache,
            "/LoaderTest:Own",
            ObjectRecordWriter::new().reference(path("/LoaderTest:Own")),
        );
        let loader = make_loader(&cache, Default::default());

        let a = loader.begin_load_object(&path("/LoaderTest:A"));
        let own = loader.begin_load_object(&path("/LoaderTest:Own"));
        run(&io, &loader);

        let loaded = finish(&loader, a).unwrap();
        let b = loaded.links.of_kind(LinkKind::Reference).next().unwrap();
        let b_request = b.request.as_ref().unwrap();
        let b_loaded = b_request.loader.try_finish_load_object(b_request.id).unwrap().unwrap();
        assert_eq!(b_loaded.object.path(), &path("/LoaderTest:B"));
        finish(&loader, own).unwrap().links.abandon_all();

        loaded.links.abandon_all();
        b_loaded.links.abandon_all();
        assert_eq!(loader.live_request_count(), 0);
    }

    #[test]
    fn shared_requests() {
        let (_vfs, io, cache) = setup();
        store(&cache, "/LoaderTest:Shared", ObjectRecordWriter::new());
        let loader = make_loader(&cache, Default::default());

        let first = loader.begin_load_object(&path("/LoaderTest:Shared"));
        let second = loader.begin_load_object(&path("/LoaderTest:Shared"));
        assert_eq!(first, second);
        run(&io, &loader);

        finish(&loader, first).unwrap().links.abandon_all();
        assert_eq!(loader.request_state(first), Some(LoadState::Preloaded));
        finish(&loader, second).unwrap().links.abandon_all();
        assert_eq!(loader.request_state(first), None);
        assert_eq!(loader.live_request_count(), 0);
    }

    #[test]
    fn abandoned_requests_are_reclaimed() {
        let (_vfs, io, cache) = setup();
        store(
            &cache,
            "/LoaderTest:Abandoned",
            ObjectRecordWriter::new().reference(path("/LoaderTest:Other")),
        );
        store(&cache, "/LoaderTest:Other", ObjectRecordWriter::new());
        let loader = make_loader(&cache, Default::default());

        let id = loader.begin_load_object(&path("/LoaderTest:Abandoned"));
        loader.abandon_load_object(id);
        // The read is still outstanding, so the request sticks around until it lands.
        assert_eq!(loader.request_state(id), Some(LoadState::Issued));

        io.complete_all();
        loader.tick();
        assert_eq!(loader.request_state(id), None);
        assert_eq!(loader.live_request_count(), 0);
        assert_eq!(io.pending_count(), 0);

        // Abandoning part way through takes the links with it.
        let id = loader.begin_load_object(&path("/LoaderTest:Abandoned"));
        for _ in 0..4 {
            io.complete_all();
            loader.tick();
        }
        assert!(loader.live_request_count() > 1);
        loader.abandon_load_object(id);
        run(&io, &loader);
        assert_eq!(loader.live_request_count(), 0);
    }

    #[test]
    fn unreadable_toc_fails_loads() {
        let (vfs, io) = memory_backend();
        {
            let cache = make_cache(&vfs, &io);
            store(&cache, "/LoaderTest:Hidden", ObjectRecordWriter::new());
        }
        let cache = Cache::new(
            "unstattable-loader",
            Platform::Pc,
            TOC_FILE,
            CACHE_FILE,
            UnstattableVfs::new(vfs.clone(), TOC_FILE),
            io.clone(),
        )
        .unwrap();
        let loader = CachePackageLoader::new(path("/LoaderTest"), Arc::new(cache), Default::default(), None);

        let early = loader.begin_load_object(&path("/LoaderTest:Hidden"));
        assert!(!loader.begin_preload());
        assert!(loader.try_finish_preload());
        assert_eq!(loader.object_count(), 0);
        let late = loader.begin_load_object(&path("/LoaderTest:Other"));

        run(&io, &loader);
        assert!(matches!(finish(&loader, early), Err(LoadError::NotFound(_))));
        assert!(matches!(finish(&loader, late), Err(LoadError::NotFound(_))));
    }

    #[test]
    fn read_errors() {
        let (_vfs, io, cache) = setup();
        store(&cache, "/LoaderTest:Unreadable", ObjectRecordWriter::new());
        io.fail_reads_of(CACHE_FILE);
        let loader = make_loader(&cache, Default::default());

        let id = loader.begin_load_object(&path("/LoaderTest:Unreadable"));
        run(&io, &loader);
        assert!(matches!(finish(&loader, id), Err(LoadError::Io { .. })));
    }

    #[test]
    fn object_list() {
        let (_vfs, _io, cache) = setup();
        store(&cache, "/LoaderTest:One", ObjectRecordWriter::new());
        store(&cache, "/LoaderTest:Two", ObjectRecordWriter::new());
        store(&cache, "/Elsewhere:Three", ObjectRecordWriter::new());
        cache
            .cache_entry(&path("/LoaderTest:One"), 1, b"extra", 0)
            .unwrap();
        let loader = make_loader(&cache, Default::default());

        assert_eq!(loader.object_count(), 2);
        assert_eq!(loader.object_path(0), Some(path("/LoaderTest:One")));
        assert_eq!(loader.object_path(1), Some(path("/LoaderTest:Two")));
        assert_eq!(loader.object_path(2), None);
    }

    #[test]
    fn cross_package_links_without_a_source_fail() {
        let (_vfs, io, cache) = setup();
        store(
            &cache,
            "/LoaderTest:Foreign",
            ObjectRecordWriter::new().template(path("/Elsewhere:Template")),
        );
        store(&cache, "/Elsewhere:Template", ObjectRecordWriter::new());
        let loader = make_loader(&cache, Default::default());

        let id = loader.begin_load_object(&path("/LoaderTest:Foreign"));
        run(&io, &loader);
        assert!(matches!(
            finish(&loader, id),
            Err(LoadError::UnresolvedLink {
                kind: LinkKind::Template,
                ..
            })
        ));
    }
}
