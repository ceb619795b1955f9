use crate::recycler::Recycler;
use crate::references::ReferenceGraph;
use crate::request::{shared, Callback, Outcome, Request, RequestBase, SharedRequest};
use crate::scheduler::{Scheduler, TickBudget};
use quay_base::hashing::HashMap;
use quay_base::{ContentError, VersionSet};
use std::path::PathBuf;

/// Loaded content is keyed by logical path plus the content type it was
/// requested as, so the same path can be loaded as different representations.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LoadKey {
    pub path: String,
    pub content_type: &'static str,
}

/// Loading strategy behind a load request. Swappable at startup: the packed
/// runtime reads bundle files off disk, editor-simulation or tests plug in
/// their own. Implementations drive the request by calling `set_result` on
/// its base.
pub trait ContentHandler: Send {
    fn on_start(
        &mut self,
        request: &mut LoadRequest,
    );

    fn update(
        &mut self,
        request: &mut LoadRequest,
    );

    fn dispose(
        &mut self,
        request: &mut LoadRequest,
    );
}

pub type HandlerFactory = Box<dyn Fn() -> Box<dyn ContentHandler> + Send>;

/// A reference-counted cache entry wrapping one request for one
/// (path, content type) key. Dropping the ref count to zero does not free it;
/// it is queued on the recycler so a near-term re-acquire cancels the free.
pub struct LoadRequest {
    pub base: RequestBase,
    pub path: String,
    pub content_type: &'static str,
    /// The bundle file this asset resolves to.
    pub bundle_file: String,
    /// Bundle names retained in the reference graph for this load: the
    /// asset's bundle plus its transitive dependency closure.
    pub dependencies: Vec<String>,
    /// Whatever the handler produced. Cleared on recycle.
    pub payload: Option<Vec<u8>>,

    pub(crate) ref_count: u32,
    pub(crate) handler: Option<Box<dyn ContentHandler>>,
}

impl LoadRequest {
    fn new(
        path: String,
        content_type: &'static str,
        bundle_file: String,
        dependencies: Vec<String>,
        handler: Box<dyn ContentHandler>,
    ) -> LoadRequest {
        LoadRequest {
            base: RequestBase::default(),
            path,
            content_type,
            bundle_file,
            dependencies,
            payload: None,
            ref_count: 0,
            handler: Some(handler),
        }
    }

    // Restore default state before pool reuse
    fn reuse(
        &mut self,
        path: String,
        content_type: &'static str,
        bundle_file: String,
        dependencies: Vec<String>,
        handler: Box<dyn ContentHandler>,
    ) {
        self.base.reset();
        self.path = path;
        self.content_type = content_type;
        self.bundle_file = bundle_file;
        self.dependencies = dependencies;
        self.payload = None;
        self.ref_count = 0;
        self.handler = Some(handler);
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    // The handler is taken out for the duration of the call so it can borrow
    // the request mutably without aliasing itself
    fn with_handler(
        &mut self,
        f: impl FnOnce(&mut Box<dyn ContentHandler>, &mut LoadRequest),
    ) {
        if let Some(mut handler) = self.handler.take() {
            f(&mut handler, self);
            self.handler = Some(handler);
        }
    }
}

impl Request for LoadRequest {
    fn kind(&self) -> &'static str {
        "load"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn base(&self) -> &RequestBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RequestBase {
        &mut self.base
    }

    fn on_start(&mut self) {
        self.with_handler(|handler, request| handler.on_start(request));
    }

    fn on_update(&mut self) {
        self.with_handler(|handler, request| handler.update(request));
    }

    fn on_completed(&mut self) {
        log::debug!(
            "load {} [{}] {:?}",
            self.path,
            self.content_type,
            self.base.outcome
        );
    }
}

// State shared between the cache front-end and the recycler's sweep.
pub(crate) struct CacheTables {
    pub(crate) loaded: HashMap<LoadKey, SharedRequest<LoadRequest>>,
    pub(crate) references: ReferenceGraph,
    pub(crate) unused: Vec<SharedRequest<LoadRequest>>,
}

/// Memoizes loaded content keyed by (path, content type) and multiplexes
/// concurrent loads of one key onto one underlying fetch: at most one
/// in-flight fetch exists per key.
pub struct ContentCache {
    tables: CacheTables,
    recycler: Recycler,
    handler_factory: HandlerFactory,
}

impl ContentCache {
    pub fn new(handler_factory: HandlerFactory) -> ContentCache {
        ContentCache {
            tables: CacheTables {
                loaded: HashMap::default(),
                references: ReferenceGraph::default(),
                unused: Vec::default(),
            },
            recycler: Recycler::default(),
            handler_factory,
        }
    }

    /// Resolve `path` through the version set and return its load handle,
    /// creating and enqueueing the load on first acquire. Subsequent acquires
    /// share the handle: an in-flight load gains a callback, a finished one
    /// gets its callback scheduled for next tick, and a handle pending
    /// recycle is revived without refetching.
    #[profiling::function]
    pub fn acquire(
        &mut self,
        versions: &VersionSet,
        scheduler: &mut Scheduler,
        path: &str,
        content_type: &'static str,
        callback: Option<Callback>,
    ) -> Result<SharedRequest<LoadRequest>, ContentError> {
        let (manifest, asset) = versions
            .try_get_asset(path)
            .ok_or_else(|| ContentError::NotFound(path.to_string()))?;
        let bundle = manifest.bundle_for_asset(asset);

        let key = LoadKey {
            path: path.to_string(),
            content_type,
        };

        if let Some(existing) = self.tables.loaded.get(&key) {
            let existing = existing.clone();
            {
                let mut guard = existing.lock().unwrap();
                if guard.ref_count == 0 {
                    // Pending recycle; revive it instead of refetching
                    self.recycler.cancel(&existing);
                }
                guard.ref_count += 1;

                if let Some(callback) = callback {
                    if guard.base.is_done() {
                        scheduler.call_async(callback);
                    } else {
                        guard.base.add_callback(callback);
                    }
                }
            }
            return Ok(existing);
        }

        // First load of this key. Retain the dependency closure up front so
        // shared bundles cannot be reclaimed while this load is alive.
        let dependencies: Vec<String> = manifest
            .bundles_with_deps(&bundle.name)
            .iter()
            .map(|b| b.name.clone())
            .collect();
        for dep in &dependencies {
            self.tables.references.retain(dep);
        }

        let handler = (self.handler_factory)();
        let request = match self.tables.unused.pop() {
            Some(request) => {
                request.lock().unwrap().reuse(
                    key.path.clone(),
                    content_type,
                    bundle.file.clone(),
                    dependencies,
                    handler,
                );
                request
            }
            None => shared(LoadRequest::new(
                key.path.clone(),
                content_type,
                bundle.file.clone(),
                dependencies,
                handler,
            )),
        };

        {
            let mut guard = request.lock().unwrap();
            guard.ref_count = 1;
            if let Some(callback) = callback {
                guard.base.add_callback(callback);
            }
        }

        self.tables.loaded.insert(key, request.clone());
        scheduler.enqueue(request.clone());
        Ok(request)
    }

    /// Drop one reference. At zero the handle goes to the recycler, not to
    /// immediate destruction.
    pub fn release(
        &mut self,
        handle: &SharedRequest<LoadRequest>,
    ) {
        let mut guard = handle.lock().unwrap();
        if guard.ref_count == 0 {
            log::error!("release {} too many times", guard.path);
            return;
        }

        guard.ref_count -= 1;
        if guard.ref_count == 0 {
            log::debug!("queue recycle {}", guard.path);
            drop(guard);
            self.recycler.recycle(handle.clone());
        }
    }

    /// One recycler maintenance pass under the given budget.
    pub fn maintain(
        &mut self,
        budget: &TickBudget,
    ) {
        self.recycler.update(budget, &mut self.tables);
    }

    pub fn loaded_count(&self) -> usize {
        self.tables.loaded.len()
    }

    pub fn is_loaded(
        &self,
        path: &str,
        content_type: &'static str,
    ) -> bool {
        self.tables.loaded.contains_key(&LoadKey {
            path: path.to_string(),
            content_type,
        })
    }

    /// Current retain count of a dependency in the reference graph.
    pub fn reference_count(
        &self,
        key: &str,
    ) -> i32 {
        self.tables.references.count(key)
    }

    pub fn pooled_count(&self) -> usize {
        self.tables.unused.len()
    }
}

/// Packed-runtime handler: reads the asset's bundle file from the first
/// content root that has it. Download dir shadows the shipped player dir.
pub struct BundleContentHandler {
    roots: Vec<PathBuf>,
}

impl BundleContentHandler {
    pub fn factory(roots: Vec<PathBuf>) -> HandlerFactory {
        Box::new(move || {
            Box::new(BundleContentHandler {
                roots: roots.clone(),
            })
        })
    }
}

impl ContentHandler for BundleContentHandler {
    fn on_start(
        &mut self,
        request: &mut LoadRequest,
    ) {
        for root in &self.roots {
            let path = root.join(&request.bundle_file);
            if path.exists() {
                match std::fs::read(&path) {
                    Ok(data) => {
                        request.payload = Some(data);
                        request.base.set_result(Outcome::Success, None);
                    }
                    Err(e) => {
                        request
                            .base
                            .set_result(Outcome::Failed, Some(e.to_string()));
                    }
                }
                return;
            }
        }

        request.base.set_result(
            Outcome::Failed,
            Some(format!("bundle file not found: {}", request.bundle_file)),
        );
    }

    fn update(
        &mut self,
        _request: &mut LoadRequest,
    ) {
    }

    fn dispose(
        &mut self,
        _request: &mut LoadRequest,
    ) {
    }
}
