use crate::cache::{CacheTables, LoadKey, LoadRequest};
use crate::request::SharedRequest;
use crate::scheduler::TickBudget;
use std::collections::VecDeque;
use std::sync::Arc;

/// Deferred release queue. A handle whose ref count drops to zero is parked
/// here instead of being freed, so rapid release/re-acquire sequences never
/// cause a redundant free and refetch. The sweep runs under the tick budget
/// and spreads large batches over multiple maintenance passes.
#[derive(Default)]
pub struct Recycler {
    pending: VecDeque<SharedRequest<LoadRequest>>,
}

impl Recycler {
    pub fn recycle(
        &mut self,
        handle: SharedRequest<LoadRequest>,
    ) {
        self.pending.push_back(handle);
    }

    /// Remove a pending entry on re-acquire.
    pub fn cancel(
        &mut self,
        handle: &SharedRequest<LoadRequest>,
    ) {
        self.pending.retain(|pending| !Arc::ptr_eq(pending, handle));
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// One sweep over the queue. Entries that were re-acquired are dropped
    /// from the queue (cancelled); entries still loading, or still retained
    /// through the reference graph, stay queued for a later pass; the rest
    /// are disposed, their dependency counts released, and their handles
    /// returned to the pool.
    #[profiling::function]
    pub fn update(
        &mut self,
        budget: &TickBudget,
        tables: &mut CacheTables,
    ) {
        let batch = self.pending.len();
        for _ in 0..batch {
            let Some(handle) = self.pending.pop_front() else {
                return;
            };

            let mut guard = handle.lock().unwrap();
            if guard.ref_count > 0 {
                // Re-acquired since it was queued; treat as cancelled
                continue;
            }

            if !guard.base.is_done() {
                // The underlying fetch is shared and still in flight; free it
                // once it settles
                drop(guard);
                self.pending.push_back(handle);
                continue;
            }

            if tables.references.count(&guard.path) > 0 {
                // Another loader still depends on this entry; it stays parked
                // until the dependent releases it
                drop(guard);
                self.pending.push_back(handle);
                continue;
            }

            let key = LoadKey {
                path: guard.path.clone(),
                content_type: guard.content_type,
            };

            log::debug!("unload {} [{}]", key.path, key.content_type);
            if let Some(mut handler) = guard.handler.take() {
                handler.dispose(&mut guard);
            }
            guard.payload = None;
            let dependencies = std::mem::take(&mut guard.dependencies);
            drop(guard);

            tables.loaded.remove(&key);

            // Release the dependency closure. Entries representing a now
            // unreferenced dependency will be swept on a later pass once
            // their own ref count is zero.
            for dep in dependencies {
                tables.references.release(&dep);
            }

            tables.unused.push(handle);

            if budget.exhausted() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use quay_base::hashing::HashMap;

    use crate::cache::ContentHandler;
    use crate::references::ReferenceGraph;
    use crate::request::{Outcome, Request};

    struct NullHandler;

    impl ContentHandler for NullHandler {
        fn on_start(
            &mut self,
            _request: &mut LoadRequest,
        ) {
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

    fn tables() -> CacheTables {
        CacheTables {
            loaded: HashMap::default(),
            references: ReferenceGraph::default(),
            unused: Vec::default(),
        }
    }

    fn done_handle(path: &str) -> SharedRequest<LoadRequest> {
        let handle = crate::request::shared(loader_request(path));
        handle
            .lock()
            .unwrap()
            .base_mut()
            .set_result(Outcome::Success, None);
        handle
    }

    fn loader_request(path: &str) -> LoadRequest {
        LoadRequest {
            base: Default::default(),
            path: path.to_string(),
            content_type: "bytes",
            bundle_file: format!("{}.bundle", path),
            dependencies: Vec::default(),
            payload: Some(b"x".to_vec()),
            ref_count: 0,
            handler: Some(Box::new(NullHandler)),
        }
    }

    #[test]
    fn in_flight_entries_wait_for_their_fetch() {
        let mut recycler = Recycler::default();
        let mut tables = tables();

        // not done yet: the shared fetch must settle before disposal
        let handle = crate::request::shared(loader_request("a"));
        tables.loaded.insert(
            LoadKey {
                path: "a".to_string(),
                content_type: "bytes",
            },
            handle.clone(),
        );
        recycler.recycle(handle.clone());

        recycler.update(&TickBudget::unbounded(), &mut tables);
        assert_eq!(recycler.pending_count(), 1);
        assert_eq!(tables.loaded.len(), 1);

        handle
            .lock()
            .unwrap()
            .base_mut()
            .set_result(Outcome::Success, None);
        recycler.update(&TickBudget::unbounded(), &mut tables);
        assert_eq!(recycler.pending_count(), 0);
        assert_eq!(tables.loaded.len(), 0);
        assert_eq!(tables.unused.len(), 1);
    }

    #[test]
    fn graph_retained_entries_stay_parked() {
        let mut recycler = Recycler::default();
        let mut tables = tables();

        let handle = done_handle("shared");
        tables.loaded.insert(
            LoadKey {
                path: "shared".to_string(),
                content_type: "bytes",
            },
            handle.clone(),
        );
        tables.references.retain("shared");
        recycler.recycle(handle);

        recycler.update(&TickBudget::unbounded(), &mut tables);
        assert_eq!(recycler.pending_count(), 1);
        assert_eq!(tables.loaded.len(), 1);

        // the last dependent lets go; the parked entry sweeps on the next pass
        tables.references.release("shared");
        recycler.update(&TickBudget::unbounded(), &mut tables);
        assert_eq!(recycler.pending_count(), 0);
        assert_eq!(tables.loaded.len(), 0);
    }
}
