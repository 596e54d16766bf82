//! In-process catalog.
//!
//! Holds instance lists per [`Query`] under one global modify index, the way
//! a Consul cluster shares a single raft index across all services. Reads
//! only return instances whose checks all pass, like `?passing`. Blocking
//! reads park until the index moves past the caller's wait index or the wait
//! time elapses. Useful for:
//! - Testing resolvers and watchers without a catalog agent
//! - Local development with a fixed set of backends

use super::{Catalog, CatalogResponse, Fetching, HealthService, Query, QueryMeta, QueryOptions};
use crate::base::error::CatalogError;
use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Default)]
struct Entry {
    index: u64,
    instances: Vec<HealthService>,
}

#[derive(Default)]
struct State {
    entries: DashMap<Query, Entry>,
    index: AtomicU64,
    changed: Notify,
    failure: ArcSwapOption<CatalogError>,
    one_shot: DashMap<Query, usize>,
    blocking: DashMap<Query, usize>,
}

/// Thread-safe in-memory [`Catalog`]. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryCatalog {
    state: Arc<State>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the instances of `query`, bumping the global index and waking
    /// blocked readers.
    pub fn register(&self, query: &Query, instances: Vec<HealthService>) -> u64 {
        let index = self.state.index.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.entries.insert(query.clone(), Entry { index, instances });
        self.state.changed.notify_waiters();
        index
    }

    /// Remove `query` from the catalog; readers then see an empty list.
    pub fn deregister(&self, query: &Query) -> u64 {
        self.register(query, Vec::new())
    }

    /// Make every read fail with `error` until [`MemoryCatalog::recover`].
    pub fn fail_with(&self, error: CatalogError) {
        self.state.failure.store(Some(Arc::new(error)));
        self.state.changed.notify_waiters();
    }

    pub fn recover(&self) {
        self.state.failure.store(None);
    }

    /// Current global index.
    pub fn index(&self) -> u64 {
        self.state.index.load(Ordering::SeqCst)
    }

    /// Number of non-blocking reads issued for `query`.
    pub fn one_shot_fetches(&self, query: &Query) -> usize {
        self.state.one_shot.get(query).map(|c| *c).unwrap_or(0)
    }

    /// Number of blocking reads issued for `query`.
    pub fn blocking_fetches(&self, query: &Query) -> usize {
        self.state.blocking.get(query).map(|c| *c).unwrap_or(0)
    }

    fn snapshot(&self, query: &Query) -> Result<CatalogResponse, CatalogError> {
        if let Some(error) = self.state.failure.load_full() {
            return Err((*error).clone());
        }

        let (index, instances) = match self.state.entries.get(query) {
            Some(entry) => (
                entry.index,
                entry.instances.iter().filter(|s| s.is_passing()).cloned().collect(),
            ),
            // Unknown services answer with an empty list at the global index.
            None => (self.index().max(1), Vec::new()),
        };

        Ok(CatalogResponse {
            instances,
            meta: QueryMeta { last_index: index, known_leader: true, ..Default::default() },
        })
    }

    async fn fetch_inner(
        &self,
        query: Query,
        options: QueryOptions,
    ) -> Result<CatalogResponse, CatalogError> {
        let counters = if options.is_blocking() { &self.state.blocking } else { &self.state.one_shot };
        *counters.entry(query.clone()).or_insert(0) += 1;

        let Some(wait_index) = options.wait_index else {
            return self.snapshot(&query);
        };

        let deadline = options.wait_time.map(|wait| tokio::time::Instant::now() + wait);
        loop {
            // Register interest before inspecting state so no change is missed.
            let notified = self.state.changed.notified();

            let response = self.snapshot(&query)?;
            if response.meta.last_index != wait_index {
                return Ok(response);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(response);
                    }
                }
                None => notified.await,
            }
        }
    }
}

impl Catalog for MemoryCatalog {
    fn fetch(&self, query: Query, options: QueryOptions) -> Fetching {
        let catalog = self.clone();
        Box::pin(async move { catalog.fetch_inner(query, options).await })
    }
}

impl std::fmt::Debug for MemoryCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCatalog")
            .field("services", &self.state.entries.len())
            .field("index", &self.index())
            .finish_non_exhaustive()
    }
}
