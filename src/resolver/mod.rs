//! Function name resolution.
//!
//! [`CatalogResolver`] turns a function name into the addresses of its
//! healthy instances plus the [`Identity`] its peers must prove.
//!
//! # Architecture
//!
//! - A [`ResolutionCache`] answers repeat lookups without touching the
//!   catalog. A miss performs one catalog read, stores the result and
//!   subscribes the query.
//! - A subscription *generation* owns a cache, a [`Watcher`] and a watch
//!   loop task that applies every pushed update to that cache. An entry is
//!   cached only in the generation that subscribed its query.
//! - A reset loop replaces the whole generation every `reset_interval`, so
//!   services resolved once and never again stop being watched.
//!
//! # Example
//!
//! ```rust,ignore
//! use faasresolve::catalog::ConsulCatalog;
//! use faasresolve::config::{ProviderConfig, ResolverOptions};
//! use faasresolve::resolver::{CatalogResolver, ServiceResolver};
//! use std::sync::Arc;
//!
//! let config = ProviderConfig::from_json_file("provider.json")?.apply_env();
//! let resolver = CatalogResolver::from_config(&config)?;
//! let endpoint = resolver.resolve("echo.openfaas-fn").await?;
//! println!("forwarding to {} as {}", endpoint.address, endpoint.identity);
//! ```

mod cache;
mod identity;
pub mod selector;

pub use cache::{eligible_addresses, ResolutionCache, ServiceItem, MIN_CHECKS_EXCLUSIVE};
pub use identity::{Identity, DEFAULT_DATACENTER};

use crate::base::context::CatalogResultExt;
use crate::base::error::{CatalogError, ResolveError};
use crate::catalog::{
    Catalog, CatalogResponse, ConsulCatalog, Query, QueryKind, QueryOptions, Subscription,
    WatchUpdate, Watcher, WatcherOptions,
};
use crate::config::{ProviderConfig, ResolverOptions};
use arc_swap::ArcSwap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One selected address and the identity it must present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub identity: Identity,
}

/// All eligible addresses, in catalog order, and the expected identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub addresses: Vec<String>,
    pub identity: Identity,
}

/// Alias for the `Future` type returned by a resolver.
pub type Resolving<T> = Pin<Box<dyn Future<Output = Result<T, ResolveError>> + Send>>;

/// Resolution contract consumed by the routing layer.
pub trait ServiceResolver: Send + Sync {
    /// Resolve to one address chosen among the eligible instances.
    fn resolve(&self, function: &str) -> Resolving<Endpoint>;

    /// Resolve to every eligible address.
    fn resolve_all(&self, function: &str) -> Resolving<Endpoints>;
}

impl<R: ServiceResolver + ?Sized> ServiceResolver for Arc<R> {
    fn resolve(&self, function: &str) -> Resolving<Endpoint> {
        (**self).resolve(function)
    }

    fn resolve_all(&self, function: &str) -> Resolving<Endpoints> {
        (**self).resolve_all(function)
    }
}

/// A watcher, the cache its watch loop writes to, and that loop.
struct Generation {
    id: u64,
    cache: ResolutionCache,
    watcher: Watcher,
}

impl Generation {
    fn start(
        id: u64,
        catalog: &Arc<dyn Catalog>,
        options: &ResolverOptions,
        shutdown: &CancellationToken,
    ) -> Self {
        let cancel = shutdown.child_token();
        let watcher_options = WatcherOptions {
            wait_time: options.wait_time,
            min_poll_interval: options.min_poll_interval,
            max_stale: options.max_stale,
            backoff: options.backoff.clone(),
            capacity: options.update_capacity,
        };
        let (watcher, updates) = Watcher::new(Arc::clone(catalog), watcher_options, cancel.clone());

        let cache = ResolutionCache::new();
        tokio::spawn(run_watch_loop(cache.clone(), updates, cancel, id));
        Self { id, cache, watcher }
    }
}

struct Inner {
    catalog: Arc<dyn Catalog>,
    options: ResolverOptions,
    generation: ArcSwap<Generation>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl Inner {
    fn reset(&self) {
        let id = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let next = Arc::new(Generation::start(id, &self.catalog, &self.options, &self.shutdown));

        // Cache and watcher are published together; the retired watch loop
        // keeps writing into the retired cache only.
        let previous = self.generation.swap(next);
        let dropped = previous.watcher.len();
        previous.watcher.stop();
        previous.cache.clear();

        tracing::info!(
            generation = id,
            previous = previous.id,
            dropped_subscriptions = dropped,
            "resolver state reset"
        );
    }

    /// Cache a one-shot read and subscribe its query in the same generation.
    ///
    /// `generation` is the one that was current when the read started. When
    /// a reset retired it in the meantime, the result moves to the current
    /// generation.
    fn store(
        &self,
        mut generation: Arc<Generation>,
        query: &Query,
        response: &CatalogResponse,
    ) -> Arc<ServiceItem> {
        let index = response.meta.last_index;
        loop {
            let item = generation.cache.apply(query, &response.instances, index);
            match generation.watcher.add(query.clone(), index) {
                Subscription::Added | Subscription::AlreadyWatching => return item,
                Subscription::Stopped => {
                    let current = self.generation.load_full();
                    if self.shutdown.is_cancelled() || Arc::ptr_eq(&current, &generation) {
                        return item;
                    }
                    tracing::debug!(
                        query = %query,
                        retired = generation.id,
                        current = current.id,
                        "generation reset during fetch, moving result"
                    );
                    generation = current;
                }
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Resolver backed by a [`Catalog`], with a watched cache and periodic reset.
///
/// Cheap to clone; clones share state. Construction spawns the watch loop and
/// the reset loop, so it must happen inside a tokio runtime. Both loops stop
/// on [`CatalogResolver::close`] or when the last clone is dropped.
#[derive(Clone)]
pub struct CatalogResolver {
    inner: Arc<Inner>,
}

impl CatalogResolver {
    pub fn new(catalog: Arc<dyn Catalog>, options: ResolverOptions) -> Self {
        let shutdown = CancellationToken::new();
        let first = Generation::start(0, &catalog, &options, &shutdown);

        let inner = Arc::new(Inner {
            catalog,
            options,
            generation: ArcSwap::from_pointee(first),
            next_generation: AtomicU64::new(0),
            shutdown: shutdown.clone(),
        });

        spawn_reset_loop(Arc::downgrade(&inner), inner.options.reset_interval, shutdown);

        tracing::info!(
            prefix = %inner.options.prefix,
            namespace = %inner.options.namespace,
            connect_aware = inner.options.connect_aware,
            reset_interval = ?inner.options.reset_interval,
            "resolver started"
        );

        Self { inner }
    }

    /// Build a resolver talking to the Consul agent named in `config`.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ResolveError> {
        let catalog = ConsulCatalog::new(&config.consul).map_err(|source| ResolveError::Upstream {
            service: config.consul.addr.clone(),
            source,
        })?;
        Ok(Self::new(Arc::new(catalog), ResolverOptions::from_config(config)))
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.inner.options
    }

    /// Catalog service name for `function`.
    pub fn service_name(&self, function: &str) -> String {
        self.inner.options.service_name(function)
    }

    /// Identity a peer serving `function` must prove.
    pub fn identity(&self, function: &str) -> Identity {
        Identity::new(&self.inner.options.namespace, self.service_name(function))
    }

    fn query_for(&self, service: &str) -> Result<Query, CatalogError> {
        let kind = if self.inner.options.connect_aware { QueryKind::Connect } else { QueryKind::Service };
        Query::new(kind, service)
    }

    /// Resolve `function` to every eligible address.
    pub async fn resolve_all(&self, function: &str) -> Result<Endpoints, ResolveError> {
        if self.is_closed() {
            return Err(ResolveError::Closed);
        }

        let service = self.service_name(function);
        let query = self.query_for(&service).upstream_context(&service)?;
        let identity = Identity::new(&self.inner.options.namespace, service.as_str());

        let generation = self.inner.generation.load_full();
        if let Some(item) = generation.cache.get(&query) {
            tracing::trace!(service = %service, index = item.index(), "resolution cache hit");
            return Ok(Endpoints { addresses: item.addresses().to_vec(), identity });
        }

        tracing::debug!(service = %service, query = %query, "resolution cache miss");
        let fetch = self.inner.catalog.fetch(query.clone(), QueryOptions::default());
        let response = match self.inner.options.fetch_timeout {
            Some(after) => tokio::time::timeout(after, fetch)
                .await
                .map_err(|_| ResolveError::Timeout { service: service.clone(), after })?,
            None => fetch.await,
        }
        .upstream_context(&service)?;

        let item = self.inner.store(generation, &query, &response);

        tracing::debug!(
            service = %service,
            index = item.index(),
            addresses = item.addresses().len(),
            "resolved from catalog"
        );
        Ok(Endpoints { addresses: item.addresses().to_vec(), identity })
    }

    /// Resolve `function` to one eligible address chosen at random.
    pub async fn resolve(&self, function: &str) -> Result<Endpoint, ResolveError> {
        let Endpoints { addresses, identity } = self.resolve_all(function).await?;
        match selector::pick(&addresses) {
            Some(address) => Ok(Endpoint { address: address.to_string(), identity }),
            None => Err(ResolveError::NoCandidate { service: identity.service().to_string() }),
        }
    }

    /// Drop every cached entry and subscription and start a new generation.
    pub fn reset(&self) {
        if self.is_closed() {
            return;
        }
        self.inner.reset();
    }

    /// Stop the watch and reset loops. Later resolutions fail with
    /// [`ResolveError::Closed`].
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.inner.shutdown.cancel();
        let current = self.inner.generation.load();
        current.watcher.stop();
        current.cache.clear();
        tracing::info!("resolver closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Number of services currently cached.
    pub fn cached_services(&self) -> usize {
        self.inner.generation.load().cache.len()
    }

    /// Number of live subscriptions in the current generation.
    pub fn subscriptions(&self) -> usize {
        self.inner.generation.load().watcher.len()
    }

    /// Id of the current generation; bumped by every reset.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load().id
    }
}

impl ServiceResolver for CatalogResolver {
    fn resolve(&self, function: &str) -> Resolving<Endpoint> {
        let resolver = self.clone();
        let function = function.to_string();
        Box::pin(async move { resolver.resolve(&function).await })
    }

    fn resolve_all(&self, function: &str) -> Resolving<Endpoints> {
        let resolver = self.clone();
        let function = function.to_string();
        Box::pin(async move { resolver.resolve_all(&function).await })
    }
}

impl std::fmt::Debug for CatalogResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogResolver")
            .field("generation", &self.generation())
            .field("cached_services", &self.cached_services())
            .field("subscriptions", &self.subscriptions())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn run_watch_loop(
    cache: ResolutionCache,
    mut updates: mpsc::Receiver<WatchUpdate>,
    cancel: CancellationToken,
    generation: u64,
) {
    tracing::debug!(generation, "watch loop started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            update = updates.recv() => match update {
                Some(update) => {
                    let item = cache.apply(&update.query, &update.instances, update.index);
                    tracing::debug!(
                        generation,
                        query = %update.query,
                        index = update.index,
                        addresses = item.addresses().len(),
                        "catalog update applied"
                    );
                }
                None => break,
            },
        }
    }
    tracing::debug!(generation, "watch loop stopped");
}

fn spawn_reset_loop(inner: Weak<Inner>, period: Duration, shutdown: CancellationToken) {
    // A zero interval disables periodic resets.
    if period.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.reset();
                }
            }
        }
        tracing::debug!("reset loop stopped");
    });
}
