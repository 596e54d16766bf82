//! Resolution cache.
//!
//! Maps a query key to the last applied [`ServiceItem`]. Entries are only
//! ever replaced whole, so a reader holding an `Arc<ServiceItem>` always sees
//! one complete catalog snapshot. Every subscription generation owns its own
//! cache; a reset replaces the cache instead of emptying it, so writers still
//! holding the old one can never reach the new one.

use crate::catalog::{HealthService, Query};
use dashmap::DashMap;
use std::sync::Arc;

/// Instances with at most this many health check entries are skipped.
///
/// The catalog reports the node-level check alongside the service's own, so
/// a registered service with a working check carries at least two entries.
pub const MIN_CHECKS_EXCLUSIVE: usize = 1;

/// Last known eligible addresses for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceItem {
    query: Query,
    addresses: Vec<String>,
    index: u64,
}

impl ServiceItem {
    /// Build an item from a catalog snapshot, keeping eligible instances in
    /// catalog order.
    pub fn from_instances(query: Query, instances: &[HealthService], index: u64) -> Self {
        Self { query, addresses: eligible_addresses(instances), index }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Catalog index the item was built from.
    pub fn index(&self) -> u64 {
        self.index
    }
}

/// `host:port` of every instance reporting more than one health check.
pub fn eligible_addresses(instances: &[HealthService]) -> Vec<String> {
    instances
        .iter()
        .filter(|s| s.checks.len() > MIN_CHECKS_EXCLUSIVE)
        .map(HealthService::host_port)
        .collect()
}

/// Thread-safe cache of resolved services. Clones share state.
#[derive(Clone, Default)]
pub struct ResolutionCache {
    entries: Arc<DashMap<String, Arc<ServiceItem>>>,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, query: &Query) -> Option<Arc<ServiceItem>> {
        self.entries.get(&query.key()).map(|e| Arc::clone(e.value()))
    }

    /// Build an item from a catalog snapshot and store it, replacing any
    /// previous item for the query. Used by both the one-shot fetch and the
    /// watch loop.
    pub fn apply(&self, query: &Query, instances: &[HealthService], index: u64) -> Arc<ServiceItem> {
        let item = Arc::new(ServiceItem::from_instances(query.clone(), instances, index));
        self.entries.insert(query.key(), Arc::clone(&item));
        tracing::trace!(
            query = %query,
            index,
            eligible = item.addresses.len(),
            total = instances.len(),
            "applied catalog snapshot"
        );
        item
    }

    /// Drop every entry. Clones observe the removal.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ResolutionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionCache").field("entries", &self.len()).finish()
    }
}
