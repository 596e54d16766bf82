//! Service catalog abstraction.
//!
//! A [`Catalog`] answers "which healthy instances back service S". A fetch
//! without a wait index is a one-shot read; with a wait index it is a
//! blocking query that returns once the catalog has moved past that index
//! or the wait time elapsed. The [`Watcher`] builds continuous subscriptions
//! on top of blocking queries.
//!
//! Implementations:
//! - [`ConsulCatalog`]: Consul health endpoints over HTTP(S)
//! - [`MemoryCatalog`]: in-process catalog for tests and local runs

pub mod backoff;
mod consul;
mod memory;
mod tls;
pub mod watch;

pub use consul::ConsulCatalog;
pub use memory::MemoryCatalog;
pub use tls::CatalogTls;
pub use watch::{Subscription, WatchUpdate, Watcher, WatcherOptions};

use crate::base::error::CatalogError;
use serde::Deserialize;
use std::{fmt, future::Future, pin::Pin, sync::Arc, time::Duration};

/// Which health endpoint a [`Query`] targets.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum QueryKind {
    /// Plain health query for the service's own instances.
    Service,
    /// Service-mesh aware query returning the service's connect-capable proxies.
    Connect,
}

impl QueryKind {
    fn label(self) -> &'static str {
        match self {
            QueryKind::Service => "health.service",
            QueryKind::Connect => "health.connect",
        }
    }
}

/// Request for the healthy instances of one service.
///
/// Two queries are equal iff their string forms are equal; the string form
/// doubles as the resolution cache key.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Query {
    kind: QueryKind,
    service: Box<str>,
}

impl Query {
    /// Builds a query, rejecting names no catalog endpoint could serve.
    pub fn new(kind: QueryKind, service: impl Into<Box<str>>) -> Result<Self, CatalogError> {
        let service = service.into();
        let invalid = |reason| CatalogError::InvalidQuery { service: service.to_string(), reason };

        if service.is_empty() {
            return Err(invalid("empty service name"));
        }
        if service.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }
        if service.contains(['/', '?', '#', '|']) {
            return Err(invalid("contains a reserved character"));
        }

        Ok(Self { kind, service })
    }

    pub fn health_service(service: impl Into<Box<str>>) -> Result<Self, CatalogError> {
        Self::new(QueryKind::Service, service)
    }

    pub fn health_connect(service: impl Into<Box<str>>) -> Result<Self, CatalogError> {
        Self::new(QueryKind::Connect, service)
    }

    #[inline]
    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Cache and subscription key.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind.label(), self.service)
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Aggregated status of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passing,
    Warning,
    Critical,
    #[serde(other)]
    Unknown,
}

/// One health check attached to an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub check_id: String,
    pub name: String,
    pub status: CheckStatus,
    pub service_id: String,
}

impl HealthCheck {
    pub fn new(check_id: impl Into<String>, status: CheckStatus) -> Self {
        let check_id = check_id.into();
        Self { name: check_id.clone(), check_id, status, service_id: String::new() }
    }

    pub fn passing(check_id: impl Into<String>) -> Self {
        Self::new(check_id, CheckStatus::Passing)
    }

    pub fn is_passing(&self) -> bool {
        self.status == CheckStatus::Passing
    }
}

/// A catalog instance together with its health checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthService {
    pub node: String,
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub checks: Vec<HealthCheck>,
}

impl HealthService {
    /// Instance at `address:port` with no checks attached.
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        let name = name.into();
        let address = address.into();
        Self {
            node: String::new(),
            id: format!("{name}-{address}-{port}"),
            name,
            address,
            port,
            tags: Vec::new(),
            checks: Vec::new(),
        }
    }

    pub fn with_check(mut self, check: HealthCheck) -> Self {
        self.checks.push(check);
        self
    }

    /// Whether every attached check passes. This is the filter Consul
    /// applies for `?passing` reads.
    pub fn is_passing(&self) -> bool {
        self.checks.iter().all(HealthCheck::is_passing)
    }

    /// Routable `host:port` form. IPv6 literals are bracketed.
    pub fn host_port(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// Knobs of a single catalog read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Block until the catalog index exceeds this value.
    pub wait_index: Option<u64>,
    /// Upper bound on how long a blocking query may hang.
    pub wait_time: Option<Duration>,
    /// Accept answers from non-leader servers up to this staleness.
    pub max_stale: Option<Duration>,
}

impl QueryOptions {
    pub fn blocking(index: u64, wait_time: Duration) -> Self {
        Self { wait_index: Some(index), wait_time: Some(wait_time), max_stale: None }
    }

    pub fn with_max_stale(mut self, max_stale: Option<Duration>) -> Self {
        self.max_stale = max_stale;
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.wait_index.is_some()
    }
}

/// Response metadata of a catalog read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryMeta {
    pub last_index: u64,
    pub last_contact: Duration,
    pub known_leader: bool,
}

/// Instances plus metadata returned by [`Catalog::fetch`].
#[derive(Debug, Clone, Default)]
pub struct CatalogResponse {
    pub instances: Vec<HealthService>,
    pub meta: QueryMeta,
}

/// Alias for the `Future` type returned by a catalog read.
pub type Fetching = Pin<Box<dyn Future<Output = Result<CatalogResponse, CatalogError>> + Send>>;

/// Source of truth for service instance health and location.
///
/// Implementations must be thread-safe and cheap to call concurrently; the
/// resolver issues one-shot reads from request paths while the watcher keeps
/// one blocking query in flight per subscribed service.
pub trait Catalog: Send + Sync {
    fn fetch(&self, query: Query, options: QueryOptions) -> Fetching;
}

impl<C: Catalog + ?Sized> Catalog for Arc<C> {
    fn fetch(&self, query: Query, options: QueryOptions) -> Fetching {
        (**self).fetch(query, options)
    }
}
