//! # faasresolve
//!
//! Function-name resolution for a FaaS provider scheduling onto a
//! Consul-style service catalog.
//!
//! Given a function name such as `echo.openfaas-fn`, the resolver finds the
//! catalog service backing it, returns the address of one healthy instance
//! and the service-mesh identity that instance must present.
//!
//! ## Features
//!
//! - **Lazy cache**: the first lookup of a service reads the catalog once,
//!   later lookups are served from memory
//! - **Watches**: every resolved service is followed through blocking
//!   queries, so the cache tracks catalog changes as they happen
//! - **Periodic reset**: cache and subscriptions are dropped on a fixed
//!   interval, bounding the set of watched services
//! - **Identity**: SPIFFE-style expected identity with peer certificate checks
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use faasresolve::config::ProviderConfig;
//! use faasresolve::resolver::CatalogResolver;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ProviderConfig::default().apply_env();
//!     let resolver = CatalogResolver::from_config(&config).unwrap();
//!     let endpoint = resolver.resolve("echo.openfaas-fn").await.unwrap();
//!     println!("{} ({})", endpoint.address, endpoint.identity);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error types and context helpers
//! - [`catalog`] - Catalog trait, Consul client, in-memory catalog, watcher
//! - [`config`] - Provider configuration and resolver options
//! - [`resolver`] - Cache, selector, identity and the resolver itself

pub mod base;
pub mod catalog;
pub mod config;
pub mod resolver;

pub use base::error::{CatalogError, IdentityError, ResolveError};
pub use resolver::{CatalogResolver, Endpoint, Endpoints, Identity, ServiceResolver};
