//! Ergonomic error context helpers.
//!
//! Extension traits that attach the service being resolved to catalog and
//! IO failures.

use crate::base::error::{CatalogError, ResolveError};
use std::io;

/// Extension trait for turning catalog results into resolver results.
pub trait CatalogResultExt<T> {
    /// Attach the normalized service name to a catalog failure.
    ///
    /// # Example
    /// ```ignore
    /// use faasresolve::base::context::CatalogResultExt;
    ///
    /// let response = catalog.fetch(query, options).await
    ///     .upstream_context("svc-echo")?;
    /// // Error: "upstream catalog error while resolving svc-echo: ..."
    /// ```
    fn upstream_context(self, service: &str) -> Result<T, ResolveError>;
}

impl<T> CatalogResultExt<T> for Result<T, CatalogError> {
    fn upstream_context(self, service: &str) -> Result<T, ResolveError> {
        self.map_err(|e| ResolveError::upstream(service, e))
    }
}

/// Extension trait for adding catalog context to IO Results.
pub trait IoResultExt<T> {
    /// Add connection context to an IO error.
    fn connect_context(self, addr: &str) -> Result<T, CatalogError>;

    /// Add TLS material context (certificate or key file) to an IO error.
    fn tls_context(self, what: &str) -> Result<T, CatalogError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn connect_context(self, addr: &str) -> Result<T, CatalogError> {
        self.map_err(|e| CatalogError::connect_failed(addr, e))
    }

    fn tls_context(self, what: &str) -> Result<T, CatalogError> {
        self.map_err(|e| CatalogError::Tls(format!("{what}: {e}")))
    }
}
