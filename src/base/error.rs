use http::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a [`Catalog`](crate::catalog::Catalog) implementation.
#[derive(Debug, Error, Clone)]
pub enum CatalogError {
    #[error("invalid query for service {service:?}: {reason}")]
    InvalidQuery { service: String, reason: &'static str },
    #[error("invalid catalog endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("connection to catalog at {addr} failed")]
    Connect {
        addr: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("catalog TLS setup failed: {0}")]
    Tls(String),
    #[error("catalog request failed: {0}")]
    Http(String),
    #[error("catalog returned {status} for {path}")]
    Status { status: StatusCode, path: String },
    #[error("malformed catalog response: {0}")]
    Decode(String),
    #[error("catalog request timed out")]
    Timeout,
}

impl CatalogError {
    pub fn connect_failed(addr: impl Into<String>, error: std::io::Error) -> Self {
        CatalogError::Connect { addr: addr.into(), source: Arc::new(error) }
    }

    /// Whether a blocking query that failed with this error is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            CatalogError::Connect { .. }
            | CatalogError::Http(_)
            | CatalogError::Timeout
            | CatalogError::Decode(_) => true,
            CatalogError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            CatalogError::InvalidQuery { .. }
            | CatalogError::InvalidEndpoint(_)
            | CatalogError::Tls(_) => false,
        }
    }
}

/// Errors surfaced to callers of the resolver.
#[derive(Debug, Error, Clone)]
pub enum ResolveError {
    /// The catalog could not be reached or answered with an error.
    #[error("upstream catalog error while resolving {service}: {source}")]
    Upstream {
        service: String,
        #[source]
        source: CatalogError,
    },
    /// The service is known but has no eligible instance right now.
    #[error("no candidate available for {service}")]
    NoCandidate { service: String },
    #[error("invalid function name {service:?}: {reason}")]
    InvalidQuery { service: String, reason: &'static str },
    #[error("resolving {service} timed out after {after:?}")]
    Timeout { service: String, after: Duration },
    #[error("resolver is closed")]
    Closed,
}

impl ResolveError {
    pub fn upstream(service: impl Into<String>, source: CatalogError) -> Self {
        match source {
            CatalogError::InvalidQuery { service, reason } => {
                ResolveError::InvalidQuery { service, reason }
            }
            source => ResolveError::Upstream { service: service.into(), source },
        }
    }

    pub fn is_no_candidate(&self) -> bool {
        matches!(self, ResolveError::NoCandidate { .. })
    }

    /// Status the routing layer should answer an invocation with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ResolveError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ResolveError::NoCandidate { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ResolveError::InvalidQuery { .. } => StatusCode::BAD_REQUEST,
            ResolveError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ResolveError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Peer certificate did not prove the expected service identity.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("peer certificate carries no URI subject alternative name")]
    NoUriSan,
    #[error("peer identity mismatch: expected {expected}, presented {presented:?}")]
    Mismatch { expected: String, presented: Vec<String> },
}
