//! Expected service identity for mutual-TLS peer validation.
//!
//! The identity carries no key material. It names the service a peer's
//! certificate must prove, using the SPIFFE URI layout of the service mesh:
//! `spiffe://<trust-domain>/ns/<namespace>/dc/<datacenter>/svc/<service>`.
//! Trust in the chain itself comes from x509 verification elsewhere, so the
//! trust domain is left empty here and ignored when matching.

use crate::base::error::IdentityError;
use boring::x509::X509Ref;
use std::fmt;
use url::Url;

/// Placeholder datacenter; the resolver does not know the real topology.
pub const DEFAULT_DATACENTER: &str = "dc1";

const SPIFFE_SCHEME: &str = "spiffe";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    namespace: String,
    datacenter: String,
    service: String,
}

impl Identity {
    pub fn new(namespace: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            datacenter: DEFAULT_DATACENTER.to_string(),
            service: service.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// URI path shared by every trust domain.
    fn path(&self) -> String {
        format!("/ns/{}/dc/{}/svc/{}", self.namespace, self.datacenter, self.service)
    }

    /// SPIFFE URI with an empty trust domain.
    pub fn to_uri(&self) -> String {
        format!("{SPIFFE_SCHEME}://{}", self.path())
    }

    /// Whether `uri` names this identity under any trust domain.
    pub fn matches_uri(&self, uri: &str) -> bool {
        match Url::parse(uri) {
            Ok(url) => url.scheme() == SPIFFE_SCHEME && url.path() == self.path(),
            Err(_) => false,
        }
    }

    /// Check the URI subject alternative names of a peer certificate.
    pub fn verify_peer(&self, cert: &X509Ref) -> Result<(), IdentityError> {
        let presented: Vec<String> = cert
            .subject_alt_names()
            .map(|names| names.iter().filter_map(|n| n.uri().map(str::to_string)).collect())
            .unwrap_or_default();

        if presented.is_empty() {
            return Err(IdentityError::NoUriSan);
        }
        if presented.iter().any(|uri| self.matches_uri(uri)) {
            return Ok(());
        }

        tracing::debug!(expected = %self, presented = ?presented, "peer identity mismatch");
        Err(IdentityError::Mismatch { expected: self.to_uri(), presented })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}
