use crate::base::context::IoResultExt;
use crate::base::error::CatalogError;
use crate::config::ConsulConfig;
use boring::ssl::{SslConnector, SslFiletype, SslMethod, SslVerifyMode, SslVersion};
use std::path::Path;
use tokio::net::TcpStream;
use tokio_boring::SslStream;

/// TLS settings for talking to the catalog agent.
///
/// Built once from [`ConsulConfig`]; every request clones the connector,
/// which only bumps a reference count.
#[derive(Clone)]
pub struct CatalogTls {
    connector: SslConnector,
    skip_verify: bool,
}

impl CatalogTls {
    /// Build the connector from the CA bundle, client certificate and key
    /// named in `config`.
    pub fn from_config(config: &ConsulConfig) -> Result<Self, CatalogError> {
        let tls_err = |e: boring::error::ErrorStack| CatalogError::Tls(e.to_string());

        let mut builder = SslConnector::builder(SslMethod::tls()).map_err(tls_err)?;
        builder.set_min_proto_version(Some(SslVersion::TLS1_2)).map_err(tls_err)?;
        builder.set_alpn_protos(b"\x08http/1.1").map_err(tls_err)?;

        if let Some(ca) = &config.ca_cert {
            ensure_readable(ca, "CA certificate")?;
            builder.set_ca_file(ca).map_err(tls_err)?;
        }

        match (&config.client_cert, &config.client_key) {
            (Some(cert), Some(key)) => {
                ensure_readable(cert, "client certificate")?;
                ensure_readable(key, "client key")?;
                builder.set_certificate_chain_file(cert).map_err(tls_err)?;
                builder.set_private_key_file(key, SslFiletype::PEM).map_err(tls_err)?;
                builder.check_private_key().map_err(tls_err)?;
            }
            (None, None) => {}
            _ => {
                return Err(CatalogError::Tls(
                    "client certificate and key must be configured together".into(),
                ))
            }
        }

        if config.tls_skip_verify {
            tracing::warn!("catalog TLS certificate verification is disabled");
            builder.set_verify(SslVerifyMode::NONE);
        } else {
            builder.set_verify(SslVerifyMode::PEER);
        }

        Ok(Self { connector: builder.build(), skip_verify: config.tls_skip_verify })
    }

    /// Run the TLS handshake over an established TCP stream.
    pub(crate) async fn connect(
        &self,
        host: &str,
        stream: TcpStream,
    ) -> Result<SslStream<TcpStream>, CatalogError> {
        let mut config = self
            .connector
            .configure()
            .map_err(|e| CatalogError::Tls(e.to_string()))?;

        // Per RFC 6066, SNI MUST NOT be set for raw IP addresses.
        config.set_use_server_name_indication(should_set_sni(host));
        if self.skip_verify {
            config.set_verify_hostname(false);
        }

        tokio_boring::connect(config, host, stream).await.map_err(|e| {
            tracing::debug!(host = %host, error = %e, "catalog TLS handshake failed");
            CatalogError::Tls(format!("handshake with {host} failed: {e}"))
        })
    }
}

impl std::fmt::Debug for CatalogTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogTls")
            .field("skip_verify", &self.skip_verify)
            .finish_non_exhaustive()
    }
}

fn ensure_readable(path: &Path, what: &str) -> Result<(), CatalogError> {
    std::fs::metadata(path)
        .tls_context(&format!("{what} {}", path.display()))
        .map(|_| ())
}

fn should_set_sni(host: &str) -> bool {
    host.parse::<std::net::IpAddr>().is_err()
}
