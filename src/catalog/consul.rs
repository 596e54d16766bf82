//! Consul health endpoints over HTTP/1.1.
//!
//! Each read opens a fresh connection (TCP, then TLS when the endpoint is
//! `https`), performs one GET against `/v1/health/service/<svc>` or
//! `/v1/health/connect/<svc>`, and decodes the JSON body. Blocking queries
//! use Consul's `index`/`wait` parameters; `X-Consul-Index` on the response
//! becomes [`QueryMeta::last_index`].

use super::{
    CatalogResponse, CheckStatus, Fetching, HealthCheck, HealthService, Query, QueryKind,
    QueryMeta, QueryOptions,
};
use super::{Catalog, CatalogTls};
use crate::base::context::IoResultExt;
use crate::base::error::CatalogError;
use crate::config::ConsulConfig;
use bytes::Bytes;
use http::header::{ACCEPT, HOST};
use http::{HeaderMap, Method, Request, Response};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use url::Url;
use zeroize::Zeroizing;

const INDEX_HEADER: &str = "x-consul-index";
const LAST_CONTACT_HEADER: &str = "x-consul-lastcontact";
const KNOWN_LEADER_HEADER: &str = "x-consul-knownleader";
const TOKEN_HEADER: &str = "x-consul-token";

/// Headroom on top of the blocking wait before a request is abandoned.
const REQUEST_GRACE: Duration = Duration::from_secs(30);

/// Catalog backed by a Consul agent.
#[derive(Clone)]
pub struct ConsulCatalog {
    base: Url,
    token: Option<Arc<Zeroizing<String>>>,
    tls: Option<CatalogTls>,
}

impl ConsulCatalog {
    /// Validate the endpoint and prepare TLS material.
    pub fn new(config: &ConsulConfig) -> Result<Self, CatalogError> {
        let base = Url::parse(&config.addr)
            .map_err(|e| CatalogError::InvalidEndpoint(format!("{}: {e}", config.addr)))?;

        if !matches!(base.scheme(), "http" | "https") {
            return Err(CatalogError::InvalidEndpoint(format!(
                "{}: unsupported scheme {}",
                config.addr,
                base.scheme()
            )));
        }
        if base.host_str().is_none() {
            return Err(CatalogError::InvalidEndpoint(format!("{}: missing host", config.addr)));
        }

        let tls = if config.tls_enabled() { Some(CatalogTls::from_config(config)?) } else { None };
        let token = config
            .acl_token
            .as_ref()
            .filter(|t| !t.is_empty())
            .map(|t| Arc::new(Zeroizing::new(t.clone())));

        tracing::debug!(endpoint = %base, tls = tls.is_some(), "catalog client configured");
        Ok(Self { base, token, tls })
    }

    pub fn endpoint(&self) -> &Url {
        &self.base
    }

    fn request_url(&self, query: &Query, options: &QueryOptions, stale: bool) -> Url {
        let segment = match query.kind() {
            QueryKind::Service => "service",
            QueryKind::Connect => "connect",
        };

        let mut url = self.base.clone();
        url.set_path(&format!("/v1/health/{segment}/{}", query.service()));
        {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            pairs.append_key_only("passing");
            if stale {
                pairs.append_key_only("stale");
            }
            if let Some(index) = options.wait_index {
                pairs.append_pair("index", &index.to_string());
                if let Some(wait) = options.wait_time {
                    pairs.append_pair("wait", &format!("{}ms", wait.as_millis()));
                }
            }
        }
        url
    }

    async fn fetch_inner(
        &self,
        query: Query,
        options: QueryOptions,
    ) -> Result<CatalogResponse, CatalogError> {
        let timeout = options.wait_time.unwrap_or_default() + REQUEST_GRACE;

        let url = self.request_url(&query, &options, options.max_stale.is_some());
        let response = self.get(&url, timeout).await?;

        if let Some(max_stale) = options.max_stale {
            let meta = response.meta;
            if meta.last_contact > max_stale || !meta.known_leader {
                tracing::warn!(
                    query = %query,
                    last_contact = ?meta.last_contact,
                    known_leader = meta.known_leader,
                    max_stale = ?max_stale,
                    "stale catalog answer not trusted, repeating consistently"
                );
                let url = self.request_url(&query, &options, false);
                return self.get(&url, timeout).await;
            }
        }

        Ok(response)
    }

    async fn get(&self, url: &Url, timeout: Duration) -> Result<CatalogResponse, CatalogError> {
        tokio::time::timeout(timeout, self.get_once(url))
            .await
            .map_err(|_| CatalogError::Timeout)?
    }

    async fn get_once(&self, url: &Url) -> Result<CatalogResponse, CatalogError> {
        let host = url
            .host_str()
            .ok_or_else(|| CatalogError::InvalidEndpoint(url.to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| CatalogError::InvalidEndpoint(url.to_string()))?;
        let authority = format!("{host}:{port}");

        let stream = TcpStream::connect(&authority).await.connect_context(&authority)?;
        let _ = stream.set_nodelay(true);

        let path_and_query = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };

        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(path_and_query)
            .header(HOST, authority.as_str())
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.token {
            builder = builder.header(TOKEN_HEADER, token.as_str());
        }
        let request = builder
            .body(Empty::<Bytes>::new())
            .map_err(|e| CatalogError::Http(e.to_string()))?;

        tracing::trace!(url = %url, "catalog request");
        let response = match &self.tls {
            Some(tls) => {
                let sni_host = host.trim_start_matches('[').trim_end_matches(']');
                send(tls.connect(sni_host, stream).await?, request).await?
            }
            None => send(stream, request).await?,
        };

        decode(url.path(), response).await
    }
}

impl Catalog for ConsulCatalog {
    fn fetch(&self, query: Query, options: QueryOptions) -> Fetching {
        let catalog = self.clone();
        Box::pin(async move { catalog.fetch_inner(query, options).await })
    }
}

impl std::fmt::Debug for ConsulCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsulCatalog")
            .field("endpoint", &self.base.as_str())
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls)
            .finish()
    }
}

async fn send<IO>(io: IO, request: Request<Empty<Bytes>>) -> Result<Response<Incoming>, CatalogError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| CatalogError::Http(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "catalog connection closed with error");
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| CatalogError::Http(e.to_string()))
}

async fn decode(path: &str, response: Response<Incoming>) -> Result<CatalogResponse, CatalogError> {
    let status = response.status();
    let meta = meta_from_headers(response.headers());

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| CatalogError::Http(e.to_string()))?
        .to_bytes();

    if !status.is_success() {
        tracing::debug!(
            path = %path,
            status = %status,
            body = %String::from_utf8_lossy(&body),
            "catalog request rejected"
        );
        return Err(CatalogError::Status { status, path: path.to_string() });
    }

    let entries: Vec<RawEntry> =
        serde_json::from_slice(&body).map_err(|e| CatalogError::Decode(e.to_string()))?;

    Ok(CatalogResponse {
        instances: entries.into_iter().map(HealthService::from).collect(),
        meta,
    })
}

fn meta_from_headers(headers: &HeaderMap) -> QueryMeta {
    let parse_u64 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };

    QueryMeta {
        last_index: parse_u64(INDEX_HEADER).unwrap_or(0),
        last_contact: Duration::from_millis(parse_u64(LAST_CONTACT_HEADER).unwrap_or(0)),
        known_leader: headers
            .get(KNOWN_LEADER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawEntry {
    node: RawNode,
    service: RawService,
    #[serde(default)]
    checks: Option<Vec<RawCheck>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawNode {
    #[serde(default)]
    node: String,
    #[serde(default)]
    address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawService {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(default)]
    service: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: u16,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawCheck {
    #[serde(rename = "CheckID", default)]
    check_id: String,
    #[serde(default)]
    name: String,
    status: CheckStatus,
    #[serde(rename = "ServiceID", default)]
    service_id: String,
}

impl From<RawEntry> for HealthService {
    fn from(raw: RawEntry) -> Self {
        // Service address wins; agents leave it empty when it equals the node's.
        let address = if raw.service.address.is_empty() {
            raw.node.address
        } else {
            raw.service.address
        };

        HealthService {
            node: raw.node.node,
            id: raw.service.id,
            name: raw.service.service,
            address,
            port: raw.service.port,
            tags: raw.service.tags.unwrap_or_default(),
            checks: raw
                .checks
                .unwrap_or_default()
                .into_iter()
                .map(|c| HealthCheck {
                    check_id: c.check_id,
                    name: c.name,
                    status: c.status,
                    service_id: c.service_id,
                })
                .collect(),
        }
    }
}
