//! Provider configuration.
//!
//! [`ProviderConfig`] mirrors the sections of the provider's configuration
//! file that the resolver consumes. Every section has defaults so a partial
//! document is valid. [`ResolverOptions`] is the runtime view the resolver
//! works with; build it from a `ProviderConfig` or with the `with_*`
//! builders.

use crate::catalog::backoff::BackoffConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Reset period of the resolution cache and subscriptions.
pub const DEFAULT_RESET_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Staleness tolerated on blocking queries answered by follower servers.
pub const DEFAULT_MAX_STALE: Duration = Duration::from_millis(10_000);
/// How long one blocking query may hang before returning unchanged.
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(60);
/// Shortest gap between two blocking queries of one subscription.
pub const DEFAULT_MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Capacity of the channel between pollers and the watch loop.
pub const DEFAULT_UPDATE_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Catalog endpoint and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsulConfig {
    /// Base URL; an `https` scheme enables TLS.
    pub addr: String,
    pub acl_token: Option<String>,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub tls_skip_verify: bool,
    /// Query connect-capable instances instead of plain service instances.
    pub connect_aware: bool,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            addr: "http://127.0.0.1:8500".to_string(),
            acl_token: None,
            ca_cert: None,
            client_cert: None,
            client_key: None,
            tls_skip_verify: false,
            connect_aware: false,
        }
    }
}

impl ConsulConfig {
    pub fn tls_enabled(&self) -> bool {
        self.addr.starts_with("https")
    }
}

/// How function names map onto catalog service names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Prepended to every function name.
    pub job_prefix: String,
    /// Stripped from function names as a `.<namespace>` suffix.
    pub namespace: String,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            job_prefix: String::new(),
            namespace: "openfaas-fn".to_string(),
        }
    }
}

/// Timing knobs of the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResolverTuning {
    pub reset_interval_secs: u64,
    pub max_stale_ms: u64,
    pub wait_time_secs: u64,
    pub fetch_timeout_ms: Option<u64>,
}

impl Default for ResolverTuning {
    fn default() -> Self {
        Self {
            reset_interval_secs: DEFAULT_RESET_INTERVAL.as_secs(),
            max_stale_ms: DEFAULT_MAX_STALE.as_millis() as u64,
            wait_time_secs: DEFAULT_WAIT_TIME.as_secs(),
            fetch_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub consul: ConsulConfig,
    pub scheduling: SchedulingConfig,
    pub resolver: ResolverTuning,
}

impl ProviderConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_json_str(&raw)
    }

    /// Overlay the standard Consul environment variables.
    pub fn apply_env(mut self) -> Self {
        self.apply_vars(|key| std::env::var(key).ok());
        self
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("CONSUL_HTTP_ADDR").filter(|v| !v.is_empty()) {
            self.consul.addr = if addr.contains("://") { addr } else { format!("http://{addr}") };
        }
        if let Some(token) = lookup("CONSUL_HTTP_TOKEN").filter(|v| !v.is_empty()) {
            self.consul.acl_token = Some(token);
        }
    }
}

/// Runtime options of a [`CatalogResolver`](crate::resolver::CatalogResolver).
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverOptions {
    pub prefix: String,
    pub namespace: String,
    pub connect_aware: bool,
    pub reset_interval: Duration,
    pub max_stale: Option<Duration>,
    pub wait_time: Duration,
    pub min_poll_interval: Duration,
    pub fetch_timeout: Option<Duration>,
    pub backoff: BackoffConfig,
    pub update_capacity: usize,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            namespace: SchedulingConfig::default().namespace,
            connect_aware: false,
            reset_interval: DEFAULT_RESET_INTERVAL,
            max_stale: Some(DEFAULT_MAX_STALE),
            wait_time: DEFAULT_WAIT_TIME,
            min_poll_interval: DEFAULT_MIN_POLL_INTERVAL,
            fetch_timeout: None,
            backoff: BackoffConfig::default(),
            update_capacity: DEFAULT_UPDATE_CAPACITY,
        }
    }
}

impl ResolverOptions {
    pub fn from_config(config: &ProviderConfig) -> Self {
        let tuning = &config.resolver;
        Self {
            prefix: config.scheduling.job_prefix.clone(),
            namespace: config.scheduling.namespace.clone(),
            connect_aware: config.consul.connect_aware,
            reset_interval: Duration::from_secs(tuning.reset_interval_secs.max(1)),
            max_stale: (tuning.max_stale_ms > 0).then(|| Duration::from_millis(tuning.max_stale_ms)),
            wait_time: Duration::from_secs(tuning.wait_time_secs.max(1)),
            fetch_timeout: tuning.fetch_timeout_ms.map(Duration::from_millis),
            ..Default::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_connect_aware(mut self, connect_aware: bool) -> Self {
        self.connect_aware = connect_aware;
        self
    }

    pub fn with_reset_interval(mut self, interval: Duration) -> Self {
        self.reset_interval = interval;
        self
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn with_min_poll_interval(mut self, interval: Duration) -> Self {
        self.min_poll_interval = interval;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Catalog service name for a function name: strip `.<namespace>`, then
    /// prepend the prefix.
    pub fn service_name(&self, function: &str) -> String {
        let suffix = format!(".{}", self.namespace);
        let base = function.strip_suffix(suffix.as_str()).unwrap_or(function);
        format!("{}{}", self.prefix, base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_service_name_normalization() {
        let options = ResolverOptions::default()
            .with_prefix("svc-")
            .with_namespace("openfaas-fn");

        assert_eq!(options.service_name("echo.openfaas-fn"), "svc-echo");
        assert_eq!(options.service_name("echo"), "svc-echo");
        // Only the configured namespace is stripped
        assert_eq!(options.service_name("echo.other-ns"), "svc-echo.other-ns");
    }

    #[test]
    fn test_service_name_without_prefix() {
        let options = ResolverOptions::default();
        assert_eq!(options.service_name("figlet.openfaas-fn"), "figlet");
    }

    #[test]
    fn test_options_from_config() {
        let config = ProviderConfig {
            consul: ConsulConfig { connect_aware: true, ..Default::default() },
            scheduling: SchedulingConfig {
                job_prefix: "faas-".into(),
                namespace: "fns".into(),
            },
            resolver: ResolverTuning {
                max_stale_ms: 0,
                fetch_timeout_ms: Some(1500),
                ..Default::default()
            },
        };

        let options = ResolverOptions::from_config(&config);
        assert_eq!(options.prefix, "faas-");
        assert_eq!(options.namespace, "fns");
        assert!(options.connect_aware);
        assert_eq!(options.reset_interval, DEFAULT_RESET_INTERVAL);
        assert_eq!(options.max_stale, None);
        assert_eq!(options.fetch_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> =
            [("CONSUL_HTTP_ADDR", "10.0.0.5:8500"), ("CONSUL_HTTP_TOKEN", "secret")].into();

        let mut config = ProviderConfig::default();
        config.apply_vars(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.consul.addr, "http://10.0.0.5:8500");
        assert_eq!(config.consul.acl_token.as_deref(), Some("secret"));
        assert!(!config.consul.tls_enabled());
    }
}
