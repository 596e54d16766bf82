//! Resolver Tests
//!
//! Covers:
//! - Cache miss, one-shot fetch and cache hits
//! - Watch propagation into the cache
//! - Manual and periodic reset, including resets racing lookups and updates
//! - Error mapping (`Upstream`, `NoCandidate`, `Timeout`, `Closed`)
//! - Name normalization and expected identity

use faasresolve::catalog::backoff::BackoffConfig;
use faasresolve::catalog::{
    Catalog, CatalogResponse, Fetching, HealthCheck, HealthService, MemoryCatalog, Query,
    QueryOptions,
};
use faasresolve::config::ResolverOptions;
use faasresolve::resolver::{CatalogResolver, ServiceResolver};
use faasresolve::{CatalogError, ResolveError};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn instance(address: &str, checks: usize) -> HealthService {
    (0..checks).fold(HealthService::new("svc-echo", address, 8080), |s, i| {
        s.with_check(HealthCheck::passing(format!("check-{i}")))
    })
}

fn echo() -> Query {
    Query::health_service("svc-echo").unwrap()
}

fn options() -> ResolverOptions {
    ResolverOptions::default()
        .with_prefix("svc-")
        .with_namespace("openfaas-fn")
        .with_wait_time(Duration::from_secs(5))
        .with_backoff(BackoffConfig::immediate())
}

fn resolver(catalog: &MemoryCatalog) -> CatalogResolver {
    CatalogResolver::new(Arc::new(catalog.clone()), options())
}

/// Poll the cache until `predicate` holds or the deadline passes.
async fn eventually<F>(resolver: &CatalogResolver, function: &str, predicate: F) -> Vec<String>
where
    F: Fn(&[String]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let addresses = resolver.resolve_all(function).await.unwrap().addresses;
        if predicate(&addresses) || tokio::time::Instant::now() >= deadline {
            return addresses;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_miss_fetches_once_then_hits_cache() {
    let catalog = MemoryCatalog::new();
    catalog.register(&echo(), vec![instance("10.0.0.1", 2), instance("10.0.0.2", 2)]);
    let resolver = resolver(&catalog);

    let first = resolver.resolve_all("echo.openfaas-fn").await.unwrap();
    let second = resolver.resolve_all("echo").await.unwrap();

    assert_eq!(first.addresses, vec!["10.0.0.1:8080", "10.0.0.2:8080"]);
    assert_eq!(first, second);
    assert_eq!(catalog.one_shot_fetches(&echo()), 1);
    assert_eq!(resolver.cached_services(), 1);
    assert_eq!(resolver.subscriptions(), 1);
}

#[tokio::test]
async fn test_normalization_and_identity() {
    let catalog = MemoryCatalog::new();
    catalog.register(&echo(), vec![instance("10.0.0.1", 2)]);
    let resolver = resolver(&catalog);

    assert_eq!(resolver.service_name("echo.openfaas-fn"), "svc-echo");
    assert_eq!(resolver.service_name("echo"), "svc-echo");
    // Only the configured namespace suffix is stripped.
    assert_eq!(resolver.service_name("echo.staging"), "svc-echo.staging");

    let endpoint = resolver.resolve("echo.openfaas-fn").await.unwrap();
    assert_eq!(endpoint.address, "10.0.0.1:8080");
    assert_eq!(endpoint.identity.namespace(), "openfaas-fn");
    assert_eq!(endpoint.identity.datacenter(), "dc1");
    assert_eq!(endpoint.identity.service(), "svc-echo");
    assert_eq!(endpoint.identity.to_uri(), "spiffe:///ns/openfaas-fn/dc/dc1/svc/svc-echo");
}

#[tokio::test]
async fn test_resolve_picks_an_eligible_address() {
    let catalog = MemoryCatalog::new();
    catalog.register(
        &echo(),
        vec![instance("10.0.0.1", 2), instance("10.0.0.2", 1), instance("10.0.0.3", 3)],
    );
    let resolver = resolver(&catalog);

    for _ in 0..50 {
        let endpoint = resolver.resolve("echo").await.unwrap();
        assert!(
            endpoint.address == "10.0.0.1:8080" || endpoint.address == "10.0.0.3:8080",
            "unexpected address {}",
            endpoint.address
        );
    }
    assert_eq!(catalog.one_shot_fetches(&echo()), 1);
}

#[tokio::test]
async fn test_no_eligible_instance() {
    let catalog = MemoryCatalog::new();
    catalog.register(&echo(), vec![instance("10.0.0.1", 1), instance("10.0.0.2", 0)]);
    let resolver = resolver(&catalog);

    let all = resolver.resolve_all("echo").await.unwrap();
    assert!(all.addresses.is_empty());

    let err = resolver.resolve("echo").await.unwrap_err();
    assert!(err.is_no_candidate());
    assert_eq!(err.status_code(), http::StatusCode::SERVICE_UNAVAILABLE);

    // The empty result is cached and watched like any other.
    assert_eq!(catalog.one_shot_fetches(&echo()), 1);
    assert_eq!(resolver.subscriptions(), 1);
}

#[tokio::test]
async fn test_unknown_service_has_no_candidate() {
    let catalog = MemoryCatalog::new();
    let resolver = resolver(&catalog);

    let err = resolver.resolve("missing").await.unwrap_err();
    assert!(matches!(err, ResolveError::NoCandidate { ref service } if service == "svc-missing"));
}

#[tokio::test]
async fn test_upstream_failure_is_not_cached() {
    let catalog = MemoryCatalog::new();
    catalog.register(&echo(), vec![instance("10.0.0.1", 2)]);
    catalog.fail_with(CatalogError::Http("connection reset".into()));
    let resolver = resolver(&catalog);

    let err = resolver.resolve("echo").await.unwrap_err();
    match &err {
        ResolveError::Upstream { service, source } => {
            assert_eq!(service, "svc-echo");
            assert!(matches!(source, CatalogError::Http(_)));
        }
        other => panic!("expected upstream error, got {other:?}"),
    }
    assert_eq!(resolver.cached_services(), 0);
    assert_eq!(resolver.subscriptions(), 0);

    catalog.recover();
    let endpoint = resolver.resolve("echo").await.unwrap();
    assert_eq!(endpoint.address, "10.0.0.1:8080");
    assert_eq!(catalog.one_shot_fetches(&echo()), 2);
}

#[tokio::test]
async fn test_watch_updates_reach_cache() {
    let catalog = MemoryCatalog::new();
    catalog.register(&echo(), vec![instance("10.0.0.1", 2)]);
    let resolver = resolver(&catalog);

    assert_eq!(resolver.resolve_all("echo").await.unwrap().addresses, vec!["10.0.0.1:8080"]);

    catalog.register(&echo(), vec![instance("10.0.0.7", 2), instance("10.0.0.8", 2)]);
    let addresses = eventually(&resolver, "echo", |a| a.len() == 2).await;
    assert_eq!(addresses, vec!["10.0.0.7:8080", "10.0.0.8:8080"]);

    catalog.deregister(&echo());
    let addresses = eventually(&resolver, "echo", |a| a.is_empty()).await;
    assert!(addresses.is_empty());

    // Updates arrived through the watch, not through new one-shot reads.
    assert_eq!(catalog.one_shot_fetches(&echo()), 1);
    assert!(catalog.blocking_fetches(&echo()) >= 1);
}

#[tokio::test]
async fn test_reset_drops_cache_and_subscriptions() {
    let catalog = MemoryCatalog::new();
    catalog.register(&echo(), vec![instance("10.0.0.1", 2)]);
    let resolver = resolver(&catalog);

    resolver.resolve("echo").await.unwrap();
    assert_eq!(resolver.generation(), 0);

    resolver.reset();
    assert_eq!(resolver.generation(), 1);
    assert_eq!(resolver.cached_services(), 0);
    assert_eq!(resolver.subscriptions(), 0);

    resolver.resolve("echo").await.unwrap();
    assert_eq!(catalog.one_shot_fetches(&echo()), 2);
    assert_eq!(resolver.subscriptions(), 1);

    // The new generation keeps watching.
    catalog.register(&echo(), vec![instance("10.0.0.9", 2)]);
    let addresses = eventually(&resolver, "echo", |a| a == ["10.0.0.9:8080"]).await;
    assert_eq!(addresses, vec!["10.0.0.9:8080"]);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_reset() {
    let catalog = MemoryCatalog::new();
    catalog.register(&echo(), vec![instance("10.0.0.1", 2)]);
    let resolver = CatalogResolver::new(
        Arc::new(catalog.clone()),
        options().with_reset_interval(Duration::from_secs(30 * 60)),
    );

    resolver.resolve("echo").await.unwrap();

    tokio::time::sleep(Duration::from_secs(29 * 60)).await;
    assert_eq!(resolver.generation(), 0);
    assert_eq!(resolver.cached_services(), 1);

    tokio::time::sleep(Duration::from_secs(2 * 60)).await;
    assert_eq!(resolver.generation(), 1);
    assert_eq!(resolver.cached_services(), 0);

    resolver.resolve("echo").await.unwrap();
    assert_eq!(catalog.one_shot_fetches(&echo()), 2);
}

#[tokio::test]
async fn test_concurrent_misses_all_succeed() {
    let catalog = MemoryCatalog::new();
    catalog.register(&echo(), vec![instance("10.0.0.1", 2)]);
    let resolver = resolver(&catalog);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.resolve("echo").await })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().address, "10.0.0.1:8080");
    }
    // Concurrent misses may each read the catalog, but one subscription wins.
    assert!(catalog.one_shot_fetches(&echo()) >= 1);
    assert_eq!(resolver.subscriptions(), 1);
}

struct HangingCatalog;

impl Catalog for HangingCatalog {
    fn fetch(&self, _query: Query, _options: QueryOptions) -> Fetching {
        Box::pin(std::future::pending::<Result<CatalogResponse, CatalogError>>())
    }
}

#[tokio::test(start_paused = true)]
async fn test_fetch_timeout() {
    let resolver = CatalogResolver::new(
        Arc::new(HangingCatalog),
        options().with_fetch_timeout(Duration::from_secs(2)),
    );

    let err = resolver.resolve("echo").await.unwrap_err();
    assert!(matches!(err, ResolveError::Timeout { after, .. } if after == Duration::from_secs(2)));
    assert_eq!(err.status_code(), http::StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_close_stops_resolution() {
    let catalog = MemoryCatalog::new();
    catalog.register(&echo(), vec![instance("10.0.0.1", 2)]);
    let resolver = resolver(&catalog);
    resolver.resolve("echo").await.unwrap();

    resolver.close();
    resolver.reset();

    assert!(resolver.is_closed());
    assert_eq!(resolver.generation(), 0);
    assert!(matches!(resolver.resolve_all("echo").await, Err(ResolveError::Closed)));
}

#[tokio::test]
async fn test_trait_object_dispatch() {
    let catalog = MemoryCatalog::new();
    catalog.register(&echo(), vec![instance("10.0.0.1", 2)]);
    let resolver: Arc<dyn ServiceResolver> = Arc::new(resolver(&catalog));

    let endpoint = resolver.resolve("echo.openfaas-fn").await.unwrap();
    assert_eq!(endpoint.address, "10.0.0.1:8080");

    let all = resolver.resolve_all("echo").await.unwrap();
    assert_eq!(all.addresses, vec!["10.0.0.1:8080"]);
}

/// Holds one-shot reads until released; blocking reads pass straight through.
#[derive(Clone, Default)]
struct GatedCatalog {
    inner: MemoryCatalog,
    started: Arc<Notify>,
    gate: Arc<Notify>,
}

impl Catalog for GatedCatalog {
    fn fetch(&self, query: Query, options: QueryOptions) -> Fetching {
        let catalog = self.clone();
        Box::pin(async move {
            if !options.is_blocking() {
                catalog.started.notify_one();
                catalog.gate.notified().await;
            }
            catalog.inner.fetch(query, options).await
        })
    }
}

#[tokio::test]
async fn test_reset_during_first_lookup() {
    let catalog = GatedCatalog::default();
    catalog.inner.register(&echo(), vec![instance("10.0.0.1", 2)]);
    let resolver = CatalogResolver::new(Arc::new(catalog.clone()), options());

    let lookup = {
        let resolver = resolver.clone();
        tokio::spawn(async move { resolver.resolve_all("echo").await })
    };
    catalog.started.notified().await;
    resolver.reset();
    catalog.gate.notify_one();

    let endpoints = lookup.await.unwrap().unwrap();
    assert_eq!(endpoints.addresses, vec!["10.0.0.1:8080"]);

    // The late result lands in the new generation and is watched there.
    assert_eq!(resolver.generation(), 1);
    assert_eq!(resolver.cached_services(), 1);
    assert_eq!(resolver.subscriptions(), 1);

    catalog.inner.register(&echo(), vec![instance("10.0.0.4", 2)]);
    let addresses = eventually(&resolver, "echo", |a| *a == ["10.0.0.4:8080"]).await;
    assert_eq!(addresses, vec!["10.0.0.4:8080"]);
    assert_eq!(catalog.inner.one_shot_fetches(&echo()), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reset_under_update_churn_leaves_nothing_cached() {
    let catalog = MemoryCatalog::new();
    let queries: Vec<Query> = (0..100)
        .map(|i| Query::health_service(format!("svc-fn{i}")).unwrap())
        .collect();
    for query in &queries {
        catalog.register(query, vec![instance("10.0.0.1", 2)]);
    }

    let resolver = resolver(&catalog);
    for i in 0..queries.len() {
        resolver.resolve_all(&format!("fn{i}")).await.unwrap();
    }
    assert_eq!(resolver.subscriptions(), queries.len());

    let churn = {
        let catalog = catalog.clone();
        let queries = queries.clone();
        tokio::spawn(async move {
            for round in 0..20u8 {
                for query in &queries {
                    catalog.register(query, vec![instance(&format!("10.0.1.{round}"), 2)]);
                }
                tokio::task::yield_now().await;
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(5)).await;
    resolver.reset();
    churn.await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // No lookup happened since the reset, so nothing may be cached or watched.
    assert_eq!(resolver.subscriptions(), 0);
    assert_eq!(resolver.cached_services(), 0);
}
