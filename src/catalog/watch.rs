//! Continuous subscriptions over blocking queries.
//!
//! A [`Watcher`] owns one long-poll task per subscribed [`Query`]. Every
//! change observed by a poller is pushed into the single channel returned by
//! [`Watcher::new`]. Failed blocking queries are retried with backoff; they
//! never reach the channel. [`Watcher::stop`] (or dropping the watcher)
//! cancels every poller.

use super::backoff::{calculate_backoff, BackoffConfig};
use super::{Catalog, HealthService, Query, QueryOptions};
use crate::config::{
    DEFAULT_MAX_STALE, DEFAULT_MIN_POLL_INTERVAL, DEFAULT_UPDATE_CAPACITY, DEFAULT_WAIT_TIME,
};
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Fresh catalog data for one subscribed query.
#[derive(Debug, Clone)]
pub struct WatchUpdate {
    pub query: Query,
    pub instances: Vec<HealthService>,
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatcherOptions {
    pub wait_time: Duration,
    /// Blocking queries of one subscription start at least this far apart,
    /// even when the agent answers without blocking.
    pub min_poll_interval: Duration,
    pub max_stale: Option<Duration>,
    pub backoff: BackoffConfig,
    pub capacity: usize,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            wait_time: DEFAULT_WAIT_TIME,
            min_poll_interval: DEFAULT_MIN_POLL_INTERVAL,
            max_stale: Some(DEFAULT_MAX_STALE),
            backoff: BackoffConfig::default(),
            capacity: DEFAULT_UPDATE_CAPACITY,
        }
    }
}

/// Outcome of [`Watcher::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    Added,
    AlreadyWatching,
    /// The watcher was stopped; nothing was registered.
    Stopped,
}

/// Set of live subscriptions feeding one update channel.
pub struct Watcher {
    catalog: Arc<dyn Catalog>,
    options: WatcherOptions,
    queries: Arc<DashSet<Query>>,
    updates: mpsc::Sender<WatchUpdate>,
    cancel: CancellationToken,
}

impl Watcher {
    /// Create a watcher whose pollers stop when `cancel` fires.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        options: WatcherOptions,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<WatchUpdate>) {
        let (updates, rx) = mpsc::channel(options.capacity.max(1));
        let watcher = Self {
            catalog,
            options,
            queries: Arc::new(DashSet::new()),
            updates,
            cancel,
        };
        (watcher, rx)
    }

    /// Subscribe to `query`, starting after catalog index `index`.
    ///
    /// Passing the index of the read that populated the cache keeps the
    /// poller from redelivering the same snapshot.
    pub fn add(&self, query: Query, index: u64) -> Subscription {
        if self.cancel.is_cancelled() {
            return Subscription::Stopped;
        }
        if !self.queries.insert(query.clone()) {
            return Subscription::AlreadyWatching;
        }

        tracing::debug!(query = %query, index, "watching query");
        let poller = Poller {
            catalog: Arc::clone(&self.catalog),
            options: self.options.clone(),
            queries: Arc::clone(&self.queries),
            updates: self.updates.clone(),
            cancel: self.cancel.clone(),
        };
        tokio::spawn(poller.run(query, index.max(1)));

        Subscription::Added
    }

    pub fn is_watching(&self, query: &Query) -> bool {
        self.queries.contains(query)
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Tear down every subscription.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.queries.clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("subscriptions", &self.queries.len())
            .field("stopped", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

struct Poller {
    catalog: Arc<dyn Catalog>,
    options: WatcherOptions,
    queries: Arc<DashSet<Query>>,
    updates: mpsc::Sender<WatchUpdate>,
    cancel: CancellationToken,
}

impl Poller {
    async fn run(self, query: Query, mut index: u64) {
        let mut failures = 0usize;
        let mut last_poll: Option<Instant> = None;

        loop {
            if let Some(previous) = last_poll {
                let next = previous + self.options.min_poll_interval;
                if Instant::now() < next {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep_until(next) => {}
                    }
                }
            }
            last_poll = Some(Instant::now());

            let request = QueryOptions::blocking(index, self.options.wait_time)
                .with_max_stale(self.options.max_stale);

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.catalog.fetch(query.clone(), request) => result,
            };

            match result {
                Ok(response) => {
                    failures = 0;
                    let last = response.meta.last_index.max(1);

                    // Wait time elapsed without a change.
                    if last == index {
                        continue;
                    }
                    if last < index {
                        tracing::debug!(query = %query, index, last, "catalog index went backwards");
                    }
                    index = last;

                    let update = WatchUpdate {
                        query: query.clone(),
                        instances: response.instances,
                        index: last,
                    };
                    let sent = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        sent = self.updates.send(update) => sent,
                    };
                    if sent.is_err() {
                        tracing::debug!(query = %query, "update channel closed, stopping poller");
                        break;
                    }
                }
                Err(error) => {
                    failures += 1;
                    let delay = calculate_backoff(failures, &self.options.backoff);
                    if error.is_transient() {
                        tracing::warn!(
                            query = %query,
                            error = %error,
                            attempt = failures,
                            retry_in = ?delay,
                            "blocking query failed"
                        );
                    } else {
                        tracing::error!(
                            query = %query,
                            error = %error,
                            attempt = failures,
                            retry_in = ?delay,
                            "blocking query rejected"
                        );
                    }

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.queries.remove(&query);
        tracing::trace!(query = %query, "poller exited");
    }
}
