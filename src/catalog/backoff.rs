//! Backoff for failed blocking queries.
//!
//! Watch pollers never give up on a subscription; they wait progressively
//! longer between failed attempts, capped at `max_delay_ms`.

use rand::Rng;
use std::time::Duration;

/// Configuration for poller backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Base delay for exponential backoff in milliseconds (default: 250)
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds (default: 60000)
    pub max_delay_ms: u64,
    /// Jitter factor (0.0-1.0) to spread retries of many pollers (default: 0.2)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 250,
            max_delay_ms: 60_000,
            jitter_factor: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Retry almost immediately. Meant for tests.
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 1,
            max_delay_ms: 10,
            jitter_factor: 0.0,
        }
    }
}

/// Calculate backoff delay for a given failed attempt.
///
/// Uses exponential backoff: `base_delay * 2^(attempt-1)`
/// Capped at `max_delay_ms`, then up to `jitter_factor` added on top.
pub fn calculate_backoff(attempt: usize, config: &BackoffConfig) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let delay_ms = config
        .base_delay_ms
        .saturating_mul(1 << (attempt - 1).min(16));
    let capped_ms = delay_ms.min(config.max_delay_ms);

    let jitter_range = (capped_ms as f64 * config.jitter_factor.clamp(0.0, 1.0)) as u64;
    let jittered_ms = if jitter_range > 0 {
        capped_ms.saturating_add(rand::thread_rng().gen_range(0..=jitter_range))
    } else {
        capped_ms
    };

    Duration::from_millis(jittered_ms)
}
