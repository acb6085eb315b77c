//! Backoff between retry passes
//!
//! A rate-limit signal anywhere in a pass makes the controller wait before the
//! next pass. The wait grows exponentially with the retry number and is capped
//! at [`RetryConfig::max_delay`], with optional jitter to keep separate runs
//! from hammering the servers in lockstep.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Delay before retry pass `retry` (1-based), without jitter
///
/// `initial_delay * backoff_multiplier^(retry - 1)`, capped at `max_delay`.
pub fn backoff_delay(config: &RetryConfig, retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    if !secs.is_finite() || secs >= config.max_delay.as_secs_f64() {
        return config.max_delay;
    }
    Duration::from_secs_f64(secs)
}

/// Delay before retry pass `retry`, with jitter applied when configured
pub fn jittered_backoff(config: &RetryConfig, retry: u32) -> Duration {
    let delay = backoff_delay(config, retry);
    if config.jitter {
        add_jitter(delay)
    } else {
        delay
    }
}

/// Sleep for `delay` unless `cancel` fires first
///
/// Returns `false` when the sleep was cut short.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}
