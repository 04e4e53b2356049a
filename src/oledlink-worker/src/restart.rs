//! Restart decisions and backoff for the display worker.

use oledlink_core::{RestartConfig, RestartPolicy};
use rand::Rng;
use std::time::Duration;

/// Whether an exit that `stop` did not request should trigger a restart.
pub fn wants_restart(policy: RestartPolicy, code: Option<i32>) -> bool {
    match policy {
        RestartPolicy::Never => false,
        RestartPolicy::OnFailure => code != Some(0),
        RestartPolicy::Always => true,
    }
}

/// Delay before restart number `attempt` (zero based): exponential, capped at
/// `max_backoff`, plus up to 10% jitter.
pub fn restart_delay(config: &RestartConfig, attempt: u32) -> Duration {
    let max = config.max_backoff();
    let base = config
        .initial_backoff()
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(max);

    let jitter_ms = (base.as_millis() / 10) as u64;
    let jitter = if jitter_ms > 0 {
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    } else {
        Duration::ZERO
    };
    (base + jitter).min(max)
}
