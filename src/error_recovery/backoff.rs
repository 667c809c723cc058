//! Exponential backoff with bounded jitter.
//!
//! Shared by the in-call [`RetryHandler`](super::retry_policy::RetryHandler)
//! and the dead-letter scheduler; each caller supplies its own parameters.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lower bound applied to every non-zero backoff delay
pub const MIN_DELAY: Duration = Duration::from_millis(100);

/// Share of the delay (and of `max_delay`) used as jitter amplitude
const JITTER_RATIO: f64 = 0.1;

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffParams {
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for BackoffParams {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Delay before retry `attempt` (1-indexed).
///
/// `attempt` 0 is treated as 1.
pub fn calculate_delay(attempt: u32, params: &BackoffParams) -> Duration {
    calculate_delay_with(attempt, params, &mut rand::thread_rng())
}

/// Same as [`calculate_delay`] with a caller-supplied random source.
pub fn calculate_delay_with<R: Rng + ?Sized>(
    attempt: u32,
    params: &BackoffParams,
    rng: &mut R,
) -> Duration {
    let base_ms = params.base_delay.as_secs_f64() * 1000.0;
    let max_ms = params.max_delay.as_secs_f64() * 1000.0;
    let exponent = attempt.max(1) - 1;

    let mut delay = (base_ms * params.multiplier.powi(exponent.min(i32::MAX as u32) as i32))
        .min(max_ms);
    if !delay.is_finite() {
        delay = max_ms;
    }

    if base_ms > 0.0 {
        let floor = MIN_DELAY.as_secs_f64() * 1000.0;
        delay = delay.max(floor).min(max_ms);
    }

    if params.jitter {
        let amplitude = (delay * JITTER_RATIO).min(max_ms * JITTER_RATIO);
        delay += rng.gen_range(-1.0..=1.0) * amplitude;
    }

    let delay = delay.clamp(0.0, max_ms.max(0.0));
    Duration::from_micros((delay * 1000.0).round() as u64)
}
