use std::time::Duration;

/// Exponential backoff configuration (§4.2 retry policies).
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 60_000,
            multiplier: 2.0,
            jitter_fraction: 0.25,
        }
    }
}

/// `min(base * multiplier^attempt, max) + jitter`, deterministic pseudo
/// jitter so backoff scheduling stays reproducible in tests without an
/// extra RNG dependency on this hot path.
pub fn next_backoff(attempt: u32, config: &BackoffConfig) -> Duration {
    let exp = config.multiplier.powi(attempt as i32);
    let raw_ms = (config.base_ms as f64 * exp).min(config.max_ms as f64);
    let jitter = deterministic_jitter(attempt) * config.jitter_fraction * raw_ms;
    Duration::from_millis((raw_ms + jitter) as u64)
}

/// Cheap LCG-derived pseudo jitter in [0, 1), stable for a given attempt
/// number so retry timing is reproducible across runs.
fn deterministic_jitter(attempt: u32) -> f64 {
    let seed = (attempt as u64).wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    ((seed >> 33) as f64) / (u32::MAX as f64)
}

/// §4.5 streamed-mode per-blob retry: fixed 2s/4s/8s schedule, 3 attempts.
pub fn streamed_blob_backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt + 1))
}

/// §4.5: rate-limit errors during blob transfer use a longer schedule.
pub fn blob_rate_limit_backoff(attempt: u32) -> Duration {
    Duration::from_secs(8u64.saturating_mul(2u64.saturating_pow(attempt)))
}

/// §4.2 `RateLimitExceeded`: polynomial backoff (attempt^2 seconds, capped).
pub fn rate_limit_backoff(attempt: u32) -> Duration {
    let secs = (attempt as u64).saturating_mul(attempt as u64).saturating_mul(5).max(5);
    Duration::from_secs(secs.min(300))
}

pub async fn sleep_backoff(duration: Duration) {
    tokio::time::sleep(duration).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped_at_max() {
        let config = BackoffConfig {
            base_ms: 100,
            max_ms: 1000,
            multiplier: 2.0,
            jitter_fraction: 0.0,
        };
        let d = next_backoff(20, &config);
        assert!(d.as_millis() <= 1000);
    }

    #[test]
    fn backoff_grows_with_attempt() {
        let config = BackoffConfig {
            jitter_fraction: 0.0,
            ..BackoffConfig::default()
        };
        let d0 = next_backoff(0, &config);
        let d1 = next_backoff(1, &config);
        assert!(d1 >= d0);
    }

    #[test]
    fn streamed_blob_backoff_matches_spec_schedule() {
        assert_eq!(streamed_blob_backoff(0), Duration::from_secs(2));
        assert_eq!(streamed_blob_backoff(1), Duration::from_secs(4));
        assert_eq!(streamed_blob_backoff(2), Duration::from_secs(8));
    }
}
