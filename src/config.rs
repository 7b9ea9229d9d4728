use std::time::Duration;

use crate::model::{Ms, MINUTE_MS};

/// Engine tuning knobs. Defaults match the documented contract; deployments
/// override via `SLOTWISE_*` environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Width of a reservation-lock time bucket.
    pub bucket_ms: Ms,
    /// TTL stamped on acquired lock tokens.
    pub lock_ttl: Duration,
    /// How long `reserve` waits for a contended bucket before LockTimeout.
    pub lock_timeout: Duration,
    /// Alternative-slot search radius for `reschedule_nearest`, in days.
    pub search_window_days: u32,
    /// Retry budget when a rescheduled slot conflicts again.
    pub reschedule_attempts: u32,
    /// Max in-flight reservations during bulk series generation.
    pub series_inflight: usize,
    /// Slot granularity used by the nearest-slot search, in minutes.
    pub search_granularity_min: u32,
    /// Journal appends before the background compactor rewrites the log.
    pub compact_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bucket_ms: 30 * MINUTE_MS,
            lock_ttl: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(5),
            search_window_days: 14,
            reschedule_attempts: 3,
            series_inflight: 4,
            search_granularity_min: 30,
            compact_threshold: 1000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bucket_ms: env_parse::<Ms>("SLOTWISE_BUCKET_MINUTES")
                .map(|m| m * MINUTE_MS)
                .unwrap_or(defaults.bucket_ms),
            lock_ttl: env_parse("SLOTWISE_LOCK_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_ttl),
            lock_timeout: env_parse("SLOTWISE_LOCK_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_timeout),
            search_window_days: env_parse("SLOTWISE_SEARCH_WINDOW_DAYS")
                .unwrap_or(defaults.search_window_days),
            reschedule_attempts: env_parse("SLOTWISE_RESCHEDULE_ATTEMPTS")
                .unwrap_or(defaults.reschedule_attempts),
            series_inflight: env_parse("SLOTWISE_SERIES_INFLIGHT")
                .unwrap_or(defaults.series_inflight),
            search_granularity_min: env_parse("SLOTWISE_SEARCH_GRANULARITY_MIN")
                .unwrap_or(defaults.search_granularity_min),
            compact_threshold: env_parse("SLOTWISE_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.bucket_ms, 30 * MINUTE_MS);
        assert_eq!(cfg.lock_timeout, Duration::from_secs(5));
        assert_eq!(cfg.search_window_days, 14);
        assert!(cfg.series_inflight >= 1);
    }
}
