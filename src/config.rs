//! Runtime configuration.
//!
//! Loaded from environment variables with typed defaults for the
//! reconciler and actor-alarm tunables. Kept as a plain struct with a
//! `Default` impl, in the style of this codebase's `DatabaseConfig`/`CacheConfig`
//! — it has never carried a dedicated config-parsing crate.

use std::time::Duration;

/// Process-wide configuration for the entitlement core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string for the durable entitlement store.
    pub database_url: String,
    /// Redis connection string for the distributed (L2) cache tier.
    pub redis_url: String,
    /// How far behind `now` the reconciler's watermark sits (spec default 5m).
    pub reconcile_watermark: Duration,
    /// Maximum tolerated drift between meter snapshot and settled analytics.
    pub max_drift: f64,
    /// Epsilon below which drift is ignored rather than applied.
    pub reconcile_epsilon: f64,
    /// Idempotency-key retention; spec requires at least 2 cycle lengths, min 1h.
    pub idempotency_ttl: Duration,
    /// Lower bound for the actor's alarm interval (spec: 5s).
    pub alarm_min: Duration,
    /// Upper bound for the actor's alarm interval (spec: 30m).
    pub alarm_max: Duration,
    /// Default overage threshold for the `always` strategy (spec: 95%).
    pub default_overage_threshold: f64,
    /// Retry attempts for cache/DB reads (spec: 3).
    pub read_retry_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            redis_url: String::new(),
            reconcile_watermark: Duration::from_secs(5 * 60),
            max_drift: 1000.0,
            reconcile_epsilon: 0.001,
            idempotency_ttl: Duration::from_secs(60 * 60),
            alarm_min: Duration::from_secs(5),
            alarm_max: Duration::from_secs(30 * 60),
            default_overage_threshold: 0.95,
            read_retry_attempts: 3,
        }
    }
}

impl Config {
    /// Load from the environment, falling back to spec defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            reconcile_watermark: std::env::var("RECONCILE_WATERMARK_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconcile_watermark),
            max_drift: std::env::var("MAX_DRIFT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_drift),
            idempotency_ttl: std::env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.idempotency_ttl),
            alarm_min: std::env::var("ALARM_MIN_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.alarm_min),
            alarm_max: std::env::var("ALARM_MAX_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.alarm_max),
            ..defaults
        }
    }

    /// Clamp a requested flush interval into `[alarm_min, alarm_max]`.
    pub fn clamp_alarm(&self, requested: Option<Duration>) -> Duration {
        let requested = requested.unwrap_or(self.alarm_max);
        requested.clamp(self.alarm_min, self.alarm_max)
    }
}
