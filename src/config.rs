//! Configuration types for model-dl

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Queue and worker-pool behavior configuration
///
/// Groups settings that control dispatch concurrency, bandwidth throttling,
/// and progress coalescing. Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum concurrent downloads (default: 1, minimum 1)
    ///
    /// Can be changed at runtime with `set_parallelism()` — growing spawns
    /// workers lazily, shrinking lets excess workers finish their current
    /// task and exit.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Global bandwidth ceiling in kilobytes per second (default: 0 = unlimited)
    #[serde(default)]
    pub bandwidth_limit_kbps: u64,

    /// Minimum interval between coalesced progress emissions (default: 200 ms)
    ///
    /// Within one interval the reporter accumulates byte deltas per task and
    /// forwards at most one merged event per task at the interval boundary.
    /// Terminal events are never delayed.
    #[serde(default = "default_progress_interval", with = "duration_millis_serde")]
    pub progress_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            bandwidth_limit_kbps: 0,
            progress_interval: default_progress_interval(),
        }
    }
}

/// Retry configuration for transient transfer failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first failure (default: 3)
    ///
    /// A task failing with transient errors is attempted `max_retries + 1`
    /// times in total before it is finalized as failed. Permanent errors are
    /// never retried regardless of this value.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Main configuration for [`ModelDownloader`](crate::ModelDownloader)
///
/// Sub-config fields are flattened for backward-compatible serialization,
/// meaning the JSON/TOML format has no nesting.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Dispatch, bandwidth, and progress settings
    #[serde(flatten)]
    pub queue: QueueConfig,

    /// Retry behavior for transient failures
    #[serde(flatten)]
    pub retry: RetryConfig,
}

impl Config {
    /// Global bandwidth ceiling in bytes per second (`None` = unlimited)
    pub fn bandwidth_limit_bps(&self) -> Option<u64> {
        match self.queue.bandwidth_limit_kbps {
            0 => None,
            kbps => Some(kbps * 1024),
        }
    }
}

fn default_max_parallel() -> usize {
    1
}

fn default_progress_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds, for sub-second intervals)
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sensible_values() {
        let config = Config::default();
        assert_eq!(config.queue.max_parallel, 1);
        assert_eq!(config.queue.bandwidth_limit_kbps, 0);
        assert_eq!(config.queue.progress_interval, Duration::from_millis(200));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_delay, Duration::from_secs(1));
        assert_eq!(config.retry.max_delay, Duration::from_secs(60));
        assert!(config.retry.jitter);
    }

    #[test]
    fn bandwidth_limit_zero_means_unlimited() {
        let config = Config::default();
        assert_eq!(config.bandwidth_limit_bps(), None);
    }

    #[test]
    fn bandwidth_limit_converts_kilobytes_to_bytes() {
        let mut config = Config::default();
        config.queue.bandwidth_limit_kbps = 100;
        assert_eq!(config.bandwidth_limit_bps(), Some(102_400));
    }

    #[test]
    fn config_deserializes_from_flat_json() {
        let json = r#"{
            "max_parallel": 4,
            "bandwidth_limit_kbps": 500,
            "max_retries": 2,
            "initial_delay": 5,
            "jitter": false
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.queue.max_parallel, 4);
        assert_eq!(config.queue.bandwidth_limit_kbps, 500);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.initial_delay, Duration::from_secs(5));
        assert!(!config.retry.jitter);
        // Unspecified fields fall back to defaults
        assert_eq!(config.retry.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut config = Config::default();
        config.queue.max_parallel = 3;
        config.queue.progress_interval = Duration::from_millis(100);
        config.retry.backoff_multiplier = 1.5;

        let json = serde_json::to_string(&config).unwrap();
        let restored: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.queue.max_parallel, 3);
        assert_eq!(restored.queue.progress_interval, Duration::from_millis(100));
        assert!((restored.retry.backoff_multiplier - 1.5).abs() < f64::EPSILON);
    }
}
