//! Runtime configuration for a [`Metrics`](crate::metrics::Metrics) instance.
//!
//! A [`MetricsConfig`] can be built in code with the `with_*` builders or
//! loaded from a JSON file:
//!
//! ```json
//! {
//!   "owner": "acme",
//!   "spans": [{"period": 300, "samples": 10}, {"period": 3600, "samples": 12}],
//!   "p_resolution": 100,
//!   "verbosity": "info"
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::BufferPolicy;
use crate::error::{MetricsError, Result, ValidationError};
use crate::schema::SpanSet;

/// How much the library logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// Warnings and errors only.
    #[default]
    Off,
    /// One event per persisted write and per query.
    Info,
    /// Per-bucket rollup detail.
    Verbose,
}

impl Verbosity {
    /// Maps a repeated `-v` flag count to a level.
    pub fn from_occurrences(count: u8) -> Self {
        match count {
            0 => Self::Off,
            1 => Self::Info,
            _ => Self::Verbose,
        }
    }

    /// Whether per-write and per-query events are enabled.
    pub fn info(self) -> bool {
        self != Self::Off
    }

    /// Whether per-bucket events are enabled.
    pub fn verbose(self) -> bool {
        self == Self::Verbose
    }
}

/// Exponential backoff between conditional-write retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Total write attempts before giving up.
    pub max_attempts: u32,
    /// Delay after the first collision.
    pub initial_delay: Duration,
    /// Upper bound on any single delay (before jitter).
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// A policy that retries immediately, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay to wait after failed attempt `attempt` (0-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let delay = if self.jitter {
            capped * (1.0 + rand::random::<f64>() * 0.25)
        } else {
            capped
        };

        Duration::from_millis(delay as u64)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(invalid("backoff.max_attempts must be greater than zero"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(invalid("backoff.multiplier must be a finite number >= 1"));
        }
        Ok(())
    }
}

/// Settings shared by every write and query of one metrics instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Owning account or tenant; the store partition key.
    pub owner: String,

    /// Resolution hierarchy for new records.
    #[serde(default)]
    pub spans: SpanSet,

    /// Seconds a record lives after its latest write. Defaults to the
    /// coarsest span's period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,

    /// Percentile reservoir size per bucket. `None` disables percentiles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p_resolution: Option<usize>,

    /// Buffer policy applied to emits that do not carry their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<BufferPolicy>,

    /// Source tag stored on every written record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Logging level.
    #[serde(default)]
    pub verbosity: Verbosity,

    /// Conditional-write retry policy.
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl MetricsConfig {
    /// Creates a config with default spans and no buffering.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            spans: SpanSet::default(),
            ttl: None,
            p_resolution: None,
            buffer: None,
            source: None,
            verbosity: Verbosity::Off,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Loads a config from a JSON file and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Config`] if the file cannot be read or parsed,
    /// or a validation error if the contents are invalid.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_error = |reason: String| MetricsError::Config {
            path: path.display().to_string(),
            reason,
        };

        let text = std::fs::read_to_string(path).map_err(|e| config_error(e.to_string()))?;
        let config: Self = serde_json::from_str(&text).map_err(|e| config_error(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the span hierarchy.
    #[must_use]
    pub fn with_spans(mut self, spans: SpanSet) -> Self {
        self.spans = spans;
        self
    }

    /// Sets the record time-to-live in seconds.
    #[must_use]
    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Enables percentiles with a reservoir of `size` values per bucket.
    #[must_use]
    pub fn with_p_resolution(mut self, size: usize) -> Self {
        self.p_resolution = Some(size);
        self
    }

    /// Sets the default buffer policy.
    #[must_use]
    pub fn with_buffer(mut self, policy: BufferPolicy) -> Self {
        self.buffer = Some(policy);
        self
    }

    /// Sets the source tag.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the logging level.
    #[must_use]
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Effective time-to-live in seconds.
    pub fn ttl(&self) -> u64 {
        self.ttl.unwrap_or_else(|| self.spans.coarsest().period)
    }

    /// Validates every setting.
    ///
    /// # Errors
    ///
    /// Returns a validation or schema error describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.owner.is_empty() {
            return Err(ValidationError::EmptyOwner.into());
        }
        self.spans.validate()?;
        if self.ttl == Some(0) {
            return Err(invalid("ttl must be greater than zero"));
        }
        if let Some(policy) = &self.buffer {
            policy.validate()?;
        }
        self.backoff.validate()
    }
}

fn invalid(reason: &str) -> MetricsError {
    ValidationError::InvalidOption {
        reason: reason.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SpanConfig;

    #[test]
    fn test_defaults() {
        let config = MetricsConfig::new("acme");
        assert!(config.validate().is_ok());
        assert_eq!(config.ttl(), crate::schema::YEAR);
        assert_eq!(config.backoff.max_attempts, 10);
        assert_eq!(config.verbosity, Verbosity::Off);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            jitter: false,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(80));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_is_bounded() {
        let policy = BackoffPolicy::default();
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(40));
            assert!(delay <= Duration::from_millis(50));
        }
    }

    #[test]
    fn test_validation_rejects_bad_settings() {
        assert!(MetricsConfig::new("").validate().is_err());
        assert!(MetricsConfig::new("acme").with_ttl(0).validate().is_err());
        assert!(
            MetricsConfig::new("acme")
                .with_backoff(BackoffPolicy::immediate(0))
                .validate()
                .is_err()
        );
        assert!(
            MetricsConfig::new("acme")
                .with_buffer(BufferPolicy::default().with_count(0))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let config = MetricsConfig::new("acme")
            .with_spans(
                SpanSet::new(vec![
                    SpanConfig::new(300, 10).unwrap(),
                    SpanConfig::new(3600, 12).unwrap(),
                ])
                .unwrap(),
            )
            .with_p_resolution(100)
            .with_verbosity(Verbosity::Info);
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = MetricsConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let config: MetricsConfig =
            serde_json::from_str(r#"{"owner": "acme", "verbosity": "verbose"}"#).unwrap();
        assert_eq!(config.spans, SpanSet::default());
        assert_eq!(config.backoff, BackoffPolicy::default());
        assert!(config.verbosity.verbose());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = MetricsConfig::from_json_file("/nonexistent/tierstat.json").unwrap_err();
        assert!(matches!(err, MetricsError::Config { .. }));
    }
}
