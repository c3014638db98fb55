//! Error types for tierstat.

use thiserror::Error;

/// The main error type for all tierstat operations.
///
/// Validation errors are raised before any store I/O happens. Store errors
/// other than a conditional-write collision propagate unchanged.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Invalid caller input (value, names, dimensions, options).
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Invalid span configuration.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Error reported by the backing store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Error during query parameter handling.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// A configuration file could not be loaded.
    #[error("failed to load config '{path}': {reason}")]
    Config {
        /// The config file path.
        path: String,
        /// Description of the failure.
        reason: String,
    },
}

/// Errors raised while validating caller input.
#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    /// The value is not a finite number.
    #[error("invalid value: {value} ({reason})")]
    InvalidValue {
        /// The rejected value.
        value: f64,
        /// Why the value was rejected.
        reason: String,
    },

    /// A namespace was empty.
    #[error("namespace must not be empty")]
    EmptyNamespace,

    /// A metric name was empty.
    #[error("metric name must not be empty")]
    EmptyMetric,

    /// An owner was empty.
    #[error("owner must not be empty")]
    EmptyOwner,

    /// A dimension key or value cannot be encoded canonically.
    #[error("invalid dimension {key}={value}: {reason}")]
    InvalidDimension {
        /// The dimension key.
        key: String,
        /// The dimension value.
        value: String,
        /// Why the dimension is invalid.
        reason: String,
    },

    /// A buffer policy or other option is malformed.
    #[error("invalid option: {reason}")]
    InvalidOption {
        /// Description of what is wrong.
        reason: String,
    },
}

/// Errors raised while validating a span configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchemaError {
    /// No spans are configured.
    #[error("at least one span must be configured")]
    NoSpans,

    /// A span configuration is invalid.
    #[error("invalid span {index}: {reason}")]
    InvalidSpan {
        /// Position of the span in the set.
        index: usize,
        /// Description of what makes the span invalid.
        reason: String,
    },

    /// Spans are not in strictly ascending period order.
    #[error("spans must be ordered by strictly ascending period")]
    SpansNotOrdered,
}

/// Errors reported by a [`MetricStore`](crate::store::MetricStore).
#[derive(Error, Debug)]
pub enum StoreError {
    /// The conditional write lost: the stored sequence number differs from
    /// the expected one. The writer retries on this variant only.
    #[error("conditional write failed for {key}")]
    ConditionFailed {
        /// The record key that collided.
        key: String,
    },

    /// The store rejected the request due to rate or throughput limits.
    #[error("store throughput exceeded: {message}")]
    Throttled {
        /// Backend-provided detail.
        message: String,
    },

    /// Failed to read or write the backing file.
    #[error("store I/O failed for '{path}': {source}")]
    Io {
        /// The file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to encode or decode stored records.
    #[error("failed to encode or decode records: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other backend failure.
    #[error("store backend failure: {message}")]
    Backend {
        /// Backend-provided detail.
        message: String,
    },
}

impl StoreError {
    /// Returns `true` for a lost conditional write.
    pub fn is_condition_failed(&self) -> bool {
        matches!(self, Self::ConditionFailed { .. })
    }
}

/// Errors raised while interpreting query parameters.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueryError {
    /// The statistic name is not recognised.
    #[error("unknown statistic '{name}'")]
    UnknownStatistic {
        /// The rejected statistic name.
        name: String,
    },

    /// A percentile outside 0..=100 was requested.
    #[error("percentile p{percentile} is out of range (0-100)")]
    PercentileOutOfRange {
        /// The rejected percentile.
        percentile: u32,
    },

    /// The query period is zero.
    #[error("query period must be greater than zero")]
    ZeroPeriod,
}

/// Type alias for `Result<T, MetricsError>`.
pub type Result<T> = std::result::Result<T, MetricsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_failed_is_distinguishable() {
        let collision = StoreError::ConditionFailed {
            key: "acme/api#latency#".to_string(),
        };
        let throttled = StoreError::Throttled {
            message: "slow down".to_string(),
        };

        assert!(collision.is_condition_failed());
        assert!(!throttled.is_condition_failed());
    }

    #[test]
    fn test_error_wrapping_and_display() {
        let err: MetricsError = ValidationError::EmptyNamespace.into();
        assert_eq!(
            err.to_string(),
            "validation error: namespace must not be empty"
        );

        let err: MetricsError = QueryError::UnknownStatistic {
            name: "median".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "query error: unknown statistic 'median'");
    }
}
