//! Persisted metric records and their span rings.
//!
//! A [`MetricRecord`] holds every resolution tier for one
//! (owner, namespace, metric, dimensions) tuple. Each [`Span`] is a ring of
//! fixed-width buckets ([`Point`]s), oldest first, whose newest bucket closes
//! at `end`:
//!
//! ```text
//!          interval
//!          |<-->|
//! points:  [ p0 ][ p1 ][ p2 ][ p3 ]
//!          ^                       ^
//!  end - len*interval             end (exclusive)
//! ```

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::dimensions::{self, Dimensions};
use crate::error::{Result, ValidationError};
use crate::schema::{SpanConfig, SpanSet};

/// Separator used inside store sort keys.
pub const KEY_SEPARATOR: char = '#';

/// One aggregated bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Number of observations merged into the bucket.
    pub count: u64,

    /// Sum of the merged observations.
    pub sum: f64,

    /// Smallest per-merge average seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    /// Largest per-merge average seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    /// Bounded reservoir of values for approximate percentiles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvalues: Option<Vec<f64>>,
}

impl Point {
    /// A point for a single observation.
    pub fn value(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            ..Self::default()
        }
    }

    /// A pre-aggregated point without extrema.
    pub fn aggregate(count: u64, sum: f64) -> Self {
        Self {
            count,
            sum,
            ..Self::default()
        }
    }

    /// Mean of the merged observations, `None` for an empty bucket.
    #[allow(clippy::cast_precision_loss)] // counts stay far below 2^52
    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// One resolution tier of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Seconds covered by the whole ring.
    pub period: u64,

    /// Maximum number of buckets.
    pub samples: u32,

    /// Exclusive upper boundary of the newest bucket, epoch seconds.
    /// Zero until the span receives its first bucket.
    pub end: u64,

    /// Buckets, oldest first. Never longer than `samples`.
    pub points: VecDeque<Point>,
}

impl Span {
    /// Creates an empty span for the given configuration.
    pub fn new(config: SpanConfig) -> Self {
        Self {
            period: config.period,
            samples: config.samples,
            end: 0,
            points: VecDeque::new(),
        }
    }

    /// The configuration this span was created with.
    pub fn config(&self) -> SpanConfig {
        SpanConfig {
            period: self.period,
            samples: self.samples,
        }
    }

    /// Width of one bucket in seconds.
    pub fn interval(&self) -> u64 {
        self.period / u64::from(self.samples.max(1))
    }

    /// Inclusive lower boundary of the oldest bucket.
    pub fn start(&self) -> u64 {
        self.end
            .saturating_sub(self.points.len() as u64 * self.interval())
    }

    /// Oldest timestamp the span can hold given its current `end`.
    pub fn window_start(&self) -> u64 {
        self.end.saturating_sub(self.period)
    }

    /// Whether `timestamp` can be placed in this span without being stale.
    ///
    /// A span that has never held a bucket accepts any timestamp.
    pub fn accepts(&self, timestamp: u64) -> bool {
        timestamp >= self.window_start()
    }

    /// Exclusive closing boundary of bucket `index`.
    pub fn closing(&self, index: usize) -> u64 {
        let after = (self.points.len() - index - 1) as u64;
        self.end.saturating_sub(after * self.interval())
    }

    /// Total observations across all buckets.
    pub fn total_count(&self) -> u64 {
        self.points.iter().map(|p| p.count).sum()
    }
}

/// Identity of a record in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    /// Owning account or tenant.
    pub owner: String,
    /// Metric namespace.
    pub namespace: String,
    /// Metric name.
    pub metric: String,
    /// Canonical dimension string (see [`dimensions::encode`]).
    pub dimensions: String,
}

impl RecordKey {
    /// Builds a key, encoding the dimensions canonically.
    pub fn new(owner: &str, namespace: &str, metric: &str, dims: &Dimensions) -> Self {
        Self {
            owner: owner.to_string(),
            namespace: namespace.to_string(),
            metric: metric.to_string(),
            dimensions: dimensions::encode(dims),
        }
    }

    /// Validates the names and dimensions that make up a key.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] for empty names, names containing the
    /// key separator, or unencodable dimensions.
    pub fn validate(owner: &str, namespace: &str, metric: &str, dims: &Dimensions) -> Result<()> {
        if owner.is_empty() {
            return Err(ValidationError::EmptyOwner.into());
        }
        if namespace.is_empty() {
            return Err(ValidationError::EmptyNamespace.into());
        }
        if metric.is_empty() {
            return Err(ValidationError::EmptyMetric.into());
        }
        for name in [namespace, metric] {
            if name.contains(KEY_SEPARATOR) {
                return Err(ValidationError::InvalidOption {
                    reason: format!("'{name}' must not contain '{KEY_SEPARATOR}'"),
                }
                .into());
            }
        }
        dimensions::validate(dims)
    }

    /// Sort key within the owner's partition: `namespace#metric#dimensions`.
    pub fn sort_key(&self) -> String {
        format!(
            "{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
            self.namespace, self.metric, self.dimensions
        )
    }

    /// Decoded dimension map.
    pub fn dimension_map(&self) -> Dimensions {
        dimensions::decode(&self.dimensions)
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.sort_key())
    }
}

/// Persisted state for one metric stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Owning account or tenant.
    pub owner: String,
    /// Metric namespace.
    pub namespace: String,
    /// Metric name.
    pub metric: String,
    /// Canonical dimension string.
    pub dimensions: String,
    /// Optimistic-concurrency token; advances by one per successful write.
    pub seq: u64,
    /// Epoch seconds after which the store may drop the record.
    pub expires: u64,
    /// Optional tag naming the emitting source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Resolution tiers, finest first.
    pub spans: Vec<Span>,
}

impl MetricRecord {
    /// Creates an empty record laid out per `spans`.
    pub fn new(key: &RecordKey, spans: &SpanSet) -> Self {
        Self {
            owner: key.owner.clone(),
            namespace: key.namespace.clone(),
            metric: key.metric.clone(),
            dimensions: key.dimensions.clone(),
            seq: 0,
            expires: 0,
            source: None,
            spans: spans.spans().iter().copied().map(Span::new).collect(),
        }
    }

    /// The record's store key.
    pub fn key(&self) -> RecordKey {
        RecordKey {
            owner: self.owner.clone(),
            namespace: self.namespace.clone(),
            metric: self.metric.clone(),
            dimensions: self.dimensions.clone(),
        }
    }

    /// The span layout stored in this record.
    pub fn span_configs(&self) -> Vec<SpanConfig> {
        self.spans.iter().map(Span::config).collect()
    }

    /// Whether the stored layout matches `spans`.
    pub fn matches_spans(&self, spans: &SpanSet) -> bool {
        self.span_configs() == spans.spans()
    }

    /// Total observations across all spans.
    pub fn total_count(&self) -> u64 {
        self.spans.iter().map(Span::total_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions::dimensions;

    #[test]
    fn test_span_geometry() {
        let mut span = Span::new(SpanConfig {
            period: 300,
            samples: 10,
        });
        assert_eq!(span.interval(), 30);
        assert!(span.accepts(1));

        span.end = 1_200;
        span.points.extend([Point::default(), Point::default(), Point::value(1.0)]);

        assert_eq!(span.start(), 1_110);
        assert_eq!(span.window_start(), 900);
        assert_eq!(span.closing(0), 1_140);
        assert_eq!(span.closing(2), 1_200);
        assert!(span.accepts(900));
        assert!(!span.accepts(899));
        assert_eq!(span.total_count(), 1);
    }

    #[test]
    fn test_record_key_sort_key() {
        let key = RecordKey::new(
            "acme",
            "api",
            "latency",
            &dimensions([("route", "/users"), ("method", "GET")]),
        );
        assert_eq!(key.sort_key(), "api#latency#method=GET,route=/users");
        assert_eq!(key.dimension_map()["route"], "/users");
    }

    #[test]
    fn test_record_key_validation() {
        let dims = Dimensions::new();
        assert!(RecordKey::validate("acme", "api", "latency", &dims).is_ok());
        assert!(RecordKey::validate("", "api", "latency", &dims).is_err());
        assert!(RecordKey::validate("acme", "", "latency", &dims).is_err());
        assert!(RecordKey::validate("acme", "api", "", &dims).is_err());
        assert!(RecordKey::validate("acme", "a#b", "latency", &dims).is_err());
    }

    #[test]
    fn test_record_json_round_trip_keeps_optional_fields() {
        let key = RecordKey::new("acme", "api", "latency", &dimensions([("host", "a")]));
        let mut record = MetricRecord::new(&key, &SpanSet::default());
        record.seq = 41;
        record.expires = 1_700_000_000;
        record.source = Some("collector".to_string());
        record.spans[0].end = 1_699_999_980;
        record.spans[0].points.push_back(Point {
            count: 3,
            sum: 12.5,
            min: Some(1.5),
            max: Some(7.0),
            pvalues: Some(vec![1.5, 4.0, 7.0]),
        });
        record.spans[0].points.push_back(Point::default());

        let json = serde_json::to_string(&record).unwrap();
        let decoded: MetricRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
    }
}
