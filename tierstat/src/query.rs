//! Query evaluation over a stored record.
//!
//! A query picks one span of the record, reconciles a private copy so that
//! span holds everything recorded at finer resolution, and then either
//! summarizes the whole span into one value ([`accumulate_metric`]) or reports
//! one value per bucket ([`calculate_series`]).
//!
//! # Span selection
//!
//! | request                       | span used                              |
//! |-------------------------------|----------------------------------------|
//! | `period` only                 | finest span with `span.period >= period` |
//! | `period` above every span     | coarsest span, reported period clamped  |
//! | `start` given                 | finest span whose window holds `start`  |
//!
//! Percentiles are approximate: they are read from the bounded per-bucket
//! reservoirs with a nearest-rank rule.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dimensions::Dimensions;
use crate::error::{QueryError, Result};
use crate::record::{MetricRecord, Point, RecordKey, Span};
use crate::rollup::RollupEngine;

/// Value computed from each bucket (or from the whole span).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Statistic {
    /// Sum of observations.
    Sum,
    /// Mean of observations.
    Avg,
    /// Smallest merged average.
    Min,
    /// Largest merged average.
    Max,
    /// Number of observations.
    Count,
    /// Mean of the newest non-empty bucket.
    Current,
    /// Approximate percentile, `0..=100`.
    Percentile(u32),
}

impl FromStr for Statistic {
    type Err = QueryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let statistic = match s.to_ascii_lowercase().as_str() {
            "sum" => Self::Sum,
            "avg" | "average" => Self::Avg,
            "min" => Self::Min,
            "max" => Self::Max,
            "count" => Self::Count,
            "current" => Self::Current,
            other => {
                let percentile = other
                    .strip_prefix('p')
                    .and_then(|n| n.parse::<u32>().ok())
                    .ok_or_else(|| QueryError::UnknownStatistic {
                        name: s.to_string(),
                    })?;
                Self::Percentile(percentile)
            }
        };
        statistic.validate()?;
        Ok(statistic)
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sum => write!(f, "sum"),
            Self::Avg => write!(f, "avg"),
            Self::Min => write!(f, "min"),
            Self::Max => write!(f, "max"),
            Self::Count => write!(f, "count"),
            Self::Current => write!(f, "current"),
            Self::Percentile(n) => write!(f, "p{n}"),
        }
    }
}

impl TryFrom<String> for Statistic {
    type Error = QueryError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Statistic> for String {
    fn from(statistic: Statistic) -> Self {
        statistic.to_string()
    }
}

impl Statistic {
    /// Rejects percentiles above 100.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::PercentileOutOfRange`].
    pub fn validate(self) -> std::result::Result<(), QueryError> {
        match self {
            Self::Percentile(percentile) if percentile > 100 => {
                Err(QueryError::PercentileOutOfRange { percentile })
            }
            _ => Ok(()),
        }
    }
}

/// Optional query parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Summarize the span into a single point instead of a series.
    pub accumulate: bool,
    /// Start of the query window; defaults to `now - period`.
    pub start: Option<u64>,
    /// Evaluate as of this time instead of the clock.
    pub timestamp: Option<u64>,
}

impl QueryOptions {
    /// Options for a single summarized value.
    pub fn accumulate() -> Self {
        Self {
            accumulate: true,
            ..Self::default()
        }
    }

    /// Sets the window start.
    #[must_use]
    pub fn with_start(mut self, start: u64) -> Self {
        self.start = Some(start);
        self
    }

    /// Sets the evaluation time.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// One output value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Closing boundary of the bucket, never later than "now".
    pub timestamp: u64,
    /// The statistic's value; zero for empty buckets.
    pub value: f64,
    /// Observations behind the value.
    pub count: u64,
}

/// Query output with the metadata of the span it was read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Owning account or tenant.
    pub owner: String,
    /// Metric namespace.
    pub namespace: String,
    /// Metric name.
    pub metric: String,
    /// Decoded dimensions.
    pub dimensions: Dimensions,
    /// Statistic that was computed.
    pub statistic: Statistic,
    /// Effective query period in seconds.
    pub period: u64,
    /// Bucket count of the span read; zero when the record does not exist.
    pub samples: u32,
    /// Output points, oldest first. A single point when accumulating.
    pub points: Vec<SeriesPoint>,
}

impl QueryResult {
    fn empty(key: &RecordKey, statistic: Statistic, period: u64) -> Self {
        Self {
            owner: key.owner.clone(),
            namespace: key.namespace.clone(),
            metric: key.metric.clone(),
            dimensions: key.dimension_map(),
            statistic,
            period,
            samples: 0,
            points: Vec::new(),
        }
    }

    /// The single accumulated value, or the newest series value.
    pub fn value(&self) -> Option<f64> {
        self.points.last().map(|p| p.value)
    }

    /// Observations across all points.
    pub fn count(&self) -> u64 {
        self.points.iter().map(|p| p.count).sum()
    }
}

/// Picks the span to read. Returns the span index and the reported period.
pub fn select_span(record: &MetricRecord, period: u64, start: Option<u64>) -> (usize, u64) {
    let last = record.spans.len() - 1;

    if let Some(start) = start {
        let index = RollupEngine::resolve_span(record, start).unwrap_or(last);
        return (index, period.min(record.spans[index].period));
    }

    match record.spans.iter().position(|span| span.period >= period) {
        Some(index) => (index, period),
        None => (last, record.spans[last].period),
    }
}

/// Evaluates a query against `record` as of `now`.
///
/// The record is reconciled on a private copy; the caller's record is not
/// modified. A missing record yields an empty result.
///
/// # Errors
///
/// Returns [`QueryError`] for a zero period or an out-of-range percentile.
pub fn evaluate(
    engine: &RollupEngine,
    key: &RecordKey,
    record: Option<&MetricRecord>,
    period: u64,
    statistic: Statistic,
    options: QueryOptions,
    now: u64,
) -> Result<QueryResult> {
    if period == 0 {
        return Err(QueryError::ZeroPeriod.into());
    }
    statistic.validate()?;

    let Some(record) = record.filter(|r| !r.spans.is_empty()) else {
        return Ok(QueryResult::empty(key, statistic, period));
    };

    let (index, period) = select_span(record, period, options.start);
    let boundary = record.spans[index].period;
    let mut reconciled = record.clone();
    engine.reconcile(&mut reconciled, now, boundary);
    let span = &reconciled.spans[index];

    let points = if options.accumulate {
        let summary = accumulate_metric(span);
        vec![SeriesPoint {
            timestamp: now,
            value: summary.value(statistic),
            count: summary.count,
        }]
    } else {
        calculate_series(span, statistic, period, options.start, now)
    };

    let mut result = QueryResult::empty(key, statistic, period);
    result.samples = span.samples;
    result.points = points;
    Ok(result)
}

/// Running totals for one or more buckets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    /// Observations.
    pub count: u64,
    /// Sum of observations.
    pub sum: f64,
    /// Smallest bucket minimum.
    pub min: Option<f64>,
    /// Largest bucket maximum.
    pub max: Option<f64>,
    /// Mean of the newest non-empty bucket.
    pub current: Option<f64>,
    /// Pooled percentile reservoirs.
    pub pvalues: Vec<f64>,
}

impl Summary {
    /// Folds one bucket in. Buckets must arrive oldest first.
    pub fn add(&mut self, point: &Point) {
        let Some(average) = point.average() else {
            return;
        };
        let low = point.min.unwrap_or(average);
        let high = point.max.unwrap_or(average);

        self.count += point.count;
        self.sum += point.sum;
        self.min = Some(self.min.map_or(low, |m| m.min(low)));
        self.max = Some(self.max.map_or(high, |m| m.max(high)));
        self.current = Some(average);
        if let Some(values) = &point.pvalues {
            self.pvalues.extend_from_slice(values);
        }
    }

    /// The statistic's value; zero when there is nothing to compute it from.
    #[allow(clippy::cast_precision_loss)] // counts stay far below 2^52
    pub fn value(&self, statistic: Statistic) -> f64 {
        match statistic {
            Statistic::Sum => self.sum,
            Statistic::Count => self.count as f64,
            Statistic::Avg if self.count > 0 => self.sum / self.count as f64,
            Statistic::Avg => 0.0,
            Statistic::Min => self.min.unwrap_or(0.0),
            Statistic::Max => self.max.unwrap_or(0.0),
            Statistic::Current => self.current.unwrap_or(0.0),
            Statistic::Percentile(n) => percentile(&self.pvalues, n).unwrap_or(0.0),
        }
    }
}

/// Nearest-rank percentile: sorted index `min(round(len * n / 100 + 1), len - 1)`.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn percentile(values: &[f64], n: u32) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let len = sorted.len();
    let rank = (len as f64 * f64::from(n) / 100.0 + 1.0).round() as usize;
    Some(sorted[rank.min(len - 1)])
}

/// Folds every bucket of `span` into one summary.
pub fn accumulate_metric(span: &Span) -> Summary {
    let mut summary = Summary::default();
    for point in &span.points {
        summary.add(point);
    }
    summary
}

/// One point per bucket overlapping the query window.
///
/// The window opens at `start` (default `now - period`). Missing buckets
/// before the first stored one are zero-filled, and zero points are appended
/// until the series holds `ceil(period / interval)` points; when more slots
/// overlap the window the oldest are dropped. Timestamps are bucket closing
/// boundaries clamped to `now`.
#[allow(clippy::cast_possible_truncation)] // bounded by the span's sample count
pub fn calculate_series(
    span: &Span,
    statistic: Statistic,
    period: u64,
    start: Option<u64>,
    now: u64,
) -> Vec<SeriesPoint> {
    let interval = span.interval();
    let window_start = start.unwrap_or_else(|| now.saturating_sub(period));
    let wanted = period.div_ceil(interval) as usize;

    let zero = |closing: u64| SeriesPoint {
        timestamp: closing.min(now),
        value: 0.0,
        count: 0,
    };

    let mut series = Vec::with_capacity(wanted);
    let mut opening = window_start - window_start % interval;

    if !span.points.is_empty() {
        while opening < span.start() && series.len() < wanted {
            series.push(zero(opening + interval));
            opening += interval;
        }
    }

    for (index, point) in span.points.iter().enumerate() {
        let closing = span.closing(index);
        if closing <= window_start {
            continue;
        }
        let mut summary = Summary::default();
        summary.add(point);
        series.push(SeriesPoint {
            timestamp: closing.min(now),
            value: summary.value(statistic),
            count: summary.count,
        });
        opening = closing;
    }

    while series.len() < wanted {
        series.push(zero(opening + interval));
        opening += interval;
    }

    // An unaligned window overlaps one slot more than it spans.
    if series.len() > wanted {
        let excess = series.len() - wanted;
        series.drain(..excess);
    }

    series
}
