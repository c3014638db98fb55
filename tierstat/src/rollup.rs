//! Rollup engine: ring insertion and cross-span aging.
//!
//! Every span of a [`MetricRecord`] is a ring of buckets. Writing a point
//! into span `i` may push old buckets out of the ring; each evicted bucket
//! that holds data is merged into span `i + 1` at the last second it covered.
//! Propagation only ever moves forward through the span array, so the chain
//! is driven by indices alone.
//!
//! # Emit path
//!
//! ```text
//! span 0 (30s)  [..][..][..][..]  <- point lands here, ring advances
//!                 |
//!                 +-- evicted bucket merged into
//! span 1 (5m)   [..][..][..]
//! ```
//!
//! # Reconciliation
//!
//! Rollups are lazy: nothing runs on a timer. Before a query reads span `k`,
//! [`RollupEngine::reconcile`] drains every span whose period is below the
//! query boundary into the next one, so span `k` holds all data recorded at
//! finer resolution. The drained record is the query's private copy.

use tracing::{debug, warn};

use crate::record::{MetricRecord, Point, Span};

/// Decimal places kept in stored sums.
const SUM_SCALE: f64 = 1_000_000.0;

/// Largest magnitude at which a scaled sum still rounds exactly.
const MAX_EXACT_SCALED: f64 = 9_007_199_254_740_992.0;

/// Applies points to records. Stateless apart from its settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollupEngine {
    /// Percentile reservoir size per bucket; `None` disables pvalues.
    p_resolution: Option<usize>,
    /// Emit per-bucket debug events.
    verbose: bool,
}

impl RollupEngine {
    /// Creates an engine. `p_resolution` of `None` or `Some(0)` disables
    /// percentile reservoirs.
    pub fn new(p_resolution: Option<usize>) -> Self {
        Self {
            p_resolution: p_resolution.filter(|&n| n > 0),
            verbose: false,
        }
    }

    /// Enables per-bucket debug events.
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Returns the percentile reservoir size, if enabled.
    pub fn p_resolution(&self) -> Option<usize> {
        self.p_resolution
    }

    /// Merges `point` into the span at `span_index`.
    ///
    /// On the emit path (`query_boundary` is `None`) the ring is advanced or
    /// extended backwards so that a bucket covers `timestamp`, evicted buckets
    /// cascade into the next span, and `point` is merged with [`set_point`].
    ///
    /// With `Some(boundary)`, every span whose period is below `boundary`
    /// (and that has a coarser span after it) is drained into the next span
    /// before the point is applied to the first span at or above it.
    ///
    /// A timestamp older than a span's window is handed to the next coarser
    /// span; past the coarsest span it is dropped without touching the record.
    ///
    /// [`set_point`]: RollupEngine::set_point
    pub fn add_value(
        &self,
        record: &mut MetricRecord,
        timestamp: u64,
        point: &Point,
        span_index: usize,
        query_boundary: Option<u64>,
    ) {
        let span_count = record.spans.len();
        let mut index = span_index;

        while index < span_count {
            let has_coarser = index + 1 < span_count;
            let reconciling =
                has_coarser && query_boundary.is_some_and(|b| record.spans[index].period < b);

            if reconciling {
                let occupied = record.spans[index].points.len();
                self.shift(record, index, occupied);
                index += 1;
                continue;
            }

            if !window_accepts(record, index, timestamp) {
                if has_coarser {
                    index += 1;
                    continue;
                }
                debug!(
                    key = %record.key(),
                    timestamp,
                    "dropping point older than the coarsest span"
                );
                return;
            }

            self.place(record, index, timestamp, point);
            return;
        }

        warn!(
            key = %record.key(),
            span_index,
            span_count,
            "span index out of range"
        );
        debug_assert!(span_index < span_count, "span index out of range");
    }

    /// Pulls all finer-span data into the first span whose period is at
    /// least `boundary`, and aligns that span's window to `timestamp`.
    ///
    /// Running it twice with the same arguments changes nothing the second time.
    pub fn reconcile(&self, record: &mut MetricRecord, timestamp: u64, boundary: u64) {
        self.add_value(record, timestamp, &Point::default(), 0, Some(boundary));
    }

    /// Merges `point` into bucket `index` of `span`.
    ///
    /// Empty points are ignored. Min and max track the per-merge average
    /// `sum / count`. With percentiles enabled the incoming reservoir (or the
    /// average when it has none) is appended and the oldest entries beyond the
    /// reservoir size are discarded.
    #[allow(clippy::cast_precision_loss)] // counts stay far below 2^52
    pub fn set_point(&self, span: &mut Span, index: usize, point: &Point) {
        if point.count == 0 {
            return;
        }

        let len = span.points.len();
        let Some(bucket) = span.points.get_mut(index) else {
            warn!(index, len, "bucket index out of range");
            debug_assert!(index < len, "bucket index out of range");
            return;
        };

        let average = point.sum / point.count as f64;
        bucket.min = Some(bucket.min.map_or(average, |m| m.min(average)));
        bucket.max = Some(bucket.max.map_or(average, |m| m.max(average)));

        if let Some(limit) = self.p_resolution {
            let reservoir = bucket.pvalues.get_or_insert_with(Vec::new);
            match &point.pvalues {
                Some(values) => reservoir.extend_from_slice(values),
                None => reservoir.push(average),
            }
            if reservoir.len() > limit {
                let excess = reservoir.len() - limit;
                reservoir.drain(..excess);
            }
        }

        bucket.sum = round_sum(bucket.sum + point.sum);
        bucket.count += point.count;
    }

    /// Places a point in span `index`, which is known to accept `timestamp`.
    #[allow(clippy::cast_possible_truncation)] // bucket counts are bounded by `samples`
    fn place(&self, record: &mut MetricRecord, index: usize, timestamp: u64, point: &Point) {
        let interval = record.spans[index].interval();
        let samples = u64::from(record.spans[index].samples);

        if record.spans[index].end == 0 {
            let span = &mut record.spans[index];
            span.end = align(timestamp, interval) + interval;
            span.points.push_back(Point::default());
        }

        let end = record.spans[index].end;
        if timestamp >= end {
            let advance = (timestamp - end) / interval + 1;
            let len = record.spans[index].points.len() as u64;
            let overflow = (len + advance).saturating_sub(samples).min(len);
            self.shift(record, index, overflow as usize);

            let span = &mut record.spans[index];
            if advance > samples {
                span.points.clear();
                span.end = align(timestamp, interval) + interval;
                span.points.push_back(Point::default());
            } else {
                for _ in 0..advance {
                    span.points.push_back(Point::default());
                    span.end += interval;
                }
            }
        }

        let span = &mut record.spans[index];
        let start = span.start();
        if timestamp < start {
            let prepend = (start - timestamp).div_ceil(interval);
            for _ in 0..prepend {
                span.points.push_front(Point::default());
            }
        }

        let len = span.points.len();
        let mut slot = ((timestamp - span.start()) / interval) as usize;
        if slot >= len {
            warn!(
                key = %record.key(),
                span = index,
                slot,
                len,
                "bucket index out of bounds, using newest bucket"
            );
            debug_assert!(slot < len, "bucket index out of bounds");
            slot = len - 1;
        }

        let span = &mut record.spans[index];
        if self.verbose {
            debug!(span = index, slot, end = span.end, count = point.count, "merging point");
        }
        self.set_point(span, slot, point);
        debug_assert!(span.points.len() <= span.samples as usize);
    }

    /// Evicts the `count` oldest buckets of span `index`, merging occupied
    /// ones into the next span at the last second they covered.
    fn shift(&self, record: &mut MetricRecord, index: usize, count: usize) {
        let has_coarser = index + 1 < record.spans.len();

        for _ in 0..count {
            let span = &mut record.spans[index];
            if span.points.is_empty() {
                break;
            }
            let closing = span.closing(0);
            let Some(bucket) = span.points.pop_front() else {
                break;
            };

            if bucket.count == 0 {
                continue;
            }
            if has_coarser {
                if self.verbose {
                    debug!(from = index, closing, count = bucket.count, "rolling bucket up");
                }
                self.add_value(record, closing.saturating_sub(1), &bucket, index + 1, None);
            } else if self.verbose {
                debug!(closing, count = bucket.count, "bucket aged out of coarsest span");
            }
        }
    }

    /// Index of the finest span whose window holds `timestamp`, or `None`
    /// if it is older than every span.
    pub fn resolve_span(record: &MetricRecord, timestamp: u64) -> Option<usize> {
        (0..record.spans.len()).find(|&index| window_accepts(record, index, timestamp))
    }
}

/// Whether span `index` can hold `timestamp`.
///
/// A span that has never held a bucket measures its window back from the
/// newest `end` of any span in the record, so old timestamps are not pulled
/// into it ahead of a coarser span. In a fresh record every span accepts.
fn window_accepts(record: &MetricRecord, index: usize, timestamp: u64) -> bool {
    let span = &record.spans[index];
    if span.end > 0 {
        return span.accepts(timestamp);
    }
    let anchor = record.spans.iter().map(|s| s.end).max().unwrap_or(0);
    timestamp >= anchor.saturating_sub(span.period)
}

/// Start of the interval-aligned slot containing `timestamp`.
fn align(timestamp: u64, interval: u64) -> u64 {
    timestamp - timestamp % interval
}

/// Rounds a stored sum to [`SUM_SCALE`] precision.
fn round_sum(value: f64) -> f64 {
    let scaled = value * SUM_SCALE;
    if scaled.is_finite() && scaled.abs() < MAX_EXACT_SCALED {
        scaled.round() / SUM_SCALE
    } else {
        value
    }
}
