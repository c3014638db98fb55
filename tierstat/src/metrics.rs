//! The `Metrics` handle: emit, query, flush and discovery for one owner.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::buffer::{Buffer, BufferPolicy, PendingWrite};
use crate::clock::{Clock, SystemClock};
use crate::config::MetricsConfig;
use crate::dimensions::Dimensions;
use crate::error::{Result, ValidationError};
use crate::listing::{self, MetricList};
use crate::query::{self, QueryOptions, QueryResult, Statistic};
use crate::record::{MetricRecord, Point, RecordKey};
use crate::store::MetricStore;
use crate::writer::Writer;

/// Optional emit parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmitOptions {
    /// Buffer the value under this policy instead of writing it immediately.
    /// Falls back to the configured default policy.
    pub buffer: Option<BufferPolicy>,
    /// Record the value at this time instead of the clock.
    pub timestamp: Option<u64>,
}

impl EmitOptions {
    /// Buffers the value under `policy`.
    #[must_use]
    pub fn with_buffer(mut self, policy: BufferPolicy) -> Self {
        self.buffer = Some(policy);
        self
    }

    /// Records the value at `timestamp`.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// A metrics instance bound to one owner, store and configuration.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use tierstat::{Metrics, MetricsConfig, EmitOptions, QueryOptions, Statistic};
/// use tierstat::clock::MockClock;
/// use tierstat::store::MemoryStore;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let clock = Arc::new(MockClock::new(1_700_000_100));
/// let metrics = Metrics::new(MetricsConfig::new("acme"), Arc::new(MemoryStore::new()), clock)?;
///
/// metrics.emit("api", "latency", 12.5, &[], EmitOptions::default()).await?;
/// let result = metrics
///     .query("api", "latency", &Default::default(), 300, Statistic::Sum, QueryOptions::accumulate())
///     .await?;
/// assert_eq!(result.value(), Some(12.5));
/// # Ok(())
/// # }
/// ```
pub struct Metrics {
    config: MetricsConfig,
    store: Arc<dyn MetricStore>,
    clock: Arc<dyn Clock>,
    writer: Writer,
    buffer: Buffer,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("owner", &self.config.owner)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Creates an instance.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `config` is invalid.
    pub fn new(config: MetricsConfig, store: Arc<dyn MetricStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let writer = Writer::new(Arc::clone(&store), &config);
        let buffer = Buffer::new(config.spans.finest().interval());
        Ok(Self {
            config,
            store,
            clock,
            writer,
            buffer,
        })
    }

    /// Creates an instance on the system clock.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `config` is invalid.
    pub fn with_system_clock(config: MetricsConfig, store: Arc<dyn MetricStore>) -> Result<Self> {
        Self::new(config, store, Arc::new(SystemClock))
    }

    /// The instance configuration.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Number of buffer entries currently held.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn key(&self, namespace: &str, metric: &str, dimensions: &Dimensions) -> Result<RecordKey> {
        RecordKey::validate(&self.config.owner, namespace, metric, dimensions)?;
        Ok(RecordKey::new(&self.config.owner, namespace, metric, dimensions))
    }

    /// Records `value` once for every dimension set in `dimensions`. An empty
    /// slice records it under the empty dimension set.
    ///
    /// Returns the records written. Buffered values that did not trigger a
    /// write produce no record.
    ///
    /// # Errors
    ///
    /// Returns a validation error before any I/O for a non-finite value, an
    /// invalid name, dimension or buffer policy. Store errors other than
    /// write collisions are returned as they occur.
    pub async fn emit(
        &self,
        namespace: &str,
        metric: &str,
        value: f64,
        dimensions: &[Dimensions],
        options: EmitOptions,
    ) -> Result<Vec<MetricRecord>> {
        if !value.is_finite() {
            return Err(ValidationError::InvalidValue {
                value,
                reason: "value must be finite".to_string(),
            }
            .into());
        }

        let empty = [Dimensions::new()];
        let sets = if dimensions.is_empty() { &empty[..] } else { dimensions };
        let keys = sets
            .iter()
            .map(|dims| self.key(namespace, metric, dims))
            .collect::<Result<Vec<_>>>()?;

        let policy = options.buffer.or_else(|| self.config.buffer.clone());
        if let Some(policy) = &policy {
            policy.validate()?;
        }

        let timestamp = options.timestamp.unwrap_or_else(|| self.clock.now());
        let point = Point::value(value);
        let mut written = Vec::new();

        for key in &keys {
            match &policy {
                Some(policy) => {
                    if let Some(pending) = self.buffer.buffer_metric(key, &point, policy, timestamp) {
                        written.push(self.write_pending(&pending).await?);
                    }
                }
                None => written.push(self.writer.write(key, timestamp, &point).await?),
            }
        }

        Ok(written)
    }

    /// Reads one statistic for a metric stream.
    ///
    /// Any locally buffered data for the stream is written first so the query
    /// sees this process's own emits.
    ///
    /// # Errors
    ///
    /// Returns validation or query errors for bad parameters, and store errors
    /// from the flush or read.
    pub async fn query(
        &self,
        namespace: &str,
        metric: &str,
        dimensions: &Dimensions,
        period: u64,
        statistic: Statistic,
        options: QueryOptions,
    ) -> Result<QueryResult> {
        let key = self.key(namespace, metric, dimensions)?;

        if let Some(pending) = self.buffer.take(&key) {
            self.write_pending(&pending).await?;
        }

        let record = self.store.get(&key).await?;
        let now = options.timestamp.unwrap_or_else(|| self.clock.now());
        let result = query::evaluate(
            self.writer.engine(),
            &key,
            record.as_ref(),
            period,
            statistic,
            options,
            now,
        )?;

        if self.config.verbosity.info() {
            info!(
                key = %key,
                %statistic,
                period = result.period,
                points = result.points.len(),
                "queried metric"
            );
        }
        Ok(result)
    }

    /// Writes every buffered entry and clears the buffer. Returns the number
    /// of writes performed.
    ///
    /// Every entry is attempted even if an earlier one fails. Entries whose
    /// write fails stay buffered for the next flush.
    ///
    /// # Errors
    ///
    /// Returns the first store error encountered.
    pub async fn flush(&self) -> Result<usize> {
        let pending = self.buffer.drain();
        let mut first_error = None;
        let mut written = 0;

        for write in &pending {
            match self.write_pending(write).await {
                Ok(_) => written += 1,
                Err(e) => {
                    error!(key = %write.key, error = %e, "failed to flush buffered metric");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Lists namespaces, metrics under `namespace`, and dimension sets under
    /// `namespace` + `metric`.
    ///
    /// # Errors
    ///
    /// Returns any store error.
    pub async fn get_metric_list(&self, namespace: Option<&str>, metric: Option<&str>) -> Result<MetricList> {
        let keys = listing::list_keys(self.store.as_ref(), &self.config.owner, namespace, metric).await?;
        Ok(listing::group(&keys, namespace, metric))
    }

    /// Migrates a stored record to the configured span layout.
    ///
    /// # Errors
    ///
    /// Returns validation errors for bad names and any store error.
    pub async fn upgrade(&self, namespace: &str, metric: &str, dimensions: &Dimensions) -> Result<Option<MetricRecord>> {
        let key = self.key(namespace, metric, dimensions)?;
        self.writer.upgrade(&key).await
    }

    /// Reads a stored record without reconciling it.
    ///
    /// # Errors
    ///
    /// Returns validation errors for bad names and any store error.
    pub async fn record(&self, namespace: &str, metric: &str, dimensions: &Dimensions) -> Result<Option<MetricRecord>> {
        let key = self.key(namespace, metric, dimensions)?;
        Ok(self.store.get(&key).await?)
    }

    /// Writes a buffered point, returning it to the buffer if the store
    /// rejects it.
    async fn write_pending(&self, pending: &PendingWrite) -> Result<MetricRecord> {
        match self.writer.write(&pending.key, pending.timestamp, &pending.point).await {
            Ok(record) => Ok(record),
            Err(e) => {
                self.buffer.restore(pending);
                warn!(
                    key = %pending.key,
                    count = pending.point.count,
                    error = %e,
                    "buffered write failed, kept for retry"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::dimensions::dimensions;
    use crate::error::MetricsError;
    use crate::store::MemoryStore;

    const T0: u64 = 1_700_000_100;

    fn metrics(config: MetricsConfig) -> (Arc<MemoryStore>, Metrics) {
        let store = Arc::new(MemoryStore::new());
        let metrics = Metrics::new(config, store.clone(), Arc::new(MockClock::new(T0))).unwrap();
        (store, metrics)
    }

    #[tokio::test]
    async fn test_emit_validates_before_io() {
        let (store, metrics) = metrics(MetricsConfig::new("acme"));

        let err = metrics
            .emit("api", "latency", f64::NAN, &[], EmitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MetricsError::Validation(ValidationError::InvalidValue { .. })));

        let err = metrics
            .emit("", "latency", 1.0, &[], EmitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MetricsError::Validation(ValidationError::EmptyNamespace)));

        let bad_dims = [dimensions([("host", "a")]), dimensions([("", "b")])];
        assert!(metrics.emit("api", "latency", 1.0, &bad_dims, EmitOptions::default()).await.is_err());

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_emit_fans_out_over_dimension_sets() {
        let (store, metrics) = metrics(MetricsConfig::new("acme"));
        let sets = [dimensions([("host", "a")]), dimensions([("host", "b")]), Dimensions::new()];

        let written = metrics
            .emit("api", "requests", 1.0, &sets, EmitOptions::default())
            .await
            .unwrap();

        assert_eq!(written.len(), 3);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_query_flushes_own_buffer() {
        let config = MetricsConfig::new("acme").with_buffer(BufferPolicy::default().with_count(100));
        let (store, metrics) = metrics(config);

        for _ in 0..5 {
            let written = metrics
                .emit("api", "hits", 2.0, &[], EmitOptions::default())
                .await
                .unwrap();
            assert!(written.is_empty());
        }
        assert!(store.is_empty());

        let result = metrics
            .query("api", "hits", &Dimensions::new(), 3_600, Statistic::Sum, QueryOptions::accumulate())
            .await
            .unwrap();
        assert_eq!(result.value(), Some(10.0));
        assert_eq!(result.count(), 5);
        assert_eq!(metrics.buffered(), 0);
    }

    #[tokio::test]
    async fn test_flush_writes_all_entries() {
        let config = MetricsConfig::new("acme").with_buffer(BufferPolicy::default().with_count(100));
        let (store, metrics) = metrics(config);

        metrics.emit("api", "a", 1.0, &[], EmitOptions::default()).await.unwrap();
        metrics.emit("api", "b", 1.0, &[], EmitOptions::default()).await.unwrap();

        assert_eq!(metrics.flush().await.unwrap(), 2);
        assert_eq!(store.len(), 2);
        assert_eq!(metrics.flush().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_throttled_flush_keeps_observations() {
        let config = MetricsConfig::new("acme").with_buffer(BufferPolicy::default().with_count(100));
        let (store, metrics) = metrics(config);

        for _ in 0..5 {
            metrics.emit("api", "hits", 1.0, &[], EmitOptions::default()).await.unwrap();
        }

        store.throttle_next_puts(1);
        let err = metrics.flush().await.unwrap_err();
        assert!(matches!(err, MetricsError::Store(crate::error::StoreError::Throttled { .. })));
        assert!(store.is_empty());
        assert_eq!(metrics.buffered(), 1);

        assert_eq!(metrics.flush().await.unwrap(), 1);
        let record = store
            .get(&RecordKey::new("acme", "api", "hits", &Dimensions::new()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.total_count(), 5);
    }

    #[tokio::test]
    async fn test_throttled_trigger_keeps_observations() {
        let config = MetricsConfig::new("acme").with_buffer(BufferPolicy::default().with_count(3));
        let (store, metrics) = metrics(config);

        for _ in 0..2 {
            metrics.emit("api", "hits", 1.0, &[], EmitOptions::default()).await.unwrap();
        }
        store.throttle_next_puts(1);
        assert!(metrics.emit("api", "hits", 1.0, &[], EmitOptions::default()).await.is_err());

        // The next observation trips the count threshold again with all four.
        let written = metrics
            .emit("api", "hits", 1.0, &[], EmitOptions::default())
            .await
            .unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].total_count(), 4);
    }
}
