//! Read-merge-write with optimistic concurrency.
//!
//! Every persisted change follows the same loop:
//!
//! 1. read the record (or start a new one)
//! 2. merge the point with the rollup engine
//! 3. write it back, conditional on the `seq` that was read
//!
//! A lost race re-reads and tries again after an exponential backoff. Only a
//! conditional-write collision is retried; every other store error is
//! returned to the caller.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::{BackoffPolicy, MetricsConfig, Verbosity};
use crate::error::{Result, StoreError};
use crate::record::{MetricRecord, Point, RecordKey};
use crate::rollup::RollupEngine;
use crate::schema::SpanSet;
use crate::store::MetricStore;
use crate::upgrade;

/// Largest `seq` before it wraps back to zero (2^53 - 1).
pub const SEQ_WRAP: u64 = 9_007_199_254_740_991;

/// Sequence number following `seq`.
pub fn next_seq(seq: u64) -> u64 {
    if seq >= SEQ_WRAP { 0 } else { seq + 1 }
}

/// Persists points for one metrics instance.
#[derive(Clone)]
pub struct Writer {
    store: Arc<dyn MetricStore>,
    engine: RollupEngine,
    spans: SpanSet,
    ttl: u64,
    source: Option<String>,
    backoff: BackoffPolicy,
    verbosity: Verbosity,
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("spans", &self.spans)
            .field("ttl", &self.ttl)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl Writer {
    /// Creates a writer from an instance configuration.
    pub fn new(store: Arc<dyn MetricStore>, config: &MetricsConfig) -> Self {
        Self {
            store,
            engine: RollupEngine::new(config.p_resolution)
                .with_verbose(config.verbosity.verbose()),
            spans: config.spans.clone(),
            ttl: config.ttl(),
            source: config.source.clone(),
            backoff: config.backoff.clone(),
            verbosity: config.verbosity,
        }
    }

    /// The rollup engine used for merges.
    pub fn engine(&self) -> &RollupEngine {
        &self.engine
    }

    /// Merges `point` at `timestamp` into the record for `key` and persists it.
    ///
    /// Records stored with a different span layout are upgraded first. After
    /// exhausting every attempt the merged record is returned even though it
    /// was not persisted; a warning is logged.
    ///
    /// # Errors
    ///
    /// Returns any store error other than a conditional-write collision.
    pub async fn write(&self, key: &RecordKey, timestamp: u64, point: &Point) -> Result<MetricRecord> {
        let record = self
            .commit(key, |stored| {
                let mut record = self.prepare(key, stored);
                let last = record.spans.len() - 1;
                let index = RollupEngine::resolve_span(&record, timestamp).unwrap_or(last);
                self.engine.add_value(&mut record, timestamp, point, index, None);
                record.expires = record.expires.max(timestamp.saturating_add(self.ttl));
                record
            })
            .await?;

        if self.verbosity.info() {
            info!(key = %key, seq = record.seq, timestamp, count = point.count, "wrote metric");
        }
        Ok(record)
    }

    /// Rewrites the stored record for `key` under the configured span layout.
    ///
    /// Returns `None` if no record exists. A record that already has the
    /// configured layout is returned without writing.
    ///
    /// # Errors
    ///
    /// Returns any store error other than a conditional-write collision.
    pub async fn upgrade(&self, key: &RecordKey) -> Result<Option<MetricRecord>> {
        match self.store.get(key).await? {
            None => Ok(None),
            Some(stored) if stored.matches_spans(&self.spans) => Ok(Some(stored)),
            Some(_) => {
                let record = self.commit(key, |stored| self.prepare(key, stored)).await?;
                if self.verbosity.info() {
                    info!(key = %key, seq = record.seq, "upgraded metric layout");
                }
                Ok(Some(record))
            }
        }
    }

    /// Starts from the stored record (upgraded if its layout is stale) or a
    /// fresh one.
    fn prepare(&self, key: &RecordKey, stored: Option<MetricRecord>) -> MetricRecord {
        let mut record = match stored {
            Some(stored) if stored.matches_spans(&self.spans) => stored,
            Some(stored) => upgrade::migrate(&stored, &self.spans, &self.engine),
            None => MetricRecord::new(key, &self.spans),
        };
        if self.source.is_some() {
            record.source.clone_from(&self.source);
        }
        record
    }

    /// Runs the read-apply-conditional-write loop.
    async fn commit<F>(&self, key: &RecordKey, apply: F) -> Result<MetricRecord>
    where
        F: Fn(Option<MetricRecord>) -> MetricRecord,
    {
        let attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let stored = self.store.get(key).await?;
            let expected = stored.as_ref().map(|r| r.seq);
            let mut record = apply(stored);
            record.seq = expected.map_or(0, next_seq);

            match self.store.put(&record, expected).await {
                Ok(()) => return Ok(record),
                Err(e) if e.is_condition_failed() => {
                    attempt += 1;
                    if attempt >= attempts {
                        warn!(key = %key, attempts, "conditional write retries exhausted, record not persisted");
                        return Ok(record);
                    }
                    let delay = self.backoff.delay_for_attempt(attempt - 1);
                    if self.verbosity.verbose() {
                        debug!(key = %key, attempt, ?delay, "write collision, retrying");
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(e @ StoreError::Throttled { .. }) => {
                    error!(key = %key, error = %e, "store throttled write");
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const T0: u64 = 1_700_000_100;

    fn setup(config: MetricsConfig) -> (Arc<MemoryStore>, Writer) {
        let store = Arc::new(MemoryStore::new());
        let writer = Writer::new(store.clone(), &config);
        (store, writer)
    }

    fn key() -> RecordKey {
        RecordKey::new("acme", "api", "latency", &Default::default())
    }

    #[test]
    fn test_seq_wraps() {
        assert_eq!(next_seq(0), 1);
        assert_eq!(next_seq(SEQ_WRAP - 1), SEQ_WRAP);
        assert_eq!(next_seq(SEQ_WRAP), 0);
    }

    #[tokio::test]
    async fn test_first_write_creates_record() {
        let (store, writer) = setup(MetricsConfig::new("acme").with_ttl(600).with_source("svc"));

        let record = writer.write(&key(), T0, &Point::value(10.0)).await.unwrap();

        assert_eq!(record.seq, 0);
        assert_eq!(record.expires, T0 + 600);
        assert_eq!(record.source.as_deref(), Some("svc"));
        let stored = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_seq_advances_per_write() {
        let (store, writer) = setup(MetricsConfig::new("acme"));

        for i in 0..3 {
            writer.write(&key(), T0 + i, &Point::value(1.0)).await.unwrap();
        }

        let stored = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(stored.seq, 2);
        assert_eq!(stored.total_count(), 3);
    }

    #[tokio::test]
    async fn test_collision_is_retried() {
        let config = MetricsConfig::new("acme").with_backoff(BackoffPolicy::immediate(10));
        let (store, writer) = setup(config);
        writer.write(&key(), T0, &Point::value(1.0)).await.unwrap();

        store.fail_next_puts(3);
        let record = writer.write(&key(), T0 + 1, &Point::value(1.0)).await.unwrap();

        assert_eq!(record.seq, 1);
        let stored = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(stored.total_count(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_unpersisted_record() {
        let config = MetricsConfig::new("acme").with_backoff(BackoffPolicy::immediate(4));
        let (store, writer) = setup(config);

        store.fail_next_puts(4);
        let record = writer.write(&key(), T0, &Point::value(5.0)).await.unwrap();

        assert_eq!(record.total_count(), 1);
        assert!(store.get(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_throttle_is_surfaced() {
        let (store, writer) = setup(MetricsConfig::new("acme"));

        store.throttle_next_puts(1);
        let err = writer.write(&key(), T0, &Point::value(5.0)).await.unwrap_err();

        assert!(matches!(
            err,
            crate::error::MetricsError::Store(StoreError::Throttled { .. })
        ));
    }

    #[tokio::test]
    async fn test_layout_change_upgrades_on_write() {
        let (store, old_writer) = setup(MetricsConfig::new("acme"));
        old_writer.write(&key(), T0, &Point::value(1.0)).await.unwrap();

        let spans = SpanSet::new(vec![crate::schema::SpanConfig::new(600, 20).unwrap()]).unwrap();
        let new_writer = Writer::new(store.clone(), &MetricsConfig::new("acme").with_spans(spans.clone()));
        let record = new_writer.write(&key(), T0 + 60, &Point::value(1.0)).await.unwrap();

        assert!(record.matches_spans(&spans));
        assert_eq!(record.seq, 1);
        assert_eq!(record.total_count(), 2);
    }

    #[tokio::test]
    async fn test_upgrade_rewrites_stale_layout_only() {
        let (store, old_writer) = setup(MetricsConfig::new("acme"));
        assert!(old_writer.upgrade(&key()).await.unwrap().is_none());

        old_writer.write(&key(), T0, &Point::value(4.0)).await.unwrap();
        let same = old_writer.upgrade(&key()).await.unwrap().unwrap();
        assert_eq!(same.seq, 0);

        let spans = SpanSet::new(vec![crate::schema::SpanConfig::new(3600, 12).unwrap()]).unwrap();
        let new_writer = Writer::new(store.clone(), &MetricsConfig::new("acme").with_spans(spans.clone()));
        let upgraded = new_writer.upgrade(&key()).await.unwrap().unwrap();

        assert_eq!(upgraded.seq, 1);
        assert!(upgraded.matches_spans(&spans));
        assert_eq!(upgraded.total_count(), 1);
        assert_eq!(store.get(&key()).await.unwrap().unwrap(), upgraded);
    }
}
