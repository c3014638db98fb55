//! In-memory store with conditional writes and TTL sweeping.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::{MetricStore, Page, StoreResult};
use crate::error::StoreError;
use crate::record::{MetricRecord, RecordKey};

/// Records keyed by `(owner, sort_key)`.
type Table = BTreeMap<(String, String), MetricRecord>;

/// Process-local store.
///
/// Keys are kept ordered so prefix scans and cursors are deterministic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Table>,
    /// Remaining puts to reject with a collision.
    collisions: AtomicU32,
    /// Remaining puts to reject as throttled.
    throttles: AtomicU32,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-loaded with `records`.
    pub fn from_records(records: impl IntoIterator<Item = MetricRecord>) -> Self {
        let table = records
            .into_iter()
            .map(|record| (table_key(&record.key()), record))
            .collect();
        Self {
            records: RwLock::new(table),
            ..Self::default()
        }
    }

    /// All records in key order.
    pub fn snapshot(&self) -> Vec<MetricRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Removes records whose expiration is before `now`. Returns how many
    /// were removed.
    pub fn expire(&self, now: u64) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| record.expires >= now);
        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, now, "expired records");
        }
        removed
    }

    /// Makes the next `n` puts fail with [`StoreError::ConditionFailed`]
    /// as if another writer had won each race.
    pub fn fail_next_puts(&self, n: u32) {
        self.collisions.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` puts fail with [`StoreError::Throttled`].
    pub fn throttle_next_puts(&self, n: u32) {
        self.throttles.store(n, Ordering::SeqCst);
    }

    /// Applies a conditional write synchronously. Returns the record it
    /// replaced.
    pub(crate) fn put_sync(
        &self,
        record: &MetricRecord,
        expected_seq: Option<u64>,
    ) -> StoreResult<Option<MetricRecord>> {
        let key = record.key();

        if take_one(&self.throttles) {
            return Err(StoreError::Throttled {
                message: format!("injected throttle for {key}"),
            });
        }
        if take_one(&self.collisions) {
            return Err(StoreError::ConditionFailed {
                key: key.to_string(),
            });
        }

        let mut records = self.records.write();
        let slot = table_key(&key);
        let current = records.get(&slot).map(|r| r.seq);

        if current != expected_seq {
            return Err(StoreError::ConditionFailed {
                key: key.to_string(),
            });
        }

        Ok(records.insert(slot, record.clone()))
    }

    /// Puts back the record that was stored under `key` before a write,
    /// removing the key if there was none.
    pub(crate) fn restore(&self, key: &RecordKey, previous: Option<MetricRecord>) {
        let mut records = self.records.write();
        let slot = table_key(key);
        match previous {
            Some(record) => {
                records.insert(slot, record);
            }
            None => {
                records.remove(&slot);
            }
        }
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn get(&self, key: &RecordKey) -> StoreResult<Option<MetricRecord>> {
        Ok(self.records.read().get(&table_key(key)).cloned())
    }

    async fn put(&self, record: &MetricRecord, expected_seq: Option<u64>) -> StoreResult<()> {
        self.put_sync(record, expected_seq).map(|_| ())
    }

    async fn query(
        &self,
        owner: &str,
        prefix: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> StoreResult<Page> {
        let records = self.records.read();

        let lower = match cursor {
            Some(after) => Bound::Excluded((owner.to_string(), after.to_string())),
            None => Bound::Included((owner.to_string(), prefix.to_string())),
        };

        let mut matches = records
            .range((lower, Bound::Unbounded))
            .take_while(|((o, sort_key), _)| o == owner && sort_key.starts_with(prefix))
            .map(|(_, record)| record);

        let items: Vec<MetricRecord> = matches.by_ref().take(limit).cloned().collect();
        let next = if matches.next().is_some() {
            items.last().map(|r| r.key().sort_key())
        } else {
            None
        };

        Ok(Page { items, next })
    }
}

fn table_key(key: &RecordKey) -> (String, String) {
    (key.owner.clone(), key.sort_key())
}

/// Decrements a fault counter, returning whether a fault was pending.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions::dimensions;
    use crate::schema::SpanSet;

    fn record(owner: &str, namespace: &str, metric: &str, host: &str) -> MetricRecord {
        let key = RecordKey::new(owner, namespace, metric, &dimensions([("host", host)]));
        MetricRecord::new(&key, &SpanSet::default())
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let store = MemoryStore::new();
        let mut rec = record("acme", "api", "latency", "a");

        store.put(&rec, None).await.unwrap();
        let err = store.put(&rec, None).await.unwrap_err();
        assert!(err.is_condition_failed());

        rec.seq = 1;
        store.put(&rec, Some(0)).await.unwrap();
        let err = store.put(&rec, Some(0)).await.unwrap_err();
        assert!(err.is_condition_failed());

        let stored = store.get(&rec.key()).await.unwrap().unwrap();
        assert_eq!(stored.seq, 1);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let store = MemoryStore::new();
        let rec = record("acme", "api", "latency", "a");

        store.fail_next_puts(2);
        assert!(store.put(&rec, None).await.unwrap_err().is_condition_failed());
        assert!(store.put(&rec, None).await.unwrap_err().is_condition_failed());
        store.put(&rec, None).await.unwrap();

        store.throttle_next_puts(1);
        let err = store.put(&rec, Some(0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Throttled { .. }));
    }

    #[tokio::test]
    async fn test_prefix_query_paginates() {
        let store = MemoryStore::from_records([
            record("acme", "api", "latency", "a"),
            record("acme", "api", "latency", "b"),
            record("acme", "api", "errors", "a"),
            record("acme", "db", "latency", "a"),
            record("other", "api", "latency", "a"),
        ]);

        let first = store.query("acme", "api#", 2, None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[0].metric, "errors");
        let cursor = first.next.clone().unwrap();

        let second = store.query("acme", "api#", 2, Some(&cursor)).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].dimensions, "host=b");
        assert!(second.next.is_none());

        let all = store.query("acme", "", 100, None).await.unwrap();
        assert_eq!(all.items.len(), 4);
    }

    #[tokio::test]
    async fn test_expire_removes_old_records() {
        let mut old = record("acme", "api", "latency", "a");
        old.expires = 100;
        let mut fresh = record("acme", "api", "latency", "b");
        fresh.expires = 1_000;
        let store = MemoryStore::from_records([old, fresh]);

        assert_eq!(store.expire(500), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.snapshot()[0].dimensions, "host=b");
    }
}
