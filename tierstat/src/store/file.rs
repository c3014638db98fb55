//! JSON snapshot store for single-process use.
//!
//! The whole table lives in memory and is rewritten to disk after every
//! successful put:
//!
//! ```text
//! metrics.json       <- array of records, key order
//! metrics.json.tmp   <- written first, then renamed over metrics.json
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{MemoryStore, MetricStore, Page, StoreResult};
use crate::error::StoreError;
use crate::record::{MetricRecord, RecordKey};

/// A [`MemoryStore`] persisted to a JSON file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
    /// Serializes table changes with their snapshot writes, so memory and
    /// disk never disagree after a failed write.
    persist_lock: Mutex<()>,
}

impl FileStore {
    /// Opens the store at `path`, loading existing records if the file exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file cannot be read, or
    /// [`StoreError::Serialization`] if it is not a valid snapshot.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        let records: Vec<MetricRecord> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };

        debug!(path = %path.display(), records = records.len(), "opened file store");

        Ok(Self {
            path,
            inner: MemoryStore::from_records(records),
            persist_lock: Mutex::new(()),
        })
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records in key order.
    pub fn snapshot(&self) -> Vec<MetricRecord> {
        self.inner.snapshot()
    }

    /// Removes records that expired before `now` and persists the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub async fn expire(&self, now: u64) -> StoreResult<usize> {
        let _guard = self.persist_lock.lock().await;
        let removed = self.inner.expire(now);
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Writes the current table to disk. Callers hold `persist_lock`.
    async fn persist(&self) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(&self.inner.snapshot())?;
        let tmp = self.path.with_extension("json.tmp");
        let io_error = |source| StoreError::Io {
            path: self.path.display().to_string(),
            source,
        };

        tokio::fs::write(&tmp, json).await.map_err(io_error)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_error)?;
        Ok(())
    }
}

#[async_trait]
impl MetricStore for FileStore {
    async fn get(&self, key: &RecordKey) -> StoreResult<Option<MetricRecord>> {
        self.inner.get(key).await
    }

    async fn put(&self, record: &MetricRecord, expected_seq: Option<u64>) -> StoreResult<()> {
        let _guard = self.persist_lock.lock().await;
        let previous = self.inner.put_sync(record, expected_seq)?;

        if let Err(e) = self.persist().await {
            self.inner.restore(&record.key(), previous);
            warn!(key = %record.key(), error = %e, "snapshot write failed, put rolled back");
            return Err(e);
        }
        Ok(())
    }

    async fn query(
        &self,
        owner: &str,
        prefix: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> StoreResult<Page> {
        self.inner.query(owner, prefix, limit, cursor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Point;
    use crate::schema::SpanSet;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.json");

        let key = RecordKey::new("acme", "api", "latency", &Default::default());
        let mut record = MetricRecord::new(&key, &SpanSet::default());
        record.spans[0].end = 1_700_000_130;
        record.spans[0].points.push_back(Point {
            count: 2,
            sum: 3.5,
            min: Some(1.0),
            max: Some(2.5),
            pvalues: Some(vec![1.0, 2.5]),
        });
        record.source = Some("cli".to_string());

        {
            let store = FileStore::open(&path).await.unwrap();
            store.put(&record, None).await.unwrap();
        }

        let reopened = FileStore::open(&path).await.unwrap();
        let loaded = reopened.get(&key).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = FileStore::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_failed_put_does_not_touch_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.json");
        let store = FileStore::open(&path).await.unwrap();

        let key = RecordKey::new("acme", "api", "latency", &Default::default());
        let record = MetricRecord::new(&key, &SpanSet::default());
        let err = store.put(&record, Some(3)).await.unwrap_err();

        assert!(err.is_condition_failed());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_unwritable_snapshot_rolls_back_put() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("metrics.json");
        let store = FileStore::open(&path).await.unwrap();

        let key = RecordKey::new("acme", "api", "latency", &Default::default());
        let record = MetricRecord::new(&key, &SpanSet::default());
        let err = store.put(&record, None).await.unwrap_err();

        assert!(matches!(err, StoreError::Io { .. }));
        assert!(store.get(&key).await.unwrap().is_none());
        assert!(store.snapshot().is_empty());

        // The key is still free for a create-only write once disk is back.
        std::fs::create_dir(dir.path().join("missing")).unwrap();
        store.put(&record, None).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_unwritable_snapshot_restores_previous_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.json");
        let store = FileStore::open(&path).await.unwrap();

        let key = RecordKey::new("acme", "api", "latency", &Default::default());
        let record = MetricRecord::new(&key, &SpanSet::default());
        store.put(&record, None).await.unwrap();

        // A directory squatting on the temp path makes the next write fail.
        std::fs::create_dir(path.with_extension("json.tmp")).unwrap();
        let mut next = record.clone();
        next.seq = 1;
        assert!(store.put(&next, Some(0)).await.is_err());

        assert_eq!(store.get(&key).await.unwrap().unwrap().seq, 0);
    }
}
