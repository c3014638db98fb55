//! Persistence for metric records.
//!
//! The core only needs three things from a backing store:
//!
//! - point reads by [`RecordKey`]
//! - conditional writes guarded by the record's `seq`
//! - prefix scans over an owner's sort keys, paginated with an opaque cursor
//!
//! [`MemoryStore`] keeps records in process memory; [`FileStore`] adds a JSON
//! snapshot on disk so state survives between CLI invocations.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::record::{MetricRecord, RecordKey};

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One page of a prefix scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Records in ascending sort-key order.
    pub items: Vec<MetricRecord>,
    /// Cursor for the next page, `None` when the scan is complete.
    pub next: Option<String>,
}

/// Backing store collaborator.
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Reads a record, `None` if absent.
    async fn get(&self, key: &RecordKey) -> StoreResult<Option<MetricRecord>>;

    /// Writes `record` if the stored sequence number equals `expected_seq`.
    ///
    /// `None` means the record must not exist yet. A mismatch fails with
    /// [`StoreError::ConditionFailed`] and leaves the store unchanged.
    async fn put(&self, record: &MetricRecord, expected_seq: Option<u64>) -> StoreResult<()>;

    /// Lists up to `limit` records of `owner` whose sort key starts with
    /// `prefix`, beginning after `cursor`.
    async fn query(
        &self,
        owner: &str,
        prefix: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> StoreResult<Page>;
}
