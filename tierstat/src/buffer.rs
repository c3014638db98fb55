//! Process-local pre-aggregation of raw observations.
//!
//! Emitting every observation straight to the store costs one conditional
//! write each. A [`Buffer`] instead sums observations per record key and hands
//! back a single aggregated point once a [`BufferPolicy`] trigger fires.
//!
//! The buffer never performs I/O itself: callers receive [`PendingWrite`]s and
//! pass them to the writer, so no lock is held while the store is awaited.
//!
//! Buffered data lives only in memory. Anything not flushed before the process
//! exits is lost.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, ValidationError};
use crate::record::{Point, RecordKey};

/// When a buffered entry is written out.
///
/// Triggers are checked after each observation, in field order: `force`,
/// `sum`, `count`, then the elapsed deadline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPolicy {
    /// Write once the accumulated sum reaches this value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,

    /// Write once this many observations have accumulated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,

    /// Seconds after the entry opens before it is written. Defaults to the
    /// finest span interval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<u64>,

    /// Write on every observation.
    pub force: bool,
}

impl BufferPolicy {
    /// Sets the sum threshold.
    #[must_use]
    pub fn with_sum(mut self, sum: f64) -> Self {
        self.sum = Some(sum);
        self
    }

    /// Sets the count threshold.
    #[must_use]
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Sets the deadline in seconds.
    #[must_use]
    pub fn with_elapsed(mut self, elapsed: u64) -> Self {
        self.elapsed = Some(elapsed);
        self
    }

    /// Sets the force flag.
    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Checks the thresholds are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidOption`] for a non-finite sum or a
    /// zero count or elapsed.
    pub fn validate(&self) -> Result<()> {
        let reason = if self.sum.is_some_and(|s| !s.is_finite()) {
            Some("buffer.sum must be finite")
        } else if self.count == Some(0) {
            Some("buffer.count must be greater than zero")
        } else if self.elapsed == Some(0) {
            Some("buffer.elapsed must be greater than zero")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ValidationError::InvalidOption {
                reason: reason.to_string(),
            }
            .into()),
            None => Ok(()),
        }
    }
}

/// Why an entry was written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The policy forces every observation through.
    Forced,
    /// The sum threshold was reached.
    Sum,
    /// The count threshold was reached.
    Count,
    /// The deadline passed.
    Deadline,
    /// An explicit flush (query, shutdown).
    Flush,
}

/// An aggregated point ready for the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    /// Record the point belongs to.
    pub key: RecordKey,
    /// Timestamp the point is recorded at: the entry's deadline.
    pub timestamp: u64,
    /// Aggregated observations.
    pub point: Point,
    /// Which trigger produced the write.
    pub reason: FlushReason,
}

/// Accumulated observations for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferEntry {
    /// Observations since the last write.
    pub count: u64,
    /// Sum of those observations.
    pub sum: f64,
    /// Epoch seconds at which the entry is due.
    pub deadline: u64,
    policy: BufferPolicy,
}

impl BufferEntry {
    /// Adds back a write that could not be persisted. The deadline is kept.
    fn restore(&mut self, point: &Point) {
        self.count += point.count;
        self.sum += point.sum;
    }
}

/// Per-instance buffer map.
#[derive(Debug)]
pub struct Buffer {
    entries: Mutex<HashMap<RecordKey, BufferEntry>>,
    default_elapsed: u64,
}

impl Buffer {
    /// Creates a buffer whose entries fall due `default_elapsed` seconds after
    /// opening unless the policy says otherwise.
    pub fn new(default_elapsed: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_elapsed: default_elapsed.max(1),
        }
    }

    /// Adds `point` to the entry for `key`.
    ///
    /// Returns the aggregated write when a trigger fires; the entry is then
    /// reset and its deadline moved to `now + elapsed`.
    pub fn buffer_metric(
        &self,
        key: &RecordKey,
        point: &Point,
        policy: &BufferPolicy,
        now: u64,
    ) -> Option<PendingWrite> {
        let elapsed = policy.elapsed.unwrap_or(self.default_elapsed);
        let mut entries = self.entries.lock();

        let entry = entries.entry(key.clone()).or_insert_with(|| BufferEntry {
            count: 0,
            sum: 0.0,
            deadline: now + elapsed,
            policy: policy.clone(),
        });
        entry.policy = policy.clone();
        entry.count += point.count;
        entry.sum += point.sum;

        let reason = if entry.policy.force {
            FlushReason::Forced
        } else if entry.policy.sum.is_some_and(|limit| entry.sum >= limit) {
            FlushReason::Sum
        } else if entry.policy.count.is_some_and(|limit| entry.count >= limit) {
            FlushReason::Count
        } else if now >= entry.deadline {
            FlushReason::Deadline
        } else {
            return None;
        };

        let pending = take_entry(key, entry, reason);
        entry.deadline = now + elapsed;
        debug!(key = %key, ?reason, "buffer trigger fired");
        pending
    }

    /// Removes the entry for `key`, returning its data if it holds any.
    pub fn take(&self, key: &RecordKey) -> Option<PendingWrite> {
        let mut entry = self.entries.lock().remove(key)?;
        take_entry(key, &mut entry, FlushReason::Flush)
    }

    /// Removes every entry, returning writes for those holding data.
    pub fn drain(&self) -> Vec<PendingWrite> {
        let entries = std::mem::take(&mut *self.entries.lock());
        entries
            .into_iter()
            .filter_map(|(key, mut entry)| take_entry(&key, &mut entry, FlushReason::Flush))
            .collect()
    }

    /// Returns a failed write's observations to the buffer so a later
    /// trigger or flush sends them again.
    ///
    /// An entry that was removed by [`take`](Buffer::take) or
    /// [`drain`](Buffer::drain) is recreated, due at the write's timestamp.
    pub fn restore(&self, pending: &PendingWrite) {
        let mut entries = self.entries.lock();
        entries
            .entry(pending.key.clone())
            .or_insert_with(|| BufferEntry {
                count: 0,
                sum: 0.0,
                deadline: pending.timestamp,
                policy: BufferPolicy::default(),
            })
            .restore(&pending.point);
        debug!(key = %pending.key, count = pending.point.count, "restored unwritten observations");
    }

    /// Snapshot of the entry for `key`.
    pub fn entry(&self, key: &RecordKey) -> Option<BufferEntry> {
        self.entries.lock().get(key).cloned()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no entries are live.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Converts an entry's accumulated data into a write and zeroes it.
fn take_entry(key: &RecordKey, entry: &mut BufferEntry, reason: FlushReason) -> Option<PendingWrite> {
    if entry.count == 0 {
        return None;
    }
    let point = Point::aggregate(entry.count, entry.sum);
    entry.count = 0;
    entry.sum = 0.0;
    Some(PendingWrite {
        key: key.clone(),
        timestamp: entry.deadline,
        point,
        reason,
    })
}
