// Log Storage Abstraction
//
// Defines the contract the key-value layer expects from the ordered log.
// Implementations may be a replicated stream, a local file, or memory.
//
// Properties required from implementations:
// - Positions are assigned by the log, strictly increasing, never reused
// - Conditional appends are atomic with respect to other appends
// - Compaction of one partition is atomic and never touches another

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Compaction, Expected, LogError, LogRecord, Position};

/// Storage backend for key-value buckets.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append a payload to a partition, optionally conditional on the
    /// partition's latest position.
    async fn append(
        &self,
        partition: &str,
        payload: Vec<u8>,
        expected: Option<Expected>,
    ) -> Result<Position, LogError>;

    /// Read up to `limit` records of a partition starting at `from`, in order.
    async fn read_range(
        &self,
        partition: &str,
        from: Position,
        limit: usize,
    ) -> Result<Vec<LogRecord>, LogError>;

    /// Latest record of a partition, if any remain.
    async fn last(&self, partition: &str) -> Result<Option<LogRecord>, LogError>;

    /// The record stored at a position, if it has not been compacted away.
    async fn read_at(&self, position: Position) -> Result<Option<LogRecord>, LogError>;

    /// Latest record of every partition whose name starts with `prefix`,
    /// ordered by position.
    async fn latest_per_partition(&self, prefix: &str) -> Result<Vec<LogRecord>, LogError>;

    /// Number of records stored under partitions starting with `prefix`.
    async fn record_count(&self, prefix: &str) -> Result<u64, LogError>;

    /// Compact one partition. Returns how many records were removed.
    async fn compact(&self, partition: &str, compaction: Compaction) -> Result<u64, LogError>;

    /// Live stream of records appended to partitions matching `pattern`.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, LogError>;
}

/// Live feed of appended records. Dropping it cancels the subscription.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<LogRecord>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<LogRecord>) -> Self {
        Self {
            receiver,
            release: None,
        }
    }

    /// Like [`Subscription::new`], running `release` once the feed is closed
    /// or dropped so the log can forget the subscriber.
    pub fn with_release(
        receiver: mpsc::UnboundedReceiver<LogRecord>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            receiver,
            release: Some(Box::new(release)),
        }
    }

    /// Next record, or `None` once the log has dropped the feed.
    pub async fn recv(&mut self) -> Option<LogRecord> {
        self.receiver.recv().await
    }

    /// Stop delivery. Records already buffered are discarded.
    pub fn close(&mut self) {
        self.receiver.close();
        while self.receiver.try_recv().is_ok() {}
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("receiver", &self.receiver)
            .field("release", &self.release.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}
