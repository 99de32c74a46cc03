// Key-Value Store
//
// A `KeyValueStore` projects each key of a bucket onto its own log
// partition (`$KV.<bucket>.<key>`). Every operation is a request to the log;
// the store keeps no state of its own beyond its configuration, so reads
// always reflect what the log has committed.

mod watch;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::collector::{self, PurgeReport};
use crate::config::BucketConfig;
use crate::entry::{encode, validate_key, Entry, Operation, Revision};
use crate::error::KvError;
use crate::log::{Compaction, Expected, LogError, LogRecord, LogStore};
use crate::state::{replay_key_state, KeyState};

pub use watch::{WatchOptions, WatchUpdate, Watcher};

/// Snapshot of a bucket's size and settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketStatus {
    pub bucket: String,
    /// Records currently stored for the bucket, markers included.
    pub values: u64,
    pub history: u8,
    pub tombstone_threshold: Duration,
    /// Record age limit the backing log was provisioned with.
    pub ttl: Option<Duration>,
    pub replicas: u8,
}

/// Handle to one bucket on a log.
pub struct KeyValueStore<L: LogStore> {
    log: Arc<L>,
    config: Arc<BucketConfig>,
    prefix: String,
    timeout: Duration,
}

impl<L: LogStore> Clone for KeyValueStore<L> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            config: Arc::clone(&self.config),
            prefix: self.prefix.clone(),
            timeout: self.timeout,
        }
    }
}

fn expectation(revision: Revision) -> Expected {
    if revision == 0 {
        Expected::NoRecord
    } else {
        Expected::Position(revision)
    }
}

impl<L: LogStore> KeyValueStore<L> {
    /// Open a bucket on `log`. Fails with `BadBucket` if the config is invalid.
    pub fn new(log: Arc<L>, config: BucketConfig) -> Result<Self, KvError> {
        config.validate()?;

        Ok(Self {
            log,
            prefix: format!("$KV.{}.", config.bucket),
            timeout: config.request_timeout(),
            config: Arc::new(config),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Same bucket, with a different per-request deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    pub(crate) fn log(&self) -> &L {
        &self.log
    }

    pub(crate) fn prefix(&self) -> &str {
        &self.prefix
    }

    fn partition(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub(crate) fn key_of<'a>(&self, partition: &'a str) -> Option<&'a str> {
        partition.strip_prefix(self.prefix.as_str())
    }

    /// Run one log request under the store's deadline.
    pub(crate) async fn request<T, F>(&self, request: F) -> Result<T, KvError>
    where
        F: Future<Output = Result<T, LogError>>,
    {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(KvError::from),
            Err(_) => Err(KvError::Timeout(self.timeout)),
        }
    }

    pub(crate) fn decode(&self, record: &LogRecord) -> Result<Entry, KvError> {
        let key = self.key_of(&record.partition).ok_or_else(|| {
            KvError::Log(LogError::Corrupt {
                position: record.position,
                reason: format!("partition {} is outside the bucket", record.partition),
            })
        })?;
        Ok(Entry::decode(self.bucket(), key, record)?)
    }

    async fn append(
        &self,
        key: &str,
        operation: Operation,
        value: &[u8],
        expected: Option<Expected>,
    ) -> Result<Revision, KvError> {
        validate_key(key)?;

        if let Some(max) = self.config.max_value_size {
            if value.len() > max {
                return Err(KvError::SizeLimit {
                    size: value.len(),
                    max,
                });
            }
        }

        let payload = encode(operation, value)?;
        let partition = self.partition(key);
        let revision = self
            .request(self.log.append(&partition, payload, expected))
            .await?;

        debug!(bucket = self.bucket(), key, revision, %operation, "appended entry");
        Ok(revision)
    }

    /// Store `value` under `key` unconditionally.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<Revision, KvError> {
        self.append(key, Operation::Put, value, None).await
    }

    /// Store `value` only if the key's latest revision is `expected`.
    /// An `expected` of 0 means the key must hold no entries.
    pub async fn update(
        &self,
        key: &str,
        value: &[u8],
        expected: Revision,
    ) -> Result<Revision, KvError> {
        self.append(key, Operation::Put, value, Some(expectation(expected)))
            .await
    }

    /// Store `value` only if the key is absent or deleted.
    pub async fn create(&self, key: &str, value: &[u8]) -> Result<Revision, KvError> {
        let err = match self
            .append(key, Operation::Put, value, Some(Expected::NoRecord))
            .await
        {
            Err(err @ KvError::WrongRevision { .. }) => err,
            other => return other,
        };

        // A delete marker still occupies the partition; create on top of it.
        match self.get(key).await {
            Err(KvError::KeyDeleted { revision }) => self.update(key, value, revision).await,
            _ => Err(err),
        }
    }

    /// Current state of a key, from its latest entry.
    pub async fn state(&self, key: &str) -> Result<KeyState, KvError> {
        validate_key(key)?;
        let latest = self.request(self.log.last(&self.partition(key))).await?;
        let latest = latest.map(|record| self.decode(&record)).transpose()?;
        Ok(KeyState::from_latest(latest))
    }

    /// Latest entry of a key.
    pub async fn get(&self, key: &str) -> Result<Entry, KvError> {
        match self.state(key).await? {
            KeyState::Absent => Err(KvError::KeyNotFound),
            KeyState::Present(entry) => Ok(entry),
            KeyState::Tombstoned(marker) => Err(KvError::KeyDeleted {
                revision: marker.revision,
            }),
        }
    }

    /// The entry written at `revision`, if it belongs to `key` and is still retained.
    pub async fn get_revision(&self, key: &str, revision: Revision) -> Result<Entry, KvError> {
        validate_key(key)?;
        let partition = self.partition(key);

        let record = match self.request(self.log.read_at(revision)).await? {
            Some(record) if record.partition == partition => record,
            _ => return Err(KvError::KeyNotFound),
        };

        let entry = self.decode(&record)?;
        match entry.operation {
            Operation::Put => Ok(entry),
            Operation::Delete | Operation::Purge => Err(KvError::KeyDeleted {
                revision: entry.revision,
            }),
        }
    }

    /// Append a delete marker, optionally conditional on the latest revision.
    pub async fn delete(&self, key: &str, expected: Option<Revision>) -> Result<Revision, KvError> {
        self.append(key, Operation::Delete, &[], expected.map(expectation))
            .await
    }

    /// Append a purge marker and drop every earlier entry of the key.
    ///
    /// If the compaction fails the marker stays committed, so the key already
    /// reads as deleted but keeps its older entries. Purging again finishes
    /// the job: the new marker's compaction also drops the first one.
    pub async fn purge(&self, key: &str) -> Result<Revision, KvError> {
        let revision = self.append(key, Operation::Purge, &[], None).await?;
        let removed = self
            .compact_key(key, Compaction::KeepFrom(revision))
            .await?;

        debug!(bucket = self.bucket(), key, revision, removed, "purged key");
        Ok(revision)
    }

    /// Retained entries of a key, oldest first, at most `history` of them.
    pub async fn history(&self, key: &str) -> Result<Vec<Entry>, KvError> {
        validate_key(key)?;

        let records = self
            .request(self.log.read_range(&self.partition(key), 0, usize::MAX))
            .await?;
        if records.is_empty() {
            return Err(KvError::KeyNotFound);
        }

        let mut entries = records
            .iter()
            .map(|record| self.decode(record))
            .collect::<Result<Vec<_>, _>>()?;

        replay_key_state(&entries).map_err(|e| {
            KvError::Log(LogError::Corrupt {
                position: entries.last().map_or(0, |entry| entry.revision),
                reason: e.to_string(),
            })
        })?;

        let excess = entries.len().saturating_sub(self.config.history as usize);
        Ok(entries.split_off(excess))
    }

    /// Keys whose latest entry is a Put, sorted.
    pub async fn keys(&self) -> Result<Vec<String>, KvError> {
        let mut keys: Vec<String> = self
            .latest_entries()
            .await?
            .into_iter()
            .filter(|entry| !entry.operation.is_marker())
            .map(|entry| entry.key)
            .collect();

        if keys.is_empty() {
            return Err(KvError::NoKeysFound);
        }
        keys.sort();
        Ok(keys)
    }

    pub async fn status(&self) -> Result<BucketStatus, KvError> {
        let values = self.request(self.log.record_count(&self.prefix)).await?;

        Ok(BucketStatus {
            bucket: self.bucket().to_string(),
            values,
            history: self.config.history,
            tombstone_threshold: self.config.tombstone_threshold(),
            ttl: self.config.ttl(),
            replicas: self.config.replicas,
        })
    }

    /// Erase old delete markers and compact young ones. See [`collector::purge_deletes`].
    pub async fn purge_deletes(&self, threshold: Option<Duration>) -> Result<PurgeReport, KvError> {
        collector::purge_deletes(self, threshold).await
    }

    /// Latest entry of every key in the bucket, in log order.
    pub(crate) async fn latest_entries(&self) -> Result<Vec<Entry>, KvError> {
        self.request(self.log.latest_per_partition(&self.prefix))
            .await?
            .iter()
            .map(|record| self.decode(record))
            .collect()
    }

    pub(crate) async fn compact_key(
        &self,
        key: &str,
        compaction: Compaction,
    ) -> Result<u64, KvError> {
        self.request(self.log.compact(&self.partition(key), compaction))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryLog;

    fn open(history: u8) -> (Arc<InMemoryLog>, KeyValueStore<InMemoryLog>) {
        let config = BucketConfig {
            history,
            ..BucketConfig::new("KVS")
        };
        let log = Arc::new(InMemoryLog::new(config.log_limits()));
        let kv = KeyValueStore::new(Arc::clone(&log), config).unwrap();
        (log, kv)
    }

    #[tokio::test]
    async fn put_then_get_returns_latest_value() {
        let (_, kv) = open(5);

        let r1 = kv.put("foo", b"one").await.unwrap();
        let r2 = kv.put("foo", b"two").await.unwrap();
        assert!(r2 > r1);

        let entry = kv.get("foo").await.unwrap();
        assert_eq!(entry.value, b"two");
        assert_eq!(entry.revision, r2);
        assert_eq!(entry.operation, Operation::Put);
        assert_eq!(entry.bucket, "KVS");
    }

    #[tokio::test]
    async fn invalid_keys_are_rejected_before_the_log() {
        let (log, kv) = open(1);

        for key in ["", ".a", "a.", "a..b", "a.*", "a.>"] {
            assert_eq!(
                kv.put(key, b"v").await,
                Err(KvError::InvalidKey(key.to_string()))
            );
        }
        assert_eq!(log.record_count("").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_and_deleted_keys_are_distinguished() {
        let (_, kv) = open(5);

        assert_eq!(kv.get("nope").await, Err(KvError::KeyNotFound));

        kv.put("foo", b"v").await.unwrap();
        let marker = kv.delete("foo", None).await.unwrap();
        assert_eq!(
            kv.get("foo").await,
            Err(KvError::KeyDeleted { revision: marker })
        );

        let history = kv.history("foo").await.unwrap();
        assert_eq!(history.last().unwrap().operation, Operation::Delete);
        assert!(history.last().unwrap().value.is_empty());
    }

    #[tokio::test]
    async fn update_requires_latest_revision() {
        let (_, kv) = open(5);

        let r1 = kv.put("foo", b"a").await.unwrap();
        let r2 = kv.update("foo", b"b", r1).await.unwrap();

        assert_eq!(
            kv.update("foo", b"c", r1).await,
            Err(KvError::WrongRevision {
                expected: r1,
                actual: r2
            })
        );
        assert_eq!(kv.get("foo").await.unwrap().value, b"b");
    }

    #[tokio::test]
    async fn conditional_delete() {
        let (_, kv) = open(5);

        let r1 = kv.put("foo", b"a").await.unwrap();
        kv.put("foo", b"b").await.unwrap();

        assert!(matches!(
            kv.delete("foo", Some(r1)).await,
            Err(KvError::WrongRevision { .. })
        ));
        assert!(kv.get("foo").await.is_ok());
    }

    #[tokio::test]
    async fn create_succeeds_on_absent_or_deleted_keys_only() {
        let (_, kv) = open(5);

        let r1 = kv.create("foo", b"a").await.unwrap();
        assert_eq!(
            kv.create("foo", b"b").await,
            Err(KvError::WrongRevision {
                expected: 0,
                actual: r1
            })
        );

        kv.delete("foo", None).await.unwrap();
        let r3 = kv.create("foo", b"c").await.unwrap();
        assert_eq!(kv.get("foo").await.unwrap().revision, r3);
    }

    #[tokio::test]
    async fn history_is_bounded_and_ordered() {
        let (_, kv) = open(3);

        for value in [b"1", b"2", b"3", b"4", b"5"] {
            kv.put("foo", value).await.unwrap();
        }

        let history = kv.history("foo").await.unwrap();
        let values: Vec<_> = history.iter().map(|e| e.value.clone()).collect();
        assert_eq!(values, vec![b"3".to_vec(), b"4".to_vec(), b"5".to_vec()]);
        assert!(history.windows(2).all(|w| w[0].revision < w[1].revision));
    }

    #[tokio::test]
    async fn purge_leaves_only_the_marker() {
        let (_, kv) = open(10);

        kv.put("foo", b"1").await.unwrap();
        kv.put("foo", b"2").await.unwrap();
        let revision = kv.purge("foo").await.unwrap();

        let history = kv.history("foo").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].operation, Operation::Purge);
        assert_eq!(history[0].revision, revision);
        assert_eq!(kv.get("foo").await, Err(KvError::KeyDeleted { revision }));
    }

    #[tokio::test]
    async fn revisions_keep_increasing_after_erase() {
        let (_, kv) = open(5);

        let r1 = kv.put("foo", b"1").await.unwrap();
        let r2 = kv.delete("foo", None).await.unwrap();
        kv.purge_deletes(Some(Duration::ZERO)).await.unwrap();
        assert_eq!(kv.history("foo").await, Err(KvError::KeyNotFound));

        let r3 = kv.put("foo", b"2").await.unwrap();
        assert!(r1 < r2 && r2 < r3);
    }

    #[tokio::test]
    async fn get_revision_reads_retained_entries() {
        let (_, kv) = open(5);

        let r1 = kv.put("foo", b"1").await.unwrap();
        let other = kv.put("bar", b"x").await.unwrap();
        kv.put("foo", b"2").await.unwrap();

        assert_eq!(kv.get_revision("foo", r1).await.unwrap().value, b"1");
        assert_eq!(
            kv.get_revision("foo", other).await,
            Err(KvError::KeyNotFound)
        );
        assert_eq!(kv.get_revision("foo", 999).await, Err(KvError::KeyNotFound));
    }

    #[tokio::test]
    async fn keys_lists_live_keys_only() {
        let (_, kv) = open(1);
        assert_eq!(kv.keys().await, Err(KvError::NoKeysFound));

        kv.put("b", b"1").await.unwrap();
        kv.put("a", b"1").await.unwrap();
        kv.put("c", b"1").await.unwrap();
        kv.delete("c", None).await.unwrap();

        assert_eq!(kv.keys().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn value_size_limit() {
        let config = BucketConfig {
            max_value_size: Some(4),
            ..BucketConfig::new("KVS")
        };
        let kv = KeyValueStore::new(Arc::new(InMemoryLog::default()), config).unwrap();

        assert_eq!(
            kv.put("foo", b"12345").await,
            Err(KvError::SizeLimit { size: 5, max: 4 })
        );
        assert!(kv.put("foo", b"1234").await.is_ok());
    }

    #[tokio::test]
    async fn status_counts_stored_records() {
        let (_, kv) = open(2);

        kv.put("a", b"1").await.unwrap();
        kv.put("a", b"2").await.unwrap();
        kv.put("a", b"3").await.unwrap();
        kv.put("b", b"1").await.unwrap();

        let status = kv.status().await.unwrap();
        assert_eq!(status.values, 3);
        assert_eq!(status.history, 2);
        assert_eq!(status.ttl, None);
        assert_eq!(status.replicas, 1);
    }

    #[tokio::test]
    async fn status_reports_provisioning_settings() {
        let config = BucketConfig {
            ttl_ms: Some(60_000),
            replicas: 3,
            ..BucketConfig::new("KVS")
        };
        let kv = KeyValueStore::new(Arc::new(InMemoryLog::default()), config).unwrap();

        let status = kv.status().await.unwrap();
        assert_eq!(status.ttl, Some(Duration::from_secs(60)));
        assert_eq!(status.replicas, 3);
        assert_eq!(status.values, 0);
    }

    #[tokio::test]
    async fn buckets_on_one_log_are_isolated() {
        let log = Arc::new(InMemoryLog::default());
        let a = KeyValueStore::new(Arc::clone(&log), BucketConfig::new("A")).unwrap();
        let b = KeyValueStore::new(Arc::clone(&log), BucketConfig::new("B")).unwrap();

        a.put("foo", b"a").await.unwrap();
        assert_eq!(b.get("foo").await, Err(KvError::KeyNotFound));
        assert_eq!(b.keys().await, Err(KvError::NoKeysFound));
    }

    #[tokio::test]
    async fn log_failures_surface_unchanged() {
        let (log, kv) = open(1);

        log.set_available(false);
        assert!(matches!(
            kv.put("foo", b"v").await,
            Err(KvError::Unavailable(_))
        ));

        log.set_available(true);
        log.set_latency(Duration::from_millis(200));
        let short = kv.with_timeout(Duration::from_millis(20));
        assert_eq!(
            short.get("foo").await,
            Err(KvError::Timeout(Duration::from_millis(20)))
        );
    }

    #[tokio::test]
    async fn bad_bucket_config_is_rejected() {
        let config = BucketConfig {
            history: 0,
            ..BucketConfig::new("KVS")
        };
        let result = KeyValueStore::new(Arc::new(InMemoryLog::default()), config);
        assert!(matches!(result, Err(KvError::BadBucket(_))));
    }
}
