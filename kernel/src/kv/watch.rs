// Bucket Watches
//
// A watcher subscribes to the log *before* taking its snapshot of current
// values, so nothing appended in between is lost. Live records already
// covered by the snapshot are skipped per key by revision.

use std::collections::{HashMap, VecDeque};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::KeyValueStore;
use crate::entry::{validate_pattern, Entry, Revision};
use crate::error::KvError;
use crate::log::{partition_matches, LogStore, Subscription};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Replay every retained entry of matching keys, not just the latest.
    pub include_history: bool,
    /// Skip Delete and Purge entries, in replay and live.
    pub ignore_deletes: bool,
    /// Skip the replay; only entries appended after the watch started.
    pub updates_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchUpdate {
    Entry(Entry),
    /// Sent once, after the replay of existing values.
    InitialValuesDone,
}

pub struct Watcher {
    bucket: String,
    prefix: String,
    initial: VecDeque<Entry>,
    initial_done_pending: bool,
    replayed: HashMap<String, Revision>,
    subscription: Subscription,
    ignore_deletes: bool,
    cancel: CancellationToken,
    stopped: bool,
}

impl Watcher {
    /// Next update. Returns `None` only once the watch is stopped or cancelled.
    pub async fn next(&mut self) -> Option<WatchUpdate> {
        if self.stopped {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.stop();
            return None;
        }
        if let Some(entry) = self.initial.pop_front() {
            return Some(WatchUpdate::Entry(entry));
        }
        if self.initial_done_pending {
            self.initial_done_pending = false;
            return Some(WatchUpdate::InitialValuesDone);
        }

        loop {
            let record = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                record = self.subscription.recv() => record,
            };
            let Some(record) = record else {
                self.stop();
                return None;
            };

            let Some(key) = record.partition.strip_prefix(self.prefix.as_str()) else {
                continue;
            };
            if self
                .replayed
                .get(key)
                .is_some_and(|revision| record.position <= *revision)
            {
                continue;
            }

            let entry = match Entry::decode(&self.bucket, key, &record) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(bucket = %self.bucket, key, error = %err, "skipping undecodable record");
                    continue;
                }
            };
            if self.ignore_deletes && entry.operation.is_marker() {
                continue;
            }
            return Some(WatchUpdate::Entry(entry));
        }
    }

    /// Token that stops this watcher when cancelled, from any task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop delivery and release the subscription.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.cancel.cancel();
        self.subscription.close();
        self.initial.clear();
        debug!(bucket = %self.bucket, "watcher stopped");
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<L: LogStore> KeyValueStore<L> {
    /// Watch keys matching `pattern` (`*` for one segment, `>` for the rest).
    pub async fn watch(&self, pattern: &str, options: WatchOptions) -> Result<Watcher, KvError> {
        validate_pattern(pattern)?;
        let subject = format!("{}{}", self.prefix(), pattern);

        let subscription = self.request(self.log().subscribe(&subject)).await?;

        let mut initial = Vec::new();
        let mut replayed = HashMap::new();

        if !options.updates_only {
            let latest = self
                .request(self.log().latest_per_partition(self.prefix()))
                .await?;

            for record in latest
                .iter()
                .filter(|record| partition_matches(&subject, &record.partition))
            {
                let entry = self.decode(record)?;
                replayed.insert(entry.key.clone(), entry.revision);

                if options.include_history {
                    let records = self
                        .request(self.log().read_range(&record.partition, 0, usize::MAX))
                        .await?;
                    for older in records.iter().filter(|r| r.position < record.position) {
                        initial.push(self.decode(older)?);
                    }
                }
                initial.push(entry);
            }

            initial.sort_by_key(|entry| entry.revision);
            if options.ignore_deletes {
                initial.retain(|entry| !entry.operation.is_marker());
            }
        }

        debug!(
            bucket = self.bucket(),
            pattern,
            initial = initial.len(),
            "watch started"
        );

        Ok(Watcher {
            bucket: self.bucket().to_string(),
            prefix: self.prefix().to_string(),
            initial: initial.into(),
            initial_done_pending: true,
            replayed,
            subscription,
            ignore_deletes: options.ignore_deletes,
            cancel: CancellationToken::new(),
            stopped: false,
        })
    }

    /// Watch every key of the bucket.
    pub async fn watch_all(&self, options: WatchOptions) -> Result<Watcher, KvError> {
        self.watch(">", options).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::BucketConfig;
    use crate::entry::Operation;
    use crate::log::InMemoryLog;

    fn open(history: u8) -> KeyValueStore<InMemoryLog> {
        let config = BucketConfig {
            history,
            ..BucketConfig::new("KVS")
        };
        let log = Arc::new(InMemoryLog::new(config.log_limits()));
        KeyValueStore::new(log, config).unwrap()
    }

    async fn next_entry(watcher: &mut Watcher) -> Entry {
        match tokio::time::timeout(Duration::from_secs(1), watcher.next()).await {
            Ok(Some(WatchUpdate::Entry(entry))) => entry,
            other => panic!("expected an entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn replays_latest_then_signals_then_streams() {
        let kv = open(5);
        kv.put("a", b"1").await.unwrap();
        kv.put("b", b"1").await.unwrap();
        kv.put("a", b"2").await.unwrap();

        let mut watcher = kv.watch_all(WatchOptions::default()).await.unwrap();

        let first = next_entry(&mut watcher).await;
        assert_eq!((first.key.as_str(), first.value.as_slice()), ("b", &b"1"[..]));
        let second = next_entry(&mut watcher).await;
        assert_eq!((second.key.as_str(), second.value.as_slice()), ("a", &b"2"[..]));
        assert_eq!(watcher.next().await, Some(WatchUpdate::InitialValuesDone));

        kv.delete("b", None).await.unwrap();
        let live = next_entry(&mut watcher).await;
        assert_eq!(live.key, "b");
        assert_eq!(live.operation, Operation::Delete);
    }

    #[tokio::test]
    async fn empty_bucket_signals_immediately() {
        let kv = open(1);
        let mut watcher = kv.watch_all(WatchOptions::default()).await.unwrap();
        assert_eq!(watcher.next().await, Some(WatchUpdate::InitialValuesDone));
    }

    #[tokio::test]
    async fn pattern_filters_keys() {
        let kv = open(1);
        let mut watcher = kv
            .watch("users.*", WatchOptions::default())
            .await
            .unwrap();
        assert_eq!(watcher.next().await, Some(WatchUpdate::InitialValuesDone));

        kv.put("orders.1", b"x").await.unwrap();
        kv.put("users.1", b"y").await.unwrap();
        kv.put("users.1.profile", b"z").await.unwrap();
        kv.put("users.2", b"w").await.unwrap();

        assert_eq!(next_entry(&mut watcher).await.key, "users.1");
        assert_eq!(next_entry(&mut watcher).await.key, "users.2");
    }

    #[tokio::test]
    async fn include_history_and_ignore_deletes() {
        let kv = open(5);
        kv.put("a", b"1").await.unwrap();
        kv.put("a", b"2").await.unwrap();
        kv.put("b", b"1").await.unwrap();
        kv.delete("b", None).await.unwrap();

        let options = WatchOptions {
            include_history: true,
            ignore_deletes: true,
            ..WatchOptions::default()
        };
        let mut watcher = kv.watch_all(options).await.unwrap();

        let mut replay = Vec::new();
        while let Some(WatchUpdate::Entry(entry)) = watcher.next().await {
            replay.push((entry.key, entry.value));
        }
        assert_eq!(
            replay,
            vec![
                ("a".to_string(), b"1".to_vec()),
                ("a".to_string(), b"2".to_vec()),
                ("b".to_string(), b"1".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn updates_only_skips_replay() {
        let kv = open(1);
        kv.put("a", b"old").await.unwrap();

        let options = WatchOptions {
            updates_only: true,
            ..WatchOptions::default()
        };
        let mut watcher = kv.watch_all(options).await.unwrap();
        assert_eq!(watcher.next().await, Some(WatchUpdate::InitialValuesDone));

        kv.put("a", b"new").await.unwrap();
        assert_eq!(next_entry(&mut watcher).await.value, b"new");
    }

    #[tokio::test]
    async fn cancellation_ends_the_watch() {
        let kv = open(1);
        let mut watcher = kv.watch_all(WatchOptions::default()).await.unwrap();
        assert_eq!(watcher.next().await, Some(WatchUpdate::InitialValuesDone));

        let token = watcher.cancel_token();
        let pending = tokio::spawn(async move { watcher.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn stopped_watcher_yields_nothing() {
        let kv = open(1);
        kv.put("a", b"1").await.unwrap();

        let mut watcher = kv.watch_all(WatchOptions::default()).await.unwrap();
        watcher.stop();
        kv.put("a", b"2").await.unwrap();

        assert_eq!(watcher.next().await, None);
    }

    #[tokio::test]
    async fn cancelled_token_discards_pending_replay() {
        let kv = open(1);
        kv.put("a", b"1").await.unwrap();
        kv.put("b", b"1").await.unwrap();

        let mut watcher = kv.watch_all(WatchOptions::default()).await.unwrap();
        watcher.cancel_token().cancel();

        assert_eq!(watcher.next().await, None);
        assert_eq!(watcher.next().await, None);
    }

    #[tokio::test]
    async fn invalid_pattern_is_rejected() {
        let kv = open(1);
        assert!(matches!(
            kv.watch("a.>.b", WatchOptions::default()).await,
            Err(KvError::InvalidPattern(_))
        ));
    }
}
