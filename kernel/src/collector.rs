// Delete-Marker Collector
//
// Reclaims space held by delete markers. Markers at least `threshold`
// old are erased together with everything before them; younger markers
// are kept as the key's only entry so History can still report the
// deletion during the grace window.
//
// Compaction bounds are positions taken from the scan snapshot. A Put
// appended to a key after the snapshot sits past those bounds and always
// survives the pass.

use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::KvError;
use crate::kv::KeyValueStore;
use crate::log::{Compaction, LogStore};
use crate::state::KeyState;

/// Outcome of one purge-deletes pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Tombstoned keys handled by the pass.
    pub processed: usize,
    /// Keys fully erased (marker included).
    pub erased: usize,
    /// Keys compacted down to their marker.
    pub compacted: usize,
}

/// Run one purge-deletes pass over the bucket.
///
/// `threshold` overrides the bucket's configured marker age; zero erases
/// every marker. Stops at the first failed compaction and reports the keys
/// it had already handled.
pub async fn purge_deletes<L: LogStore>(
    kv: &KeyValueStore<L>,
    threshold: Option<Duration>,
) -> Result<PurgeReport, KvError> {
    let threshold = threshold.unwrap_or_else(|| kv.config().tombstone_threshold());
    let snapshot = kv.latest_entries().await?;
    let now = SystemTime::now();

    let mut report = PurgeReport::default();
    let mut processed = Vec::new();

    for latest in snapshot {
        let marker = match KeyState::from_latest(Some(latest)) {
            KeyState::Tombstoned(marker) => marker,
            KeyState::Absent | KeyState::Present(_) => continue,
        };

        // Clock skew can put `created` in the future; treat that as brand new.
        let age = now.duration_since(marker.created).unwrap_or_default();
        let erase = age >= threshold;
        let compaction = if erase {
            Compaction::KeepFrom(marker.revision + 1)
        } else {
            Compaction::KeepFrom(marker.revision)
        };

        match kv.compact_key(&marker.key, compaction).await {
            Ok(removed) => {
                debug!(
                    bucket = kv.bucket(),
                    key = %marker.key,
                    revision = marker.revision,
                    age_ms = age.as_millis() as u64,
                    erase,
                    removed,
                    "collected delete marker"
                );
            }
            Err(source) => {
                warn!(
                    bucket = kv.bucket(),
                    key = %marker.key,
                    processed = processed.len(),
                    error = %source,
                    "purge deletes aborted"
                );
                return Err(KvError::PurgeDeletes {
                    processed,
                    source: Box::new(source),
                });
            }
        }

        if erase {
            report.erased += 1;
        } else {
            report.compacted += 1;
        }
        processed.push(marker.key);
    }

    report.processed = processed.len();
    info!(
        bucket = kv.bucket(),
        threshold_ms = threshold.as_millis() as u64,
        processed = report.processed,
        erased = report.erased,
        compacted = report.compacted,
        "purge deletes pass complete"
    );
    Ok(report)
}

/// Configuration for the periodic purge-deletes task.
#[derive(Debug, Clone)]
pub struct PurgeDeletesTaskConfig {
    /// Interval between passes (default: 60 seconds).
    pub interval: Duration,
    /// Marker age threshold; the bucket's default when `None`.
    pub threshold: Option<Duration>,
}

impl Default for PurgeDeletesTaskConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            threshold: None,
        }
    }
}

/// Run purge-deletes on an interval until the returned token is cancelled.
///
/// Failed passes are logged and retried on the next tick.
pub fn spawn_purge_deletes_task<L: LogStore + 'static>(
    kv: KeyValueStore<L>,
    config: PurgeDeletesTaskConfig,
) -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    tokio::spawn(async move {
        let mut ticker = interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            bucket = kv.bucket(),
            interval_ms = config.interval.as_millis() as u64,
            "purge deletes task started"
        );

        loop {
            tokio::select! {
                _ = cancel_clone.cancelled() => {
                    info!(bucket = kv.bucket(), "purge deletes task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = purge_deletes(&kv, config.threshold).await {
                        warn!(bucket = kv.bucket(), error = %err, "purge deletes pass failed");
                    }
                }
            }
        }
    });

    cancel
}
