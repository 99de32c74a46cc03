// In-Memory Log
//
// A single ordered record sequence shared by every partition, with
// per-partition retention and a payload size limit. Used by the CLI and the
// test suites; availability and latency can be toggled to exercise the
// failure paths of callers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::store::{LogStore, Subscription};
use super::{partition_matches, Compaction, Expected, LogError, LogRecord, Position};

/// Limits enforced by the log itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogLimits {
    /// Oldest records of a partition are evicted beyond this count.
    pub max_per_partition: Option<usize>,
    /// Appends with a larger payload are rejected.
    pub max_payload: Option<usize>,
}

struct Subscriber {
    id: Uuid,
    pattern: String,
    sender: mpsc::UnboundedSender<LogRecord>,
}

#[derive(Default)]
struct Inner {
    last_position: Position,
    records: BTreeMap<Position, LogRecord>,
    partitions: BTreeMap<String, BTreeSet<Position>>,
    subscribers: Vec<Subscriber>,
}

/// In-memory log backed by a `RwLock<BTreeMap>`.
pub struct InMemoryLog {
    inner: Arc<RwLock<Inner>>,
    limits: LogLimits,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new(LogLimits::default())
    }
}

impl InMemoryLog {
    pub fn new(limits: LogLimits) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            limits,
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Simulate the log becoming unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every request by `latency` before it is served.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn gate(&self) -> Result<(), LogError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(LogError::Unavailable("log is not reachable".into()));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, LogError> {
        self.inner
            .read()
            .map_err(|_| LogError::Unavailable("log state poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, LogError> {
        self.inner
            .write()
            .map_err(|_| LogError::Unavailable("log state poisoned".into()))
    }
}

#[async_trait]
impl LogStore for InMemoryLog {
    async fn append(
        &self,
        partition: &str,
        payload: Vec<u8>,
        expected: Option<Expected>,
    ) -> Result<Position, LogError> {
        self.gate().await?;

        if let Some(max) = self.limits.max_payload {
            if payload.len() > max {
                return Err(LogError::PayloadTooLarge {
                    size: payload.len(),
                    max,
                });
            }
        }

        let mut guard = self.write()?;
        let Inner {
            last_position,
            records,
            partitions,
            subscribers,
        } = &mut *guard;

        let actual = partitions
            .get(partition)
            .and_then(|positions| positions.last().copied())
            .unwrap_or(0);

        if let Some(expected) = expected {
            let holds = match expected {
                Expected::NoRecord => actual == 0,
                Expected::Position(position) => actual == position,
            };
            if !holds {
                return Err(LogError::WrongPosition { expected, actual });
            }
        }

        *last_position += 1;
        let record = LogRecord {
            partition: partition.to_string(),
            position: *last_position,
            timestamp: SystemTime::now(),
            payload,
        };

        records.insert(record.position, record.clone());
        let positions = partitions.entry(record.partition.clone()).or_default();
        positions.insert(record.position);

        if let Some(max) = self.limits.max_per_partition {
            while positions.len() > max.max(1) {
                if let Some(evicted) = positions.pop_first() {
                    records.remove(&evicted);
                    trace!(partition, evicted, "retention evicted record");
                }
            }
        }

        // Delivered under the write lock so every feed observes log order.
        subscribers.retain(|subscriber| {
            if partition_matches(&subscriber.pattern, &record.partition) {
                subscriber.sender.send(record.clone()).is_ok()
            } else {
                !subscriber.sender.is_closed()
            }
        });

        debug!(partition, position = record.position, "appended record");
        Ok(record.position)
    }

    async fn read_range(
        &self,
        partition: &str,
        from: Position,
        limit: usize,
    ) -> Result<Vec<LogRecord>, LogError> {
        self.gate().await?;
        let inner = self.read()?;

        let Some(positions) = inner.partitions.get(partition) else {
            return Ok(Vec::new());
        };

        Ok(positions
            .range(from..)
            .take(limit)
            .filter_map(|position| inner.records.get(position).cloned())
            .collect())
    }

    async fn last(&self, partition: &str) -> Result<Option<LogRecord>, LogError> {
        self.gate().await?;
        let inner = self.read()?;

        Ok(inner
            .partitions
            .get(partition)
            .and_then(|positions| positions.last())
            .and_then(|position| inner.records.get(position).cloned()))
    }

    async fn read_at(&self, position: Position) -> Result<Option<LogRecord>, LogError> {
        self.gate().await?;
        let inner = self.read()?;
        Ok(inner.records.get(&position).cloned())
    }

    async fn latest_per_partition(&self, prefix: &str) -> Result<Vec<LogRecord>, LogError> {
        self.gate().await?;
        let inner = self.read()?;

        let mut latest: Vec<LogRecord> = inner
            .partitions
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .filter_map(|(_, positions)| positions.last())
            .filter_map(|position| inner.records.get(position).cloned())
            .collect();

        latest.sort_by_key(|record| record.position);
        Ok(latest)
    }

    async fn record_count(&self, prefix: &str) -> Result<u64, LogError> {
        self.gate().await?;
        let inner = self.read()?;

        Ok(inner
            .partitions
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(_, positions)| positions.len() as u64)
            .sum())
    }

    async fn compact(&self, partition: &str, compaction: Compaction) -> Result<u64, LogError> {
        self.gate().await?;

        let mut guard = self.write()?;
        let Inner {
            records,
            partitions,
            ..
        } = &mut *guard;

        let Some(positions) = partitions.get_mut(partition) else {
            return Ok(0);
        };

        let removed = match compaction {
            Compaction::EraseAll => std::mem::take(positions),
            Compaction::KeepFrom(from) => {
                let kept = positions.split_off(&from);
                std::mem::replace(positions, kept)
            }
        };

        if positions.is_empty() {
            partitions.remove(partition);
        }
        for position in &removed {
            records.remove(position);
        }

        debug!(partition, ?compaction, removed = removed.len(), "compacted partition");
        Ok(removed.len() as u64)
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, LogError> {
        self.gate().await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.write()?.subscribers.push(Subscriber {
            id,
            pattern: pattern.to_string(),
            sender,
        });

        debug!(%id, pattern, "subscription registered");

        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::with_release(receiver, move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if let Ok(mut inner) = inner.write() {
                inner.subscribers.retain(|subscriber| subscriber.id != id);
                debug!(%id, "subscription released");
            };
        }))
    }
}
