// Bucket Configuration
//
// Settings a bucket is opened with. Loaded from TOML/JSON by callers.
// `ttl_ms` and `replicas` describe how the backing log was provisioned;
// the bucket validates and reports them but does not enforce them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::KvError;
use crate::log::LogLimits;

/// Upper bound on retained revisions per key.
pub const MAX_HISTORY: u8 = 64;

/// Upper bound on log replicas.
pub const MAX_REPLICAS: u8 = 5;

/// Default age after which purge-deletes erases a marker outright (30 minutes).
pub const DEFAULT_TOMBSTONE_THRESHOLD_MS: u64 = 30 * 60 * 1000;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    pub bucket: String,
    /// Revisions retained per key, including the latest.
    pub history: u8,
    /// Default marker age threshold for purge-deletes.
    pub tombstone_threshold_ms: u64,
    /// Largest accepted value, in bytes.
    pub max_value_size: Option<usize>,
    pub ttl_ms: Option<u64>,
    pub replicas: u8,
    /// Deadline for each request to the log.
    pub request_timeout_ms: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            history: 1,
            tombstone_threshold_ms: DEFAULT_TOMBSTONE_THRESHOLD_MS,
            max_value_size: None,
            ttl_ms: None,
            replicas: 1,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl BucketConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    pub fn tombstone_threshold(&self) -> Duration {
        Duration::from_millis(self.tombstone_threshold_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }

    /// Limits the log must enforce for this bucket's partitions.
    pub fn log_limits(&self) -> LogLimits {
        LogLimits {
            max_per_partition: Some(self.history as usize),
            max_payload: None,
        }
    }

    pub fn validate(&self) -> Result<(), KvError> {
        let name_ok = !self.bucket.is_empty()
            && self
                .bucket
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !name_ok {
            return Err(KvError::BadBucket(format!(
                "invalid bucket name {:?}",
                self.bucket
            )));
        }

        if self.history == 0 || self.history > MAX_HISTORY {
            return Err(KvError::BadBucket(format!(
                "history must be between 1 and {MAX_HISTORY}, got {}",
                self.history
            )));
        }

        if self.replicas == 0 || self.replicas > MAX_REPLICAS {
            return Err(KvError::BadBucket(format!(
                "replicas must be between 1 and {MAX_REPLICAS}, got {}",
                self.replicas
            )));
        }

        if self.request_timeout_ms == 0 {
            return Err(KvError::BadBucket("request timeout must be non-zero".into()));
        }

        Ok(())
    }
}
