// Key-Value Errors
//
// Failures surfaced by bucket operations and the delete-marker collector.

use std::time::Duration;

use crate::entry::Revision;
use crate::log::{Expected, LogError};

/// Errors returned by bucket operations.
///
/// None of these are retried internally: a conflicting revision or a missing
/// key is a decision for the caller, and transient log failures surface as-is.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    #[error("invalid watch pattern: {0:?}")]
    InvalidPattern(String),

    /// No entries remain for the key.
    #[error("key not found")]
    KeyNotFound,

    /// The latest entry is a delete marker.
    #[error("key was deleted at revision {revision}")]
    KeyDeleted { revision: Revision },

    /// A conditional write lost its precondition. `actual` is 0 when the key
    /// holds no entries.
    #[error("wrong last revision: expected {expected}, actual {actual}")]
    WrongRevision { expected: Revision, actual: Revision },

    #[error("value of {size} bytes exceeds limit of {max} bytes")]
    SizeLimit { size: usize, max: usize },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("log unavailable: {0}")]
    Unavailable(String),

    #[error("bad bucket: {0}")]
    BadBucket(String),

    #[error("no keys found")]
    NoKeysFound,

    #[error("codec error: {0}")]
    Codec(String),

    /// A purge-deletes pass stopped early. `processed` lists the keys it
    /// finished before the failure.
    #[error("purge deletes aborted after {} keys: {source}", .processed.len())]
    PurgeDeletes {
        processed: Vec<String>,
        source: Box<KvError>,
    },

    #[error("log error: {0}")]
    Log(LogError),
}

impl From<LogError> for KvError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::WrongPosition { expected, actual } => KvError::WrongRevision {
                expected: match expected {
                    Expected::NoRecord => 0,
                    Expected::Position(position) => position,
                },
                actual,
            },
            LogError::PayloadTooLarge { size, max } => KvError::SizeLimit { size, max },
            LogError::Unavailable(reason) => KvError::Unavailable(reason),
            err @ LogError::Corrupt { .. } => KvError::Log(err),
        }
    }
}
