// Append-Only Log Boundary
//
// Types shared between the key-value layer and the ordered log it is
// built on. The log assigns positions and timestamps; nothing above it
// may invent either.

use std::time::SystemTime;

mod memory;
mod store;

pub use memory::{InMemoryLog, LogLimits};
pub use store::{LogStore, Subscription};

/// Position of a record in the log. Positions start at 1 and are never reused.
pub type Position = u64;

/// One record as stored by the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub partition: String,
    pub position: Position,
    pub timestamp: SystemTime,
    pub payload: Vec<u8>,
}

/// Precondition on the partition's latest record for a conditional append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// The partition must hold no records.
    NoRecord,
    /// The partition's latest record must sit at this position.
    Position(Position),
}

/// Compaction request for a single partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compaction {
    /// Remove every record of the partition.
    EraseAll,
    /// Remove records positioned before the given position.
    KeepFrom(Position),
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum LogError {
    /// `actual` is 0 when the partition holds no record.
    #[error("wrong last position: expected {expected:?}, actual {actual}")]
    WrongPosition { expected: Expected, actual: Position },

    #[error("payload of {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("log unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record at position {position}: {reason}")]
    Corrupt { position: Position, reason: String },
}

/// Token-wise match of a partition name against a pattern.
///
/// `*` matches exactly one token, `>` matches one or more trailing tokens.
pub fn partition_matches(pattern: &str, partition: &str) -> bool {
    let mut subject = partition.split('.');

    for token in pattern.split('.') {
        match (token, subject.next()) {
            (">", Some(_)) => return true,
            ("*", Some(_)) => continue,
            (literal, Some(actual)) if literal == actual => continue,
            _ => return false,
        }
    }

    subject.next().is_none()
}
