// Entry Model
//
// One immutable revision of one key, and the payload format used to
// store it in the log. Revisions and timestamps are read back from the
// log record, never written into the payload.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::KvError;
use crate::log::{LogError, LogRecord, Position};

/// Revision of a key. Equal to the log position of the entry.
pub type Revision = Position;

/// What an entry did to its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "put")]
    Put,
    #[serde(rename = "del")]
    Delete,
    #[serde(rename = "purge")]
    Purge,
}

impl Operation {
    /// Delete and Purge entries are delete markers (tombstones).
    pub fn is_marker(self) -> bool {
        match self {
            Operation::Put => false,
            Operation::Delete | Operation::Purge => true,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Put => "PUT",
            Operation::Delete => "DEL",
            Operation::Purge => "PURGE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub bucket: String,
    pub key: String,
    pub value: Vec<u8>,
    pub revision: Revision,
    pub created: SystemTime,
    pub operation: Operation,
}

impl Entry {
    /// Rebuild an entry from the log record that stores it.
    pub fn decode(bucket: &str, key: &str, record: &LogRecord) -> Result<Self, LogError> {
        let stored: StoredEntry =
            serde_json::from_slice(&record.payload).map_err(|e| LogError::Corrupt {
                position: record.position,
                reason: e.to_string(),
            })?;

        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            value: stored.value,
            revision: record.position,
            created: record.timestamp,
            operation: stored.op,
        })
    }
}

/// Payload appended to the log for one entry.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    op: Operation,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    value: Vec<u8>,
}

/// Serialize an operation and its value into a log payload.
pub fn encode(operation: Operation, value: &[u8]) -> Result<Vec<u8>, KvError> {
    let stored = StoredEntry {
        op: operation,
        value: value.to_vec(),
    };
    serde_json::to_vec(&stored).map_err(|e| KvError::Codec(e.to_string()))
}

fn valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '/' | '_' | '='))
}

/// Check that a key is non-empty, made of `[-/_=.a-zA-Z0-9]`, and has no
/// empty `.`-separated segment (which also rules out a leading or trailing dot).
pub fn validate_key(key: &str) -> Result<(), KvError> {
    if key.split('.').all(valid_token) {
        Ok(())
    } else {
        Err(KvError::InvalidKey(key.to_string()))
    }
}

/// Like [`validate_key`], but a segment may be `*`, and the last one may be `>`.
pub fn validate_pattern(pattern: &str) -> Result<(), KvError> {
    let tokens: Vec<&str> = pattern.split('.').collect();
    let last = tokens.len() - 1;

    let valid = tokens.iter().enumerate().all(|(i, token)| match *token {
        "*" => true,
        ">" => i == last,
        token => valid_token(token),
    });

    if valid {
        Ok(())
    } else {
        Err(KvError::InvalidPattern(pattern.to_string()))
    }
}
