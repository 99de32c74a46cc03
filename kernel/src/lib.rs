// Strata Kernel
//
// Versioned key-value buckets projected onto an ordered, append-only log.

pub mod collector;
pub mod config;
pub mod entry;
pub mod error;
pub mod kv;
pub mod log;
pub mod state;

pub use collector::{purge_deletes, spawn_purge_deletes_task, PurgeDeletesTaskConfig, PurgeReport};
pub use config::BucketConfig;
pub use entry::{Entry, Operation, Revision};
pub use error::KvError;
pub use kv::{BucketStatus, KeyValueStore, WatchOptions, WatchUpdate, Watcher};
pub use state::KeyState;
