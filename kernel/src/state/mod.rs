// Revision Index
//
// Derives a key's current state from its entries. Nothing here is stored:
// the state is recomputed from whatever the log still holds for the key.
// This module is pure, deterministic, and side-effect free.

use crate::entry::{Entry, Operation, Revision};

/// Current state of a single key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeyState {
    /// No entries remain: never written, or fully erased.
    #[default]
    Absent,

    /// Latest entry is a Put.
    Present(Entry),

    /// Latest entry is a Delete or Purge marker.
    Tombstoned(Entry),
}

impl KeyState {
    /// State of a key given only its latest entry.
    pub fn from_latest(latest: Option<Entry>) -> Self {
        match latest {
            None => KeyState::Absent,
            Some(entry) => match entry.operation {
                Operation::Put => KeyState::Present(entry),
                Operation::Delete | Operation::Purge => KeyState::Tombstoned(entry),
            },
        }
    }

    pub fn latest(&self) -> Option<&Entry> {
        match self {
            KeyState::Absent => None,
            KeyState::Present(entry) | KeyState::Tombstoned(entry) => Some(entry),
        }
    }

    pub fn revision(&self) -> Option<Revision> {
        self.latest().map(|entry| entry.revision)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("revision {revision} does not follow {previous}")]
    OutOfOrder {
        previous: Revision,
        revision: Revision,
    },

    #[error("entry for key {found:?} replayed into index of {expected:?}")]
    ForeignKey { expected: String, found: String },
}

/// Stateful reducer over one key's entries.
#[derive(Debug, Default)]
pub struct RevisionIndex {
    state: KeyState,
}

impl RevisionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the next entry of the key.
    pub fn apply(&mut self, entry: &Entry) -> Result<(), StateError> {
        if let Some(current) = self.state.latest() {
            if current.key != entry.key {
                return Err(StateError::ForeignKey {
                    expected: current.key.clone(),
                    found: entry.key.clone(),
                });
            }
            if entry.revision <= current.revision {
                return Err(StateError::OutOfOrder {
                    previous: current.revision,
                    revision: entry.revision,
                });
            }
        }

        self.state = KeyState::from_latest(Some(entry.clone()));
        Ok(())
    }

    pub fn current_state(&self) -> &KeyState {
        &self.state
    }

    pub fn into_state(self) -> KeyState {
        self.state
    }
}

/// Replay a key's entries, oldest first, and return the derived state.
pub fn replay_key_state<'a>(
    entries: impl IntoIterator<Item = &'a Entry>,
) -> Result<KeyState, StateError> {
    let mut index = RevisionIndex::new();
    for entry in entries {
        index.apply(entry)?;
    }
    Ok(index.into_state())
}
