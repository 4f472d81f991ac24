//! Device State Table.
//!
//! Last-known value and configured mode for every pin or feature instance,
//! keyed by `(space, id)`. Written by the dispatcher as reports arrive and by
//! the session when it configures something; read by anyone.
//!
//! Each entry is replaced as a whole under a short write lock, so readers
//! never see a value paired with another report's timestamp.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use telemetrix_core::{Error, PinKey, PinMode, Result, Timestamp, Value};

/// Snapshot of one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntry {
    /// Mode recorded when the pin or feature was configured. Entries created
    /// by an unsolicited report have no mode.
    pub mode: Option<PinMode>,

    /// Most recent value, if any report has arrived.
    pub value: Option<Value>,

    /// Stamp of the report that produced `value`.
    pub updated: Option<Timestamp>,
}

impl StateEntry {
    fn configured(mode: PinMode) -> Self {
        Self {
            mode: Some(mode),
            value: None,
            updated: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct DeviceStateTable {
    entries: RwLock<HashMap<PinKey, StateEntry>>,
}

impl DeviceStateTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `key` has been configured with `mode`, keeping any value
    /// already reported.
    pub fn configure(&self, key: PinKey, mode: PinMode) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(key)
            .and_modify(|entry| entry.mode = Some(mode))
            .or_insert_with(|| StateEntry::configured(mode));
    }

    /// Store a reported value.
    ///
    /// Returns `false` and leaves the entry untouched if `timestamp` is not
    /// strictly later than the stored one.
    pub fn set(&self, key: PinKey, value: Value, timestamp: Timestamp) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(key).or_insert(StateEntry {
            mode: None,
            value: None,
            updated: None,
        });
        if entry.updated.is_some_and(|current| timestamp <= current) {
            return false;
        }
        entry.value = Some(value);
        entry.updated = Some(timestamp);
        true
    }

    /// Last value for `key`; `Ok(None)` if configured but not yet reported.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConfigured` if nothing is known about `key`.
    pub fn get(&self, key: PinKey) -> Result<Option<Value>> {
        self.entry(key)
            .map(|entry| entry.value)
            .ok_or(Error::NotConfigured {
                space: key.space,
                id: key.id,
            })
    }

    #[must_use]
    pub fn entry(&self, key: PinKey) -> Option<StateEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(&key).cloned()
    }

    #[must_use]
    pub fn mode(&self, key: PinKey) -> Option<PinMode> {
        self.entry(key).and_then(|entry| entry.mode)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything; used when the board is reset.
    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
