use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Position of the control loop state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Idle,
    Disconnected,
    Connecting,
    Unsynchronized,
    Synchronized,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Unsynchronized => "UNSYNCHRONIZED",
            Self::Synchronized => "SYNCHRONIZED",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPoint {
    pub ssid: String,
    #[serde(default)]
    pub passphrase: String,
}

impl AccessPoint {
    pub fn new(ssid: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            passphrase: passphrase.into(),
        }
    }
}

/// Latest known connectivity, time and status, as handed to the renderer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub access_point: Option<AccessPoint>,
    pub address: Option<Ipv4Addr>,
    pub time: Option<DateTime<FixedOffset>>,
    /// Server rotation index. Only meaningful while `Unsynchronized`.
    pub retry_count: u32,
    pub status: Status,
}

#[derive(Debug, Default)]
struct Slot {
    snapshot: Snapshot,
    changed: bool,
}

/// Mutex-guarded snapshot with a change flag that is consumed by `read`.
///
/// Clones share the same slot, so the controller and every producer can hold
/// their own handle.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    slot: Arc<Mutex<Slot>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the change flag and a copy of the snapshot, clearing the flag.
    pub fn read(&self) -> (bool, Snapshot) {
        let mut slot = self.lock();
        let changed = std::mem::take(&mut slot.changed);
        (changed, slot.snapshot.clone())
    }

    /// Applies `mutator` and marks the snapshot changed.
    pub fn write<F>(&self, mutator: F)
    where
        F: FnOnce(&mut Snapshot),
    {
        let mut slot = self.lock();
        mutator(&mut slot.snapshot);
        slot.changed = true;
    }

    /// Applies `mutator` without touching the change flag.
    pub fn modify<F>(&self, mutator: F)
    where
        F: FnOnce(&mut Snapshot),
    {
        let mut slot = self.lock();
        mutator(&mut slot.snapshot);
    }

    /// Copy of the snapshot that leaves the change flag alone.
    pub fn peek(&self) -> Snapshot {
        self.lock().snapshot.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // Poisoning only records that a mutator panicked; the slot stays readable.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
