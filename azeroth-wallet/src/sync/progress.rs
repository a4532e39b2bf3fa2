//! Push-style progress channel.
//!
//! Listeners subscribe to a string key. A listener added after a value was published receives
//! that value immediately; every later publish reaches every listener of the key. Whether two
//! consecutive values count as a change is decided by the manager's comparator.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::BlockRange;

pub const FORWARD_SYNC_LISTENER_KEY: &str = "FORWARD";
pub const BACKWARD_SYNC_LISTENER_KEY: &str = "BACKWARD";

/// Snapshot published by both sync engines.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteProgressNotification {
    pub is_running: bool,
    pub total_blocks: u64,
    pub total_scanned: u64,
    pub scan_range: BlockRange,
}

impl NoteProgressNotification {
    pub fn running(total_blocks: u64, total_scanned: u64, scan_range: BlockRange) -> Self {
        Self {
            is_running: true,
            total_blocks,
            total_scanned,
            scan_range,
        }
    }

    /// What an engine publishes when it goes idle.
    pub fn stopped() -> Self {
        Self::default()
    }
}

pub type ListenerId = u64;

pub type ListenerCallback<T> = Arc<dyn Fn(&str, ListenerId, &T) + Send + Sync>;

/// Returned by [`UpdateSyncManager::add_listener`]; pass `listener_id` to remove it again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerHandle {
    pub key: String,
    pub listener_id: ListenerId,
}

struct KeyEntry<T> {
    data: Option<T>,
    listeners: BTreeMap<ListenerId, ListenerCallback<T>>,
}

impl<T> Default for KeyEntry<T> {
    fn default() -> Self {
        Self {
            data: None,
            listeners: BTreeMap::new(),
        }
    }
}

struct Registry<T> {
    next_id: ListenerId,
    keys: HashMap<String, KeyEntry<T>>,
    listener_keys: HashMap<ListenerId, String>,
}

/// Keyed last-value pub/sub.
pub struct UpdateSyncManager<T> {
    registry: Mutex<Registry<T>>,
    /// `true` when the update is the same as the previous value.
    unchanged: fn(&T, &T) -> bool,
}

fn never_unchanged<T>(_: &T, _: &T) -> bool {
    false
}

impl<T: Clone> Default for UpdateSyncManager<T> {
    fn default() -> Self {
        Self::new(never_unchanged::<T>)
    }
}

impl<T: Clone> UpdateSyncManager<T> {
    pub fn new(unchanged: fn(&T, &T) -> bool) -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_id: 1,
                keys: HashMap::new(),
                listener_keys: HashMap::new(),
            }),
            unchanged,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry<T>> {
        // callbacks never run under the lock, so a poisoned lock still holds consistent data
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe to `key`, or to a fresh private key when `None`.
    pub fn add_listener(&self, key: Option<&str>, callback: ListenerCallback<T>) -> ListenerHandle {
        let (handle, last) = {
            let mut registry = self.lock();
            let key = match key {
                Some(key) => key.to_string(),
                None => {
                    registry.next_id += 1;
                    format!("{:x}", registry.next_id)
                }
            };
            registry.next_id += 1;
            let listener_id = registry.next_id;

            let entry = registry.keys.entry(key.clone()).or_default();
            entry.listeners.insert(listener_id, callback.clone());
            let last = entry.data.clone();
            registry.listener_keys.insert(listener_id, key.clone());
            (ListenerHandle { key, listener_id }, last)
        };
        debug!(key = %handle.key, listener_id = handle.listener_id, "listener added");

        if let Some(data) = last {
            callback(&handle.key, handle.listener_id, &data);
        }
        handle
    }

    pub fn remove_listener(&self, listener_id: ListenerId) {
        let mut registry = self.lock();
        let Some(key) = registry.listener_keys.remove(&listener_id) else {
            warn!(listener_id, "listener id not found");
            return;
        };
        if let Some(entry) = registry.keys.get_mut(&key) {
            entry.listeners.remove(&listener_id);
        }
    }

    /// Publish a batch of `(key, value)` updates.
    pub fn update_data(&self, list: Vec<(String, T)>) {
        let mut calls: Vec<(String, ListenerId, ListenerCallback<T>, T)> = Vec::new();
        {
            let mut registry = self.lock();
            for (key, update) in list {
                let entry = registry.keys.entry(key.clone()).or_default();
                let changed = match &entry.data {
                    None => true,
                    Some(previous) => !(self.unchanged)(previous, &update),
                };
                if !changed {
                    continue;
                }
                for (id, callback) in &entry.listeners {
                    calls.push((key.clone(), *id, callback.clone(), update.clone()));
                }
                entry.data = Some(update);
            }
        }

        for (key, id, callback, data) in calls {
            callback(&key, id, &data);
        }
    }

    /// Last value published under `key`.
    pub fn latest(&self, key: &str) -> Option<T> {
        self.lock().keys.get(key).and_then(|entry| entry.data.clone())
    }

    pub fn listener_count(&self, key: &str) -> usize {
        self.lock()
            .keys
            .get(key)
            .map(|entry| entry.listeners.len())
            .unwrap_or(0)
    }
}
