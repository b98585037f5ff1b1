//! Bookkeeping of who watches which channel.
//!
//! An entry exists for a channel key exactly while it has subscribers. The
//! ref count is the number of subscribers in the entry, so it cannot go
//! negative and unregistering an unknown id is a no-op.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tokio::time::Instant;

use crate::descriptor::{ChannelKey, Priority, QueryKey, SubscriptionDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug)]
struct Entry {
    subscribers: HashMap<SubscriptionId, (QueryKey, Priority)>,
    status: ChannelStatus,
    last_event_at: Option<Instant>,
}

impl Entry {
    fn priority(&self) -> Priority {
        self.subscribers.values().map(|(_, p)| *p).max().unwrap_or_default()
    }
}

/// Snapshot of a channel as seen by the registry.
#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub key: ChannelKey,
    pub ref_count: usize,
    pub status: ChannelStatus,
    pub last_event_at: Option<Instant>,
    pub priority: Priority,
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<ChannelKey, Entry>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber. The flag is true when this created the entry, i.e.
    /// the channel has to be opened.
    pub fn register(&mut self, descriptor: &SubscriptionDescriptor) -> (SubscriptionId, ChannelKey, bool) {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;

        let key = descriptor.channel_key();
        let mut first = false;
        let entry = self.entries.entry(key.clone()).or_insert_with(|| {
            first = true;
            Entry { subscribers: HashMap::new(), status: ChannelStatus::Connecting, last_event_at: None }
        });
        entry
            .subscribers
            .insert(id, (descriptor.query_key.clone(), descriptor.priority));
        (id, key, first)
    }

    /// Remove a subscriber. `Some(true)` when it was the last one and the entry
    /// is gone, `None` when the id was not registered.
    pub fn unregister(&mut self, key: &ChannelKey, id: SubscriptionId) -> Option<bool> {
        let entry = self.entries.get_mut(key)?;
        entry.subscribers.remove(&id)?;
        if entry.subscribers.is_empty() {
            self.entries.remove(key);
            Some(true)
        } else {
            Some(false)
        }
    }

    pub fn ref_count(&self, key: &ChannelKey) -> usize {
        self.entries.get(key).map(|e| e.subscribers.len()).unwrap_or(0)
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Deduplicated query keys registered for a channel.
    pub fn query_keys(&self, key: &ChannelKey) -> Vec<QueryKey> {
        self.entries
            .get(key)
            .map(|e| {
                e.subscribers
                    .values()
                    .map(|(k, _)| k.clone())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Query keys of every channel on `table`, whatever the filter.
    pub fn keys_for_table(&self, table: &str) -> Vec<QueryKey> {
        self.entries
            .iter()
            .filter(|(k, _)| k.table == table)
            .flat_map(|(_, e)| e.subscribers.values().map(|(k, _)| k.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn status(&self, key: &ChannelKey) -> Option<ChannelStatus> {
        self.entries.get(key).map(|e| e.status)
    }

    pub fn set_status(&mut self, key: &ChannelKey, status: ChannelStatus) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.status = status;
        }
    }

    pub fn record_event(&mut self, key: &ChannelKey, at: Instant) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_event_at = Some(at);
        }
    }

    /// Channel keys with subscribers, highest priority first.
    pub fn channel_keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<(Priority, ChannelKey)> =
            self.entries.iter().map(|(k, e)| (e.priority(), k.clone())).collect();
        keys.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        keys.into_iter().map(|(_, k)| k).collect()
    }

    pub fn snapshot(&self) -> Vec<ChannelRecord> {
        self.channel_keys()
            .into_iter()
            .filter_map(|key| {
                let entry = self.entries.get(&key)?;
                Some(ChannelRecord {
                    ref_count: entry.subscribers.len(),
                    status: entry.status,
                    last_event_at: entry.last_event_at,
                    priority: entry.priority(),
                    key,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
