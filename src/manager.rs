//! The subscription manager: one per process, built at start-up and passed
//! to whoever needs it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::QueryCache;
use crate::config::{Config, HealthConfig, SubscriptionConfig};
use crate::descriptor::{ChannelKey, QueryKey, SubscriptionDescriptor};
use crate::dispatcher::InvalidationDispatcher;
use crate::emergency::EmergencySwitch;
use crate::health::{ConnectionHealthMonitor, SessionRefresher};
use crate::lifecycle::{ChannelLifecycleManager, LifecycleHandle};
use crate::registry::{ChannelRecord, ChannelStatus, Registry, SubscriptionId};
use crate::retry::RetryPolicy;
use crate::transport::RealtimeTransport;

struct Shared {
    registry: Arc<Mutex<Registry>>,
    // Tables ever subscribed, for manual refreshes of everything.
    tables: Mutex<BTreeSet<String>>,
    // Query keys of handles made in emergency mode, counted per handle.
    inert: Mutex<HashMap<String, HashMap<QueryKey, usize>>>,
    lifecycle: LifecycleHandle,
    dispatcher: InvalidationDispatcher,
    health: Arc<ConnectionHealthMonitor>,
    emergency: Arc<EmergencySwitch>,
    reconnect_watcher: JoinHandle<()>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.reconnect_watcher.abort();
    }
}

#[derive(Clone)]
pub struct SubscriptionManager {
    shared: Arc<Shared>,
}

pub struct SubscriptionManagerBuilder {
    transport: Arc<dyn RealtimeTransport>,
    cache: Arc<dyn QueryCache>,
    session: Option<Arc<dyn SessionRefresher>>,
    subscriptions: SubscriptionConfig,
    health: HealthConfig,
    retry: RetryPolicy,
}

impl SubscriptionManagerBuilder {
    pub fn session(mut self, session: Arc<dyn SessionRefresher>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn subscriptions(mut self, subscriptions: SubscriptionConfig) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    pub fn health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(self, config: &Config) -> Self {
        self.subscriptions(config.subscriptions.clone())
            .health(config.health.clone())
            .retry(config.retry.clone())
    }

    /// Must be called from within a tokio runtime: starts the lifecycle driver
    /// and the reconnect watcher.
    pub fn build(self) -> SubscriptionManager {
        let health = Arc::new(ConnectionHealthMonitor::new(
            Arc::clone(&self.transport),
            self.session,
            self.health,
            self.retry.clone(),
        ));
        let emergency = Arc::new(EmergencySwitch::new(self.subscriptions.emergency_mode));
        let registry = Arc::new(Mutex::new(Registry::new()));
        let dispatcher = InvalidationDispatcher::new(self.cache);
        let reconnects = health.subscribe_reconnects();

        let lifecycle = ChannelLifecycleManager::spawn(
            self.transport,
            Arc::clone(&registry),
            dispatcher.clone(),
            Arc::clone(&health),
            Arc::clone(&emergency),
            self.subscriptions.close_grace(),
            self.retry,
        );
        let reconnect_watcher = spawn_reconnect_watcher(reconnects, lifecycle.clone());

        SubscriptionManager {
            shared: Arc::new(Shared {
                registry,
                tables: Mutex::new(BTreeSet::new()),
                inert: Mutex::new(HashMap::new()),
                lifecycle,
                dispatcher,
                health,
                emergency,
                reconnect_watcher,
            }),
        }
    }
}

/// A completed reconnect means the channels of the previous connection are
/// gone. A transport that connected on its own still has them.
fn spawn_reconnect_watcher(mut reconnects: watch::Receiver<u64>, lifecycle: LifecycleHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        while reconnects.changed().await.is_ok() {
            let count = *reconnects.borrow_and_update();
            info!("Reconnected ({}), reopening channels", count);
            lifecycle.reopen_all();
        }
    })
}

impl SubscriptionManager {
    pub fn builder(transport: Arc<dyn RealtimeTransport>, cache: Arc<dyn QueryCache>) -> SubscriptionManagerBuilder {
        SubscriptionManagerBuilder {
            transport,
            cache,
            session: None,
            subscriptions: SubscriptionConfig::default(),
            health: HealthConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Register interest in a table (optionally filtered). Descriptors with the
    /// same table and filter share one channel; each call still gets its own
    /// handle. In emergency mode the handle is inert.
    pub fn subscribe(&self, descriptor: SubscriptionDescriptor) -> SubscriptionHandle {
        self.shared.tables.lock().insert(descriptor.table.clone());
        let key = descriptor.channel_key();

        if self.shared.emergency.is_active() {
            debug!("Emergency mode: inert subscription for {}", key);
            *self
                .shared
                .inert
                .lock()
                .entry(descriptor.table.clone())
                .or_default()
                .entry(descriptor.query_key.clone())
                .or_insert(0) += 1;
            let inert = Registration::Inert(Arc::clone(&self.shared), descriptor.table, descriptor.query_key);
            return SubscriptionHandle { key, registration: inert };
        }

        let (id, key, first, status) = {
            let mut registry = self.shared.registry.lock();
            let (id, key, first) = registry.register(&descriptor);
            let status = registry.status(&key);
            (id, key, first, status)
        };
        // A closed entry has no channel: its last open failed.
        if first || status == Some(ChannelStatus::Closed) {
            self.shared.lifecycle.open(key.clone());
        }
        SubscriptionHandle { key, registration: Registration::Live(Arc::clone(&self.shared), id) }
    }

    fn keys_for_table(&self, table: &str) -> BTreeSet<QueryKey> {
        let mut keys: BTreeSet<QueryKey> = self.shared.registry.lock().keys_for_table(table).into_iter().collect();
        if let Some(inert) = self.shared.inert.lock().get(table) {
            keys.extend(inert.keys().cloned());
        }
        if keys.is_empty() {
            keys.insert(QueryKey::from(table));
        }
        keys
    }

    /// Invalidate the cache for `tables`, or for every table ever subscribed,
    /// without needing a live channel. Keys come from the current subscribers;
    /// a table without any falls back to a query key made of the table name.
    /// Returns the number of keys invalidated. Data only counts as refreshed
    /// when every invalidation went through.
    pub async fn force_refresh(&self, tables: Option<&[&str]>) -> usize {
        let tables: Vec<String> = match tables {
            Some(tables) => tables.iter().map(|t| t.to_string()).collect(),
            None => self.shared.tables.lock().iter().cloned().collect(),
        };
        let keys: BTreeSet<QueryKey> = tables.iter().flat_map(|table| self.keys_for_table(table)).collect();

        let mut invalidated = 0;
        for key in &keys {
            if self.shared.dispatcher.invalidate(key).await {
                invalidated += 1;
            }
        }
        if invalidated > 0 && invalidated == keys.len() {
            self.shared.health.mark_refreshed();
        }
        info!("Force refresh invalidated {} of {} query keys", invalidated, keys.len());
        invalidated
    }

    pub fn enable_emergency_mode(&self, reason: &str) {
        if self.shared.emergency.activate(reason) {
            self.shared.lifecycle.close_all();
        }
    }

    pub fn disable_emergency_mode(&self) {
        if self.shared.emergency.deactivate() {
            self.shared.lifecycle.reopen_all();
        }
    }

    pub fn is_emergency_mode(&self) -> bool {
        self.shared.emergency.is_active()
    }

    pub fn emergency(&self) -> &EmergencySwitch {
        &self.shared.emergency
    }

    pub fn health(&self) -> Arc<ConnectionHealthMonitor> {
        Arc::clone(&self.shared.health)
    }

    pub fn ref_count(&self, key: &ChannelKey) -> usize {
        self.shared.registry.lock().ref_count(key)
    }

    pub fn channel_status(&self, key: &ChannelKey) -> Option<ChannelStatus> {
        self.shared.registry.lock().status(key)
    }

    pub fn channels(&self) -> Vec<ChannelRecord> {
        self.shared.registry.lock().snapshot()
    }

    pub fn tracked_tables(&self) -> Vec<String> {
        self.shared.tables.lock().iter().cloned().collect()
    }

    /// Wait until every open and close requested so far has been carried out.
    pub async fn sync(&self) {
        self.shared.lifecycle.barrier().await;
    }
}

enum Registration {
    Live(Arc<Shared>, SubscriptionId),
    // Made in emergency mode: no channel, but its key still counts for refreshes.
    Inert(Arc<Shared>, String, QueryKey),
    Released,
}

/// One consumer's interest in a channel. Dropping it unsubscribes.
pub struct SubscriptionHandle {
    key: ChannelKey,
    registration: Registration,
}

impl SubscriptionHandle {
    pub fn channel_key(&self) -> &ChannelKey {
        &self.key
    }

    /// False for inert handles and after unsubscribing.
    pub fn is_active(&self) -> bool {
        matches!(self.registration, Registration::Live(..))
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    // Bookkeeping is updated right here; the channel close is queued.
    fn release(&mut self) {
        match std::mem::replace(&mut self.registration, Registration::Released) {
            Registration::Live(shared, id) => {
                let last = shared.registry.lock().unregister(&self.key, id);
                if last == Some(true) {
                    shared.lifecycle.release(self.key.clone());
                }
            }
            Registration::Inert(shared, table, query_key) => {
                let mut inert = shared.inert.lock();
                if let Some(keys) = inert.get_mut(&table) {
                    if let Some(count) = keys.get_mut(&query_key) {
                        *count -= 1;
                        if *count == 0 {
                            keys.remove(&query_key);
                        }
                    }
                    if keys.is_empty() {
                        inert.remove(&table);
                    }
                }
            }
            Registration::Released => {}
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish()
    }
}
