//! Owns the transport channels.
//!
//! Bookkeeping changes happen synchronously in the registry; the resulting
//! open and close requests are queued here and executed one at a time by a
//! driver task, so a handle dropped during teardown never has to wait for the
//! network. At most one live channel exists per channel key.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::descriptor::ChannelKey;
use crate::dispatcher::InvalidationDispatcher;
use crate::emergency::EmergencySwitch;
use crate::health::ConnectionHealthMonitor;
use crate::registry::{ChannelStatus, Registry};
use crate::retry::{RetryPolicy, Retryable};
use crate::transport::{ChannelId, EventReceiver, RealtimeTransport};

#[derive(Debug)]
pub(crate) enum LifecycleCommand {
    Open(ChannelKey),
    RetryOpen(ChannelKey),
    Release(ChannelKey),
    Expire(ChannelKey, u64),
    Dropped(ChannelKey, ChannelId),
    CloseAll,
    ReopenAll,
    Barrier(oneshot::Sender<()>),
}

/// Sending side of the lifecycle queue. Never blocks.
#[derive(Clone)]
pub struct LifecycleHandle {
    tx: mpsc::UnboundedSender<LifecycleCommand>,
}

impl LifecycleHandle {
    fn send(&self, cmd: LifecycleCommand) {
        if self.tx.send(cmd).is_err() {
            debug!("Lifecycle driver stopped; command dropped");
        }
    }

    pub fn open(&self, key: ChannelKey) {
        self.send(LifecycleCommand::Open(key));
    }

    /// The last subscriber of `key` left.
    pub fn release(&self, key: ChannelKey) {
        self.send(LifecycleCommand::Release(key));
    }

    pub fn close_all(&self) {
        self.send(LifecycleCommand::CloseAll);
    }

    pub fn reopen_all(&self) {
        self.send(LifecycleCommand::ReopenAll);
    }

    /// Resolves once every command queued before it has been processed.
    pub async fn barrier(&self) {
        let (ack, done) = oneshot::channel();
        self.send(LifecycleCommand::Barrier(ack));
        let _ = done.await;
    }
}

struct LiveChannel {
    id: ChannelId,
    forwarder: JoinHandle<()>,
}

pub struct ChannelLifecycleManager {
    transport: Arc<dyn RealtimeTransport>,
    registry: Arc<Mutex<Registry>>,
    dispatcher: InvalidationDispatcher,
    health: Arc<ConnectionHealthMonitor>,
    emergency: Arc<EmergencySwitch>,
    close_grace: Duration,
    retry: RetryPolicy,
    live: HashMap<ChannelKey, LiveChannel>,
    // Failed opens per key, for the backoff delay.
    open_failures: HashMap<ChannelKey, u32>,
    retrying: HashSet<ChannelKey>,
    // Keys that already got a fresh token after a refused join.
    token_refreshed: HashSet<ChannelKey>,
    // Latest release per key; older expiry timers are ignored.
    releases: HashMap<ChannelKey, u64>,
    next_release: u64,
    // Weak so the driver stops once every handle is gone.
    requeue: mpsc::WeakUnboundedSender<LifecycleCommand>,
}

impl ChannelLifecycleManager {
    pub fn spawn(
        transport: Arc<dyn RealtimeTransport>,
        registry: Arc<Mutex<Registry>>,
        dispatcher: InvalidationDispatcher,
        health: Arc<ConnectionHealthMonitor>,
        emergency: Arc<EmergencySwitch>,
        close_grace: Duration,
        retry: RetryPolicy,
    ) -> LifecycleHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Self {
            transport,
            registry,
            dispatcher,
            health,
            emergency,
            close_grace,
            retry,
            live: HashMap::new(),
            open_failures: HashMap::new(),
            retrying: HashSet::new(),
            token_refreshed: HashSet::new(),
            releases: HashMap::new(),
            next_release: 0,
            requeue: tx.downgrade(),
        };
        tokio::spawn(driver.run(rx));
        LifecycleHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LifecycleCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                LifecycleCommand::Open(key) => self.open(key).await,
                LifecycleCommand::RetryOpen(key) => {
                    self.retrying.remove(&key);
                    self.open(key).await;
                }
                LifecycleCommand::Release(key) => self.release(key).await,
                LifecycleCommand::Expire(key, release) => {
                    if self.releases.get(&key) == Some(&release) {
                        self.close_if_idle(key).await;
                    }
                }
                LifecycleCommand::Dropped(key, id) => self.dropped(key, id),
                LifecycleCommand::CloseAll => self.close_all().await,
                LifecycleCommand::ReopenAll => self.reopen_all().await,
                LifecycleCommand::Barrier(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        let keys: Vec<ChannelKey> = self.live.keys().cloned().collect();
        for key in keys {
            self.close(key).await;
        }
        debug!("Lifecycle driver finished");
    }

    async fn open(&mut self, key: ChannelKey) {
        if self.live.contains_key(&key) {
            // Resubscribed within the grace period; the channel is reused.
            self.registry.lock().set_status(&key, ChannelStatus::Open);
            return;
        }
        if self.emergency.is_active() {
            debug!("Emergency mode: not opening {}", key);
            return;
        }
        // All subscribers may have left while the command was queued.
        if !self.registry.lock().contains(&key) {
            self.forget(&key);
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        match self.transport.open(&key, tx).await {
            Ok(id) => {
                self.open_failures.remove(&key);
                self.token_refreshed.remove(&key);
                self.registry.lock().set_status(&key, ChannelStatus::Open);
                let forwarder = self.spawn_forwarder(key.clone(), id, rx);
                info!("Channel {} open for {}", id, key);
                self.live.insert(key, LiveChannel { id, forwarder });
            }
            Err(e) => {
                // Subscribers keep their handles; the page keeps rendering.
                error!("Failed to open channel for {}: {}", key, e);
                self.registry.lock().set_status(&key, ChannelStatus::Closed);

                if e.is_auth() {
                    // One fresh token per key; a second refusal waits for the next reconnect.
                    if self.token_refreshed.insert(key.clone()) && self.health.refresh_access_token().await {
                        self.send_self(LifecycleCommand::Open(key));
                    }
                } else if e.is_retryable() {
                    self.schedule_retry(key);
                }
            }
        }
    }

    fn send_self(&self, cmd: LifecycleCommand) {
        if let Some(tx) = self.requeue.upgrade() {
            let _ = tx.send(cmd);
        }
    }

    fn schedule_retry(&mut self, key: ChannelKey) {
        if !self.retrying.insert(key.clone()) {
            return;
        }
        let failures = self.open_failures.entry(key.clone()).or_insert(0);
        let delay = self.retry.delay_for(*failures);
        *failures = failures.saturating_add(1);
        debug!("Retrying {} in {:?}", key, delay);

        let requeue = self.requeue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = requeue.upgrade() {
                let _ = tx.send(LifecycleCommand::RetryOpen(key));
            }
        });
    }

    fn forget(&mut self, key: &ChannelKey) {
        self.open_failures.remove(key);
        self.token_refreshed.remove(key);
        self.releases.remove(key);
    }

    fn spawn_forwarder(&self, key: ChannelKey, id: ChannelId, mut rx: EventReceiver) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let dispatcher = self.dispatcher.clone();
        let health = Arc::clone(&self.health);
        let requeue = self.requeue.clone();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let keys = {
                    let mut registry = registry.lock();
                    registry.record_event(&key, Instant::now());
                    registry.query_keys(&key)
                };
                if dispatcher.dispatch(&event, &keys).await {
                    health.mark_refreshed();
                }
            }
            // The transport dropped the channel on its own.
            if let Some(tx) = requeue.upgrade() {
                let _ = tx.send(LifecycleCommand::Dropped(key, id));
            }
        })
    }

    async fn release(&mut self, key: ChannelKey) {
        if self.close_grace.is_zero() {
            self.close_if_idle(key).await;
            return;
        }
        self.next_release += 1;
        let release = self.next_release;
        self.releases.insert(key.clone(), release);

        let grace = self.close_grace;
        let requeue = self.requeue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(tx) = requeue.upgrade() {
                let _ = tx.send(LifecycleCommand::Expire(key, release));
            }
        });
    }

    async fn close_if_idle(&mut self, key: ChannelKey) {
        // Someone subscribed again in the meantime.
        if self.registry.lock().contains(&key) {
            return;
        }
        self.forget(&key);
        self.close(key).await;
    }

    async fn close(&mut self, key: ChannelKey) {
        self.releases.remove(&key);
        let Some(live) = self.live.remove(&key) else {
            return;
        };
        live.forwarder.abort();
        match self.transport.close(live.id).await {
            Ok(()) => info!("Channel {} closed for {}", live.id, key),
            Err(e) => warn!("Failed to close channel {} for {}: {}", live.id, key, e),
        }
    }

    fn dropped(&mut self, key: ChannelKey, id: ChannelId) {
        if self.live.get(&key).map(|l| l.id) != Some(id) {
            return;
        }
        self.live.remove(&key);
        let subscribed = {
            let mut registry = self.registry.lock();
            registry.set_status(&key, ChannelStatus::Closed);
            registry.contains(&key)
        };
        warn!("Channel {} for {} was dropped by the transport", id, key);
        if subscribed {
            self.schedule_retry(key);
        }
    }

    async fn close_all(&mut self) {
        let keys: Vec<ChannelKey> = self.live.keys().cloned().collect();
        for key in keys {
            self.close(key).await;
        }
        let mut registry = self.registry.lock();
        for key in registry.channel_keys() {
            registry.set_status(&key, ChannelStatus::Closed);
        }
    }

    /// Replace every channel, highest priority first. Used after a reconnect,
    /// when channels of the previous connection are gone.
    async fn reopen_all(&mut self) {
        if self.emergency.is_active() {
            return;
        }
        // A new connection may accept tokens the old one refused.
        self.token_refreshed.clear();
        let live: Vec<ChannelKey> = self.live.keys().cloned().collect();
        for key in live {
            self.close(key).await;
        }
        let keys = {
            let mut registry = self.registry.lock();
            let keys = registry.channel_keys();
            for key in &keys {
                registry.set_status(key, ChannelStatus::Connecting);
            }
            keys
        };
        info!("Reopening {} channels", keys.len());
        for key in keys {
            self.open(key).await;
        }
    }
}
