//! Connection health: polls the transport, reacts to network changes, drives
//! reconnection and decides when cached data counts as stale.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::error::RealtimeError;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::transport::{ConnectionStatus, RealtimeTransport};

/// Source of fresh access tokens. An expired token is a common hidden cause of
/// dropped realtime connections.
#[async_trait]
pub trait SessionRefresher: Send + Sync {
    async fn refresh_session(&self) -> Result<String, RealtimeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered,
    AlreadyInFlight,
    Offline,
    Failed,
}

struct RecoveryGuard<'a>(&'a AtomicBool);

impl Drop for RecoveryGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ConnectionHealthMonitor {
    transport: Arc<dyn RealtimeTransport>,
    session: Option<Arc<dyn SessionRefresher>>,
    settings: HealthConfig,
    retry: RetryPolicy,
    status: watch::Sender<ConnectionStatus>,
    // Bumped after every successful reconnect; channels of the old connection are gone.
    reconnects: watch::Sender<u64>,
    online: AtomicBool,
    recovering: AtomicBool,
    last_refresh: Mutex<Instant>,
    last_token_refresh: Mutex<Option<Instant>>,
    checks: AtomicU64,
    failures: AtomicU64,
}

impl ConnectionHealthMonitor {
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        session: Option<Arc<dyn SessionRefresher>>,
        settings: HealthConfig,
        retry: RetryPolicy,
    ) -> Self {
        let (status, _) = watch::channel(transport.status());
        let (reconnects, _) = watch::channel(0);
        Self {
            transport,
            session,
            settings,
            retry,
            status,
            reconnects,
            online: AtomicBool::new(true),
            recovering: AtomicBool::new(false),
            last_refresh: Mutex::new(Instant::now()),
            last_token_refresh: Mutex::new(None),
            checks: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn status_stream(&self) -> WatchStream<ConnectionStatus> {
        WatchStream::new(self.status.subscribe())
    }

    /// Changes once per successful [`recover_connection`](Self::recover_connection).
    /// A status edge alone does not mean the transport dropped its channels.
    pub fn subscribe_reconnects(&self) -> watch::Receiver<u64> {
        self.reconnects.subscribe()
    }

    fn set_status(&self, next: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!("Connection status {} -> {}", current, next);
            *current = next;
            true
        });
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    /// Shorter while disconnected, so stale data is flagged sooner.
    pub fn staleness_threshold(&self) -> Duration {
        match self.status() {
            ConnectionStatus::Disconnected => self.settings.stale_after_disconnected(),
            ConnectionStatus::Connected | ConnectionStatus::Connecting => self.settings.stale_after(),
        }
    }

    pub fn mark_refreshed(&self) {
        *self.last_refresh.lock() = Instant::now();
    }

    pub fn since_last_refresh(&self) -> Duration {
        self.last_refresh.lock().elapsed()
    }

    pub fn is_stale(&self) -> bool {
        self.since_last_refresh() > self.staleness_threshold()
    }

    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn failure_rate(&self) -> f64 {
        let checks = self.checks();
        if checks == 0 {
            return 0.0;
        }
        self.failures() as f64 / checks as f64
    }

    /// Poll the transport once. A disconnected transport counts as a failed
    /// check and starts a recovery.
    pub async fn check(&self) -> ConnectionStatus {
        self.checks.fetch_add(1, Ordering::Relaxed);
        if self.is_recovering() {
            return self.status();
        }

        let observed = if self.is_online() {
            self.transport.status()
        } else {
            ConnectionStatus::Disconnected
        };
        self.set_status(observed);

        if observed == ConnectionStatus::Disconnected {
            self.failures.fetch_add(1, Ordering::Relaxed);
            if self.is_online() {
                self.recover_connection().await;
            }
        }
        self.status()
    }

    /// Network availability changed (the host's online/offline signal).
    pub async fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if online {
            info!("Network back online");
            self.recover_connection().await;
        } else {
            warn!("Network offline");
            self.set_status(ConnectionStatus::Disconnected);
        }
    }

    /// Reconnect the transport. Concurrent calls while one is running return
    /// `AlreadyInFlight` without touching the transport.
    pub async fn recover_connection(&self) -> RecoveryOutcome {
        if self
            .recovering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Recovery already in flight");
            return RecoveryOutcome::AlreadyInFlight;
        }
        let _guard = RecoveryGuard(&self.recovering);

        if !self.is_online() {
            return RecoveryOutcome::Offline;
        }

        self.set_status(ConnectionStatus::Connecting);
        if self.token_refresh_due() {
            self.refresh_session().await;
        }

        let transport = &self.transport;
        let mut result = retry_with_backoff(&self.retry, |_| transport.reconnect()).await;

        if let Err(e) = &result {
            if e.is_auth() {
                warn!("Reconnect rejected ({}), refreshing session", e);
                if self.refresh_session().await {
                    result = transport.reconnect().await;
                }
            }
        }

        match result {
            Ok(()) => {
                self.set_status(ConnectionStatus::Connected);
                self.reconnects.send_modify(|n| *n += 1);
                RecoveryOutcome::Recovered
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.set_status(ConnectionStatus::Disconnected);
                warn!("Connection recovery failed: {}", e);
                RecoveryOutcome::Failed
            }
        }
    }

    fn token_refresh_due(&self) -> bool {
        if self.session.is_none() {
            return false;
        }
        match *self.last_token_refresh.lock() {
            Some(at) => at.elapsed() >= self.settings.token_refresh_after(),
            None => true,
        }
    }

    /// A channel join was refused for an auth reason: fetch a new session
    /// token and push it to the transport. False without a session source or
    /// when the refresh failed.
    pub async fn refresh_access_token(&self) -> bool {
        warn!("Realtime rejected the session token, refreshing");
        self.refresh_session().await
    }

    async fn refresh_session(&self) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        match session.refresh_session().await {
            Ok(token) => {
                *self.last_token_refresh.lock() = Some(Instant::now());
                if let Err(e) = self.transport.set_access_token(&token).await {
                    warn!("Failed to push refreshed token: {}", e);
                }
                debug!("Session refreshed");
                true
            }
            Err(e) => {
                warn!("Session refresh failed: {}", e);
                false
            }
        }
    }

    /// Poll every `poll_interval` until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.poll_interval());
        interval.tick().await;
        loop {
            interval.tick().await;
            self.check().await;
        }
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }
}
