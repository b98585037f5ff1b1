use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

/// Manual circuit breaker for realtime traffic. Nothing trips it
/// automatically and nothing releases it automatically; an operator does both.
#[derive(Debug, Default)]
pub struct EmergencySwitch {
    active: AtomicBool,
    since: Mutex<Option<(Instant, String)>>,
}

impl EmergencySwitch {
    pub fn new(active: bool) -> Self {
        let switch = Self::default();
        if active {
            switch.activate("enabled at start-up");
        }
        switch
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Returns false when it was already active.
    pub fn activate(&self, reason: &str) -> bool {
        if self.active.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.since.lock() = Some((Instant::now(), reason.to_string()));
        warn!("Emergency mode ON ({}): realtime subscriptions disabled", reason);
        true
    }

    /// Returns false when it was not active.
    pub fn deactivate(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        let since = self.since.lock().take();
        if let Some((at, reason)) = since {
            info!("Emergency mode OFF after {:?} (was: {})", at.elapsed(), reason);
        }
        true
    }

    pub fn activated_for(&self) -> Option<Duration> {
        self.since.lock().as_ref().map(|(at, _)| at.elapsed())
    }

    pub fn reason(&self) -> Option<String> {
        self.since.lock().as_ref().map(|(_, reason)| reason.clone())
    }
}
