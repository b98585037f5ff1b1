use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{ChannelId, ConnectionStatus, EventSender, RealtimeTransport};
use crate::descriptor::ChannelKey;
use crate::error::RealtimeError;
use crate::event::ChangeEvent;
use crate::filter::RowFilter;

struct MemoryChannel {
    key: ChannelKey,
    filter: Option<RowFilter>,
    events: EventSender,
}

struct MemoryState {
    next_id: u64,
    channels: BTreeMap<ChannelId, MemoryChannel>,
    status: ConnectionStatus,
    opens: usize,
    closes: usize,
    reconnects: usize,
    fail_opens: bool,
    reconnect_results: VecDeque<Result<(), RealtimeError>>,
    open_results: VecDeque<Result<(), RealtimeError>>,
    tokens: Vec<String>,
}

/// In-process transport. Events are injected with [`MemoryTransport::emit`]
/// and routed to every open channel whose table and row filter match.
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    reconnect_delay: Duration,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_id: 1,
                channels: BTreeMap::new(),
                status: ConnectionStatus::Connected,
                opens: 0,
                closes: 0,
                reconnects: 0,
                fail_opens: false,
                reconnect_results: VecDeque::new(),
                open_results: VecDeque::new(),
                tokens: Vec::new(),
            }),
            reconnect_delay: Duration::ZERO,
        }
    }

    /// Make every reconnect take `delay` before it resolves.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Deliver an event; returns how many channels received it.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        let state = self.state.lock();
        let row = event.row().cloned().unwrap_or_default();
        let mut delivered = 0;
        for channel in state.channels.values() {
            if channel.key.table != event.table {
                continue;
            }
            if let Some(filter) = &channel.filter {
                if !filter.matches(&row) {
                    continue;
                }
            }
            if channel.events.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.state.lock().status = status;
    }

    pub fn fail_opens(&self, fail: bool) {
        self.state.lock().fail_opens = fail;
    }

    /// Queue the outcome of the next reconnect; unscripted reconnects succeed.
    pub fn script_reconnect(&self, result: Result<(), RealtimeError>) {
        self.state.lock().reconnect_results.push_back(result);
    }

    /// Queue the outcome of the next channel open; unscripted opens succeed.
    pub fn script_open(&self, result: Result<(), RealtimeError>) {
        self.state.lock().open_results.push_back(result);
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    pub fn reconnect_count(&self) -> usize {
        self.state.lock().reconnects
    }

    pub fn live_channels(&self) -> Vec<ChannelKey> {
        self.state.lock().channels.values().map(|c| c.key.clone()).collect()
    }

    pub fn live_count(&self, key: &ChannelKey) -> usize {
        self.state.lock().channels.values().filter(|c| &c.key == key).count()
    }

    pub fn access_tokens(&self) -> Vec<String> {
        self.state.lock().tokens.clone()
    }
}

#[async_trait]
impl RealtimeTransport for MemoryTransport {
    async fn open(&self, key: &ChannelKey, events: EventSender) -> Result<ChannelId, RealtimeError> {
        let mut state = self.state.lock();
        if state.fail_opens {
            return Err(RealtimeError::ChannelOpen {
                key: key.to_string(),
                reason: "transport refused the channel".to_string(),
            });
        }
        if state.status == ConnectionStatus::Disconnected {
            return Err(RealtimeError::ConnectionClosed);
        }
        if let Some(Err(e)) = state.open_results.pop_front() {
            return Err(e);
        }
        let filter = key.filter.as_deref().map(RowFilter::parse).transpose()?;

        let id = ChannelId(state.next_id);
        state.next_id += 1;
        state.opens += 1;
        state.channels.insert(id, MemoryChannel { key: key.clone(), filter, events });
        debug!("Memory channel {} opened for {}", id, key);
        Ok(id)
    }

    async fn close(&self, id: ChannelId) -> Result<(), RealtimeError> {
        let mut state = self.state.lock();
        if state.channels.remove(&id).is_some() {
            state.closes += 1;
        }
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    async fn reconnect(&self) -> Result<(), RealtimeError> {
        if !self.reconnect_delay.is_zero() {
            tokio::time::sleep(self.reconnect_delay).await;
        }
        let mut state = self.state.lock();
        state.reconnects += 1;
        let result = state.reconnect_results.pop_front().unwrap_or(Ok(()));
        match &result {
            Ok(()) => {
                state.status = ConnectionStatus::Connected;
                state.channels.clear();
            }
            Err(_) => state.status = ConnectionStatus::Disconnected,
        }
        result
    }

    async fn set_access_token(&self, token: &str) -> Result<(), RealtimeError> {
        self.state.lock().tokens.push(token.to_string());
        Ok(())
    }
}
