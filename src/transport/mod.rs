//! The realtime publish/subscribe boundary.
//!
//! A transport opens one channel per channel key and pushes every change
//! event of that channel into the sender it was given. Everything above this
//! trait is independent of the wire protocol.

pub mod memory;
pub mod phoenix;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::descriptor::ChannelKey;
use crate::error::RealtimeError;
use crate::event::ChangeEvent;

pub use memory::MemoryTransport;
pub use phoenix::{PhoenixSettings, PhoenixTransport};

pub type EventSender = mpsc::UnboundedSender<ChangeEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ChangeEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connected => "connected",
            Self::Connecting => "connecting",
            Self::Disconnected => "disconnected",
        };
        write!(f, "{}", name)
    }
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Start listening for insert, update and delete events on `key`.
    async fn open(&self, key: &ChannelKey, events: EventSender) -> Result<ChannelId, RealtimeError>;

    /// Stop a channel. Closing an unknown id is not an error.
    async fn close(&self, id: ChannelId) -> Result<(), RealtimeError>;

    /// State of the underlying connection as the transport sees it.
    fn status(&self) -> ConnectionStatus;

    /// Re-establish the connection. Channels opened before are dropped.
    async fn reconnect(&self) -> Result<(), RealtimeError>;

    /// Push a fresh access token to the server.
    async fn set_access_token(&self, _token: &str) -> Result<(), RealtimeError> {
        Ok(())
    }
}
