//! Realtime subscription layer: keeps one channel per (table, filter) pair,
//! turns row changes into query cache invalidations and watches the
//! connection so stale data gets noticed and recovered.

pub mod cache;
pub mod config;
pub mod descriptor;
pub mod dispatcher;
pub mod emergency;
pub mod error;
pub mod event;
pub mod filter;
pub mod health;
pub mod hooks;
pub mod lifecycle;
pub mod logging;
pub mod manager;
pub mod options;
pub mod registry;
pub mod retry;
pub mod tls;
pub mod transport;

pub use cache::{InMemoryQueryCache, QueryCache};
pub use config::Config;
pub use descriptor::{ChannelKey, Priority, QueryKey, SubscriptionDescriptor};
pub use error::{CacheError, RealtimeError};
pub use event::{ChangeEvent, ChangeKind};
pub use health::{ConnectionHealthMonitor, RecoveryOutcome, SessionRefresher};
pub use manager::{SubscriptionHandle, SubscriptionManager};
pub use retry::{retry_with_backoff, RetryPolicy, Retryable};
pub use transport::{ConnectionStatus, RealtimeTransport};
