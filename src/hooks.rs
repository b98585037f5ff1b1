//! Entry points for presentation code: declare the tables a view depends on
//! and read back subscription and freshness status.

use serde::Serialize;
use tokio::time::Duration;
use tracing::debug;

use crate::descriptor::{QueryKey, SubscriptionDescriptor};
use crate::health::RecoveryOutcome;
use crate::manager::{SubscriptionHandle, SubscriptionManager};
use crate::registry::ChannelStatus;
use crate::transport::ConnectionStatus;

pub struct TableSubscription {
    manager: SubscriptionManager,
    handle: SubscriptionHandle,
}

impl TableSubscription {
    pub fn is_subscribed(&self) -> bool {
        self.handle.is_active()
            && self.manager.channel_status(self.handle.channel_key()) == Some(ChannelStatus::Open)
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }
}

pub fn use_table_subscription(
    manager: &SubscriptionManager,
    table: &str,
    query_key: impl Into<QueryKey>,
) -> TableSubscription {
    let handle = manager.subscribe(SubscriptionDescriptor::new(table, query_key));
    TableSubscription { manager: manager.clone(), handle }
}

pub struct MultiTableSubscription {
    subscriptions: Vec<TableSubscription>,
}

impl MultiTableSubscription {
    /// True once every table has a live channel.
    pub fn is_subscribed(&self) -> bool {
        !self.subscriptions.is_empty() && self.subscriptions.iter().all(TableSubscription::is_subscribed)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

pub fn use_multi_table_subscription<K>(manager: &SubscriptionManager, tables: Vec<(&str, K)>) -> MultiTableSubscription
where
    K: Into<QueryKey>,
{
    let subscriptions = tables
        .into_iter()
        .map(|(table, key)| use_table_subscription(manager, table, key))
        .collect();
    MultiTableSubscription { subscriptions }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionStatus {
    pub connection_status: ConnectionStatus,
    pub is_stale: bool,
    pub last_refresh_formatted: String,
    pub is_subscribed: bool,
}

pub struct SubscriptionStatusView {
    manager: SubscriptionManager,
    tables: Vec<String>,
}

impl SubscriptionStatusView {
    pub fn snapshot(&self) -> SubscriptionStatus {
        let health = self.manager.health();
        let channels = self.manager.channels();
        let is_subscribed = !self.tables.is_empty()
            && self.tables.iter().all(|table| {
                channels
                    .iter()
                    .any(|c| &c.key.table == table && c.status == ChannelStatus::Open)
            });

        SubscriptionStatus {
            connection_status: health.status(),
            is_stale: health.is_stale(),
            last_refresh_formatted: format_last_refresh(health.since_last_refresh()),
            is_subscribed,
        }
    }

    /// Manual refresh: recover the connection when it is down, then invalidate
    /// everything the tables feed.
    pub async fn refresh_subscription(&self) -> usize {
        let health = self.manager.health();
        if health.status() == ConnectionStatus::Disconnected {
            let outcome = health.recover_connection().await;
            if outcome != RecoveryOutcome::Recovered {
                debug!("Refreshing without a connection ({:?})", outcome);
            }
        }
        let tables: Vec<&str> = self.tables.iter().map(String::as_str).collect();
        self.manager.force_refresh(Some(tables.as_slice())).await
    }
}

pub fn use_subscription_status(manager: &SubscriptionManager, tables: &[&str]) -> SubscriptionStatusView {
    SubscriptionStatusView {
        manager: manager.clone(),
        tables: tables.iter().map(|t| t.to_string()).collect(),
    }
}

pub fn format_last_refresh(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    match secs {
        0..=4 => "just now".to_string(),
        5..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        _ => format!("{}h ago", secs / 3600),
    }
}
