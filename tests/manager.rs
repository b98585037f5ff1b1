use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use rs_realtime::config::SubscriptionConfig;
use rs_realtime::registry::ChannelStatus;
use rs_realtime::transport::MemoryTransport;
use rs_realtime::{
    CacheError, ChangeEvent, ChannelKey, ConnectionStatus, InMemoryQueryCache, Priority, QueryCache, QueryKey,
    RealtimeError, RecoveryOutcome, RetryPolicy, SessionRefresher, SubscriptionDescriptor, SubscriptionManager,
};

struct Fixture {
    transport: Arc<MemoryTransport>,
    cache: Arc<InMemoryQueryCache>,
    manager: SubscriptionManager,
}

fn fixture(subscriptions: SubscriptionConfig) -> Fixture {
    let transport = Arc::new(MemoryTransport::new());
    let cache = Arc::new(InMemoryQueryCache::new());
    let manager = SubscriptionManager::builder(transport.clone(), cache.clone())
        .subscriptions(subscriptions)
        .retry(RetryPolicy { max_retries: 2, base_delay_ms: 10, max_delay_ms: 100, jitter_ms: 0 })
        .build();
    Fixture { transport, cache, manager }
}

// Let forwarders and watchers run, then drain the lifecycle queue.
async fn settle(manager: &SubscriptionManager) {
    for _ in 0..3 {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        manager.sync().await;
    }
}

fn jobs() -> ChannelKey {
    ChannelKey::new("jobs", None)
}

#[tokio::test(start_paused = true)]
async fn same_table_and_filter_share_one_channel() {
    let f = fixture(SubscriptionConfig::default());

    let a = f.manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    let b = f.manager.subscribe(SubscriptionDescriptor::new("jobs", ["jobs", "list"]));
    settle(&f.manager).await;

    assert_eq!(f.transport.open_count(), 1);
    assert_eq!(f.manager.ref_count(&jobs()), 2);
    assert_eq!(f.manager.channel_status(&jobs()), Some(ChannelStatus::Open));

    drop(a);
    settle(&f.manager).await;
    assert_eq!(f.transport.live_count(&jobs()), 1);
    assert_eq!(f.transport.close_count(), 0);

    b.unsubscribe();
    settle(&f.manager).await;
    assert_eq!(f.transport.live_count(&jobs()), 0);
    assert_eq!(f.transport.close_count(), 1);
    assert_eq!(f.manager.channel_status(&jobs()), None);
}

#[tokio::test(start_paused = true)]
async fn different_filters_get_their_own_channels() {
    let f = fixture(SubscriptionConfig::default());

    let _all = f.manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    let _five = f
        .manager
        .subscribe(SubscriptionDescriptor::new("jobs", ["jobs", "5"]).with_filter("id=eq.5"));
    settle(&f.manager).await;

    assert_eq!(f.transport.open_count(), 2);
    assert_eq!(f.manager.channels().len(), 2);
    assert_eq!(f.manager.ref_count(&ChannelKey::new("jobs", Some("id=eq.5".to_string()))), 1);
}

#[tokio::test(start_paused = true)]
async fn row_change_invalidates_matching_keys_only() {
    let f = fixture(SubscriptionConfig::default());
    let mut invalidated = f.cache.watch();

    let _a = f.manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    let _b = f
        .manager
        .subscribe(SubscriptionDescriptor::new("jobs", ["jobs", "5"]).with_filter("id=eq.5"));
    let _c = f.manager.subscribe(SubscriptionDescriptor::new("tours", "tours"));
    settle(&f.manager).await;

    let delivered = f.transport.emit(ChangeEvent::insert("jobs", json!({ "id": 5, "title": "Roof" })));
    assert_eq!(delivered, 2);
    settle(&f.manager).await;

    let mut seen = vec![invalidated.recv().await.unwrap(), invalidated.recv().await.unwrap()];
    seen.sort();
    assert_eq!(seen, vec![QueryKey::from("jobs"), QueryKey::from(["jobs", "5"])]);
    assert_eq!(f.cache.invalidation_count(&QueryKey::from("tours")), 0);
    assert!(invalidated.try_recv().is_err());

    // id 6 only reaches the unfiltered channel
    assert_eq!(f.transport.emit(ChangeEvent::insert("jobs", json!({ "id": 6 }))), 1);
    settle(&f.manager).await;
    assert_eq!(f.cache.invalidation_count(&QueryKey::from("jobs")), 2);
    assert_eq!(f.cache.invalidation_count(&QueryKey::from(["jobs", "5"])), 1);

    let record = f.manager.channels().into_iter().find(|c| c.key == jobs()).unwrap();
    assert!(record.last_event_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn emergency_mode_opens_nothing_but_still_refreshes() {
    let f = fixture(SubscriptionConfig { emergency_mode: true, ..Default::default() });
    assert!(f.manager.is_emergency_mode());

    let inert = f.manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    settle(&f.manager).await;
    assert!(!inert.is_active());
    assert_eq!(f.transport.open_count(), 0);
    assert_eq!(f.manager.ref_count(&jobs()), 0);

    assert_eq!(f.manager.force_refresh(None).await, 1);
    assert_eq!(f.cache.invalidation_count(&QueryKey::from("jobs")), 1);
    assert_eq!(f.manager.force_refresh(Some(&["crew"][..])).await, 1);
    assert_eq!(f.cache.invalidation_count(&QueryKey::from("crew")), 1);
}

#[tokio::test(start_paused = true)]
async fn emergency_toggle_closes_and_reopens_channels() {
    let f = fixture(SubscriptionConfig::default());
    let handle = f.manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    settle(&f.manager).await;
    assert_eq!(f.transport.live_channels(), vec![jobs()]);

    f.manager.enable_emergency_mode("realtime outage");
    settle(&f.manager).await;
    assert!(f.transport.live_channels().is_empty());
    assert_eq!(f.manager.channel_status(&jobs()), Some(ChannelStatus::Closed));
    assert_eq!(f.manager.emergency().reason().as_deref(), Some("realtime outage"));

    let _inert = f.manager.subscribe(SubscriptionDescriptor::new("tours", "tours"));
    settle(&f.manager).await;
    assert_eq!(f.transport.open_count(), 1);

    f.manager.disable_emergency_mode();
    settle(&f.manager).await;
    assert!(handle.is_active());
    assert_eq!(f.transport.live_channels(), vec![jobs()]);
    assert_eq!(f.manager.channel_status(&jobs()), Some(ChannelStatus::Open));
}

#[tokio::test(start_paused = true)]
async fn failed_open_leaves_subscriber_in_place() {
    let f = fixture(SubscriptionConfig::default());
    f.transport.fail_opens(true);

    let handle = f.manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    settle(&f.manager).await;

    assert!(handle.is_active());
    assert_eq!(f.manager.ref_count(&jobs()), 1);
    assert_eq!(f.manager.channel_status(&jobs()), Some(ChannelStatus::Closed));
    assert!(f.transport.live_channels().is_empty());

    // refresh works without a channel
    assert_eq!(f.manager.force_refresh(Some(&["jobs"][..])).await, 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_a_handle_updates_bookkeeping_immediately() {
    let f = fixture(SubscriptionConfig::default());
    let a = f.manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    let b = f.manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    assert_eq!(f.manager.ref_count(&jobs()), 2);

    drop(a);
    assert_eq!(f.manager.ref_count(&jobs()), 1);
    drop(b);
    assert_eq!(f.manager.ref_count(&jobs()), 0);

    // open and close were both queued before anything ran
    settle(&f.manager).await;
    assert!(f.transport.live_channels().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconnect_reopens_channels_by_priority() {
    let f = fixture(SubscriptionConfig::default());
    let _low = f
        .manager
        .subscribe(SubscriptionDescriptor::new("tours", "tours").with_priority(Priority::Low));
    let _high = f
        .manager
        .subscribe(SubscriptionDescriptor::new("jobs", "jobs").with_priority(Priority::High));
    settle(&f.manager).await;
    assert_eq!(f.transport.open_count(), 2);

    let health = f.manager.health();
    f.transport.set_status(ConnectionStatus::Disconnected);
    assert_eq!(health.check().await, ConnectionStatus::Connected);
    settle(&f.manager).await;

    assert_eq!(f.transport.reconnect_count(), 1);
    assert_eq!(f.transport.open_count(), 4);
    assert_eq!(f.transport.live_channels().len(), 2);
    let statuses: Vec<_> = f.manager.channels().into_iter().map(|c| (c.key.table, c.status)).collect();
    assert_eq!(
        statuses,
        vec![("jobs".to_string(), ChannelStatus::Open), ("tours".to_string(), ChannelStatus::Open)]
    );

    // events flow on the new channels
    assert_eq!(f.transport.emit(ChangeEvent::delete("jobs", json!({ "id": 1 }))), 1);
    settle(&f.manager).await;
    assert_eq!(f.cache.invalidation_count(&QueryKey::from("jobs")), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_recoveries_share_one_reconnect() {
    let transport = Arc::new(MemoryTransport::new().with_reconnect_delay(Duration::from_secs(1)));
    let cache = Arc::new(InMemoryQueryCache::new());
    let manager = SubscriptionManager::builder(transport.clone(), cache).build();
    transport.set_status(ConnectionStatus::Disconnected);

    let health = manager.health();
    let (first, second) = tokio::join!(health.recover_connection(), health.recover_connection());
    assert_eq!(first, RecoveryOutcome::Recovered);
    assert_eq!(second, RecoveryOutcome::AlreadyInFlight);
    assert_eq!(transport.reconnect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn grace_period_keeps_channel_for_quick_resubscribe() {
    let f = fixture(SubscriptionConfig { close_grace_ms: 500, ..Default::default() });

    let first = f.manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    settle(&f.manager).await;
    drop(first);
    settle(&f.manager).await;
    assert_eq!(f.transport.live_count(&jobs()), 1);

    tokio::time::advance(Duration::from_millis(200)).await;
    let second = f.manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    settle(&f.manager).await;
    assert_eq!(f.manager.channel_status(&jobs()), Some(ChannelStatus::Open));

    // the pending expiry finds a subscriber and leaves the channel alone
    tokio::time::advance(Duration::from_millis(400)).await;
    settle(&f.manager).await;
    assert_eq!(f.transport.open_count(), 1);
    assert_eq!(f.transport.live_count(&jobs()), 1);

    drop(second);
    settle(&f.manager).await;
    tokio::time::advance(Duration::from_millis(600)).await;
    settle(&f.manager).await;
    assert_eq!(f.transport.live_count(&jobs()), 0);
    assert_eq!(f.transport.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn force_refresh_uses_every_tracked_key() {
    let f = fixture(SubscriptionConfig::default());
    let _a = f.manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    let _b = f.manager.subscribe(SubscriptionDescriptor::new("jobs", ["jobs", "5"]).with_filter("id=eq.5"));
    let _c = f.manager.subscribe(SubscriptionDescriptor::new("tours", "tours"));

    assert_eq!(f.manager.tracked_tables(), vec!["jobs", "tours"]);
    assert_eq!(f.manager.force_refresh(Some(&["jobs"][..])).await, 2);
    assert_eq!(f.manager.force_refresh(None).await, 3);
    assert_eq!(f.cache.invalidation_count(&QueryKey::from("tours")), 1);
    assert!(!f.manager.health().is_stale());
}

struct CountingSession(AtomicUsize);

#[async_trait]
impl SessionRefresher for CountingSession {
    async fn refresh_session(&self) -> Result<String, RealtimeError> {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("token-{}", n))
    }
}

struct BrokenCache;

#[async_trait]
impl QueryCache for BrokenCache {
    async fn invalidate_queries(&self, _key: &QueryKey) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("refetch failed".into()))
    }

    async fn set_query_data(&self, _key: &QueryKey, _value: Value) -> Result<(), CacheError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn failed_open_is_retried_with_backoff() {
    let f = fixture(SubscriptionConfig::default());
    f.transport.fail_opens(true);

    let _handle = f.manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    settle(&f.manager).await;
    assert_eq!(f.manager.channel_status(&jobs()), Some(ChannelStatus::Closed));

    // first retry after 10ms still fails
    tokio::time::advance(Duration::from_millis(10)).await;
    settle(&f.manager).await;
    assert_eq!(f.transport.open_count(), 0);

    f.transport.fail_opens(false);
    tokio::time::advance(Duration::from_millis(20)).await;
    settle(&f.manager).await;
    assert_eq!(f.manager.channel_status(&jobs()), Some(ChannelStatus::Open));
    assert_eq!(f.transport.open_count(), 1);
    assert_eq!(f.transport.live_count(&jobs()), 1);
}

#[tokio::test(start_paused = true)]
async fn new_subscriber_reopens_a_closed_channel() {
    let transport = Arc::new(MemoryTransport::new());
    let manager = SubscriptionManager::builder(transport.clone(), Arc::new(InMemoryQueryCache::new()))
        .retry(RetryPolicy { max_retries: 2, base_delay_ms: 60_000, max_delay_ms: 60_000, jitter_ms: 0 })
        .build();
    transport.fail_opens(true);

    let _first = manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    settle(&manager).await;
    assert_eq!(manager.channel_status(&jobs()), Some(ChannelStatus::Closed));

    transport.fail_opens(false);
    let _second = manager.subscribe(SubscriptionDescriptor::new("jobs", ["jobs", "board"]));
    settle(&manager).await;

    assert_eq!(manager.ref_count(&jobs()), 2);
    assert_eq!(manager.channel_status(&jobs()), Some(ChannelStatus::Open));
    assert_eq!(transport.live_count(&jobs()), 1);
}

#[tokio::test(start_paused = true)]
async fn refused_token_is_refreshed_and_join_repeated() {
    let transport = Arc::new(MemoryTransport::new());
    let session = Arc::new(CountingSession(AtomicUsize::new(0)));
    let manager = SubscriptionManager::builder(transport.clone(), Arc::new(InMemoryQueryCache::new()))
        .session(session.clone())
        .build();
    transport.script_open(Err(RealtimeError::TokenExpired));

    let _handle = manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    settle(&manager).await;

    assert_eq!(session.0.load(Ordering::SeqCst), 1);
    assert_eq!(transport.access_tokens(), vec!["token-1"]);
    assert_eq!(manager.channel_status(&jobs()), Some(ChannelStatus::Open));
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn token_is_refreshed_once_per_refused_channel() {
    let transport = Arc::new(MemoryTransport::new());
    let session = Arc::new(CountingSession(AtomicUsize::new(0)));
    let manager = SubscriptionManager::builder(transport.clone(), Arc::new(InMemoryQueryCache::new()))
        .session(session.clone())
        .build();
    transport.script_open(Err(RealtimeError::TokenExpired));
    transport.script_open(Err(RealtimeError::Auth("invalid JWT".into())));

    let _handle = manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    settle(&manager).await;
    tokio::time::advance(Duration::from_secs(600)).await;
    settle(&manager).await;

    assert_eq!(session.0.load(Ordering::SeqCst), 1);
    assert_eq!(transport.open_count(), 0);
    assert_eq!(manager.channel_status(&jobs()), Some(ChannelStatus::Closed));
}

#[tokio::test(start_paused = true)]
async fn connecting_without_a_reconnect_keeps_channels() {
    let transport = Arc::new(MemoryTransport::new());
    transport.set_status(ConnectionStatus::Disconnected);
    let manager = SubscriptionManager::builder(transport.clone(), Arc::new(InMemoryQueryCache::new())).build();

    // the transport came up by itself, e.g. on the first channel open
    transport.set_status(ConnectionStatus::Connected);
    let _handle = manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    settle(&manager).await;
    assert_eq!(transport.open_count(), 1);

    let health = manager.health();
    assert_eq!(health.status(), ConnectionStatus::Disconnected);
    assert_eq!(health.check().await, ConnectionStatus::Connected);
    settle(&manager).await;

    assert_eq!(transport.reconnect_count(), 0);
    assert_eq!(transport.open_count(), 1);
    assert_eq!(transport.close_count(), 0);
    assert_eq!(transport.live_count(&jobs()), 1);
}

#[tokio::test(start_paused = true)]
async fn earlier_release_does_not_cut_a_later_grace_period() {
    let f = fixture(SubscriptionConfig { close_grace_ms: 500, ..Default::default() });

    let first = f.manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    settle(&f.manager).await;
    drop(first);
    settle(&f.manager).await;

    tokio::time::advance(Duration::from_millis(200)).await;
    let second = f.manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    settle(&f.manager).await;
    drop(second);
    settle(&f.manager).await;

    // the first grace period ends here; the second runs until 700ms
    tokio::time::advance(Duration::from_millis(400)).await;
    settle(&f.manager).await;
    assert_eq!(f.transport.live_count(&jobs()), 1);

    tokio::time::advance(Duration::from_millis(200)).await;
    settle(&f.manager).await;
    assert_eq!(f.transport.live_count(&jobs()), 0);
    assert_eq!(f.transport.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn refresh_keys_follow_current_subscribers() {
    let f = fixture(SubscriptionConfig::default());
    let row = f
        .manager
        .subscribe(SubscriptionDescriptor::new("jobs", ["jobs", "5"]).with_filter("id=eq.5"));
    let list = f.manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    settle(&f.manager).await;
    assert_eq!(f.manager.force_refresh(None).await, 2);

    drop(row);
    settle(&f.manager).await;
    assert_eq!(f.manager.force_refresh(None).await, 1);
    assert_eq!(f.cache.invalidation_count(&QueryKey::from(["jobs", "5"])), 1);

    drop(list);
    settle(&f.manager).await;
    assert_eq!(f.manager.force_refresh(None).await, 1);
    assert_eq!(f.cache.invalidation_count(&QueryKey::from("jobs")), 3);
    assert_eq!(f.manager.tracked_tables(), vec!["jobs"]);
}

#[tokio::test(start_paused = true)]
async fn inert_keys_are_counted_per_handle() {
    let f = fixture(SubscriptionConfig { emergency_mode: true, ..Default::default() });
    let a = f.manager.subscribe(SubscriptionDescriptor::new("jobs", ["jobs", "5"]));
    let b = f.manager.subscribe(SubscriptionDescriptor::new("jobs", ["jobs", "5"]));

    drop(a);
    assert_eq!(f.manager.force_refresh(Some(&["jobs"][..])).await, 1);
    assert_eq!(f.cache.invalidation_count(&QueryKey::from(["jobs", "5"])), 1);

    drop(b);
    assert_eq!(f.manager.force_refresh(Some(&["jobs"][..])).await, 1);
    assert_eq!(f.cache.invalidation_count(&QueryKey::from(["jobs", "5"])), 1);
    assert_eq!(f.cache.invalidation_count(&QueryKey::from("jobs")), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_invalidations_leave_data_stale() {
    let transport = Arc::new(MemoryTransport::new());
    let manager = SubscriptionManager::builder(transport.clone(), Arc::new(BrokenCache)).build();
    let _handle = manager.subscribe(SubscriptionDescriptor::new("jobs", "jobs"));
    settle(&manager).await;

    tokio::time::advance(Duration::from_secs(400)).await;
    let health = manager.health();
    assert!(health.is_stale());

    assert_eq!(manager.force_refresh(None).await, 0);
    assert!(health.is_stale());

    assert_eq!(transport.emit(ChangeEvent::insert("jobs", json!({ "id": 1 }))), 1);
    settle(&manager).await;
    assert!(health.is_stale());
}
