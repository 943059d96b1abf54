//! Service registration, refresh and watch against a shared memory store.
//!
//! Run with: cargo test -p contiv-objdb --test service_test


use async_trait::async_trait;
use contiv_objdb::{
    KvEvent, KvPair, MemoryStore, ObjdbError, Result, ServiceInfo, ServiceRegistry, SessionId,
    StoreAdapter, WatchCursor, WatchEventType, WatchServiceEvent,
};
use memory_helper::{eventually, fast_config, MemoryCluster};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const EVENT_WAIT: Duration = Duration::from_secs(3);

fn netplugin(host: &str, port: u16, ttl: u64) -> ServiceInfo {
    ServiceInfo::new("netplugin", host, port, ttl).with_hostname(format!("node-{}", port))
}

async fn next(rx: &mut mpsc::Receiver<WatchServiceEvent>) -> Option<WatchServiceEvent> {
    tokio::time::timeout(EVENT_WAIT, rx.recv()).await.ok()?
}

#[tokio::test]
async fn test_register_get_deregister() {
    let cluster = MemoryCluster::new();
    let client = cluster.client().await;
    let info = netplugin("10.0.0.1", 9001, 30);

    client.register_service(info.clone()).await.unwrap();
    assert_eq!(client.get_service("netplugin").await.unwrap(), vec![info.clone()]);
    assert_eq!(
        client.services().registered_services(),
        vec!["/contiv.io/service/netplugin/10.0.0.1:9001".to_string()]
    );

    // Another member sees the same registration.
    let other = cluster.client().await;
    assert_eq!(other.get_service("netplugin").await.unwrap(), vec![info.clone()]);

    client.deregister_service(&info).await.unwrap();
    assert!(client.get_service("netplugin").await.unwrap().is_empty());
    assert!(client.services().registered_services().is_empty());
    assert_eq!(cluster.store.session_count(), 0);
}

#[tokio::test]
async fn test_unknown_service_is_empty() {
    let cluster = MemoryCluster::new();
    let client = cluster.client().await;
    assert!(client.get_service("nobody").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reregister_keeps_single_entry() {
    let cluster = MemoryCluster::new();
    let client = cluster.client().await;
    let info = netplugin("10.0.0.1", 9001, 30);

    for _ in 0..3 {
        client.register_service(info.clone()).await.unwrap();
    }
    assert_eq!(client.get_service("netplugin").await.unwrap().len(), 1);
    assert_eq!(cluster.store.stats().sessions_created, 1);

    let retuned = ServiceInfo { ttl: 60, ..info.clone() };
    client.register_service(retuned.clone()).await.unwrap();
    assert_eq!(client.get_service("netplugin").await.unwrap(), vec![retuned]);
    assert_eq!(cluster.store.stats().sessions_created, 2);
    assert_eq!(cluster.store.session_count(), 1);

    client.deregister_service(&info).await.unwrap();
}

#[tokio::test]
async fn test_deregister_unregistered_fails() {
    let cluster = MemoryCluster::new();
    let client = cluster.client().await;
    let info = netplugin("10.0.0.9", 9009, 30);

    assert!(matches!(
        client.deregister_service(&info).await,
        Err(ObjdbError::ServiceNotRegistered { .. })
    ));
}

#[tokio::test]
async fn test_zero_ttl_rejected() {
    let cluster = MemoryCluster::new();
    let client = cluster.client().await;
    assert!(client
        .register_service(netplugin("10.0.0.1", 9001, 0))
        .await
        .is_err());
}

#[tokio::test]
async fn test_watch_reports_adds_and_deletes() {
    let cluster = MemoryCluster::new();
    let watcher = cluster.client().await;
    let member = cluster.client().await;
    let (tx, mut rx) = mpsc::channel(16);
    let stop = CancellationToken::new();

    watcher
        .watch_service("netplugin", tx, stop.clone())
        .await
        .unwrap();

    let first = netplugin("10.0.0.1", 9001, 30);
    let second = netplugin("10.0.0.2", 9002, 30);
    member.register_service(first.clone()).await.unwrap();
    member.register_service(second.clone()).await.unwrap();

    let mut added = vec![next(&mut rx).await.unwrap(), next(&mut rx).await.unwrap()];
    added.sort_by_key(|e| e.service_info.port);
    assert!(added.iter().all(|e| e.event_type == WatchEventType::Add));
    assert_eq!(added[0].service_info, first);
    assert_eq!(added[1].service_info, second);

    member.deregister_service(&first).await.unwrap();
    let removed = next(&mut rx).await.unwrap();
    assert_eq!(removed.event_type, WatchEventType::Del);
    assert_eq!(removed.service_info, first);

    stop.cancel();
    member.deregister_service(&second).await.unwrap();
    assert!(next(&mut rx).await.is_none());
}

#[tokio::test]
async fn test_watch_starts_with_existing_instances() {
    let cluster = MemoryCluster::new();
    let member = cluster.client().await;
    let info = netplugin("10.0.0.1", 9001, 3);
    member.register_service(info.clone()).await.unwrap();

    let watcher = cluster.client().await;
    let (tx, mut rx) = mpsc::channel(16);
    let stop = CancellationToken::new();
    watcher.watch_service("netplugin", tx, stop.clone()).await.unwrap();

    let event = next(&mut rx).await.unwrap();
    assert_eq!(event.event_type, WatchEventType::Add);
    assert_eq!(event.service_info, info);

    // Refreshes rewrite the key but must not repeat the Add.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert!(rx.try_recv().is_err());

    stop.cancel();
    member.deregister_service(&info).await.unwrap();
}

#[tokio::test]
async fn test_watch_reports_undecodable_entry() {
    let cluster = MemoryCluster::new();
    let watcher = cluster.client().await;
    let (tx, mut rx) = mpsc::channel(16);
    let stop = CancellationToken::new();
    watcher.watch_service("netplugin", tx, stop.clone()).await.unwrap();

    cluster
        .store
        .put("/contiv.io/service/netplugin/bogus:1", b"garbage")
        .await
        .unwrap();

    let event = next(&mut rx).await.unwrap();
    assert_eq!(event.event_type, WatchEventType::Error);
    assert_eq!(event.service_info.service_name, "netplugin");
    stop.cancel();
}

#[tokio::test]
async fn test_watch_reports_undecodable_existing_entry() {
    let cluster = MemoryCluster::new();
    let member = cluster.client().await;
    let first = netplugin("10.0.0.1", 9001, 30);
    member.register_service(first.clone()).await.unwrap();
    cluster
        .store
        .put("/contiv.io/service/netplugin/bogus:1", b"garbage")
        .await
        .unwrap();

    let watcher = cluster.client().await;
    let (tx, mut rx) = mpsc::channel(16);
    let stop = CancellationToken::new();
    watcher.watch_service("netplugin", tx, stop.clone()).await.unwrap();

    let event = next(&mut rx).await.unwrap();
    assert_eq!(event.event_type, WatchEventType::Add);
    assert_eq!(event.service_info, first);
    let event = next(&mut rx).await.unwrap();
    assert_eq!(event.event_type, WatchEventType::Error);
    assert_eq!(event.service_info.service_name, "netplugin");

    // The watch keeps running past the bad entry.
    let second = netplugin("10.0.0.2", 9002, 30);
    member.register_service(second.clone()).await.unwrap();
    let event = next(&mut rx).await.unwrap();
    assert_eq!(event.event_type, WatchEventType::Add);
    assert_eq!(event.service_info, second);

    stop.cancel();
    member.deregister_service(&first).await.unwrap();
    member.deregister_service(&second).await.unwrap();
}

#[tokio::test]
async fn test_registration_survives_store_outage() {
    let cluster = MemoryCluster::new();
    let client = cluster.client().await;
    let info = netplugin("10.0.0.1", 9001, 3);
    client.register_service(info.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    cluster.store.set_available(false);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    cluster.store.set_available(true);

    // Past the point where an unrefreshed registration would have expired.
    tokio::time::sleep(Duration::from_millis(2300)).await;
    assert_eq!(client.get_service("netplugin").await.unwrap(), vec![info.clone()]);

    client.deregister_service(&info).await.unwrap();
}

#[tokio::test]
async fn test_lost_session_is_replaced() {
    let cluster = MemoryCluster::new();
    let client = cluster.client().await;
    let info = netplugin("10.0.0.1", 9001, 3);
    client.register_service(info.clone()).await.unwrap();

    let session = cluster.store.get(&info.key()).await.unwrap().session.unwrap();
    cluster.store.expire_session(&session);
    assert!(client.get_service("netplugin").await.unwrap().is_empty());

    let back = eventually(Duration::from_secs(3), || async {
        client.get_service("netplugin").await.map(|s| s.len() == 1).unwrap_or(false)
    })
    .await;
    assert!(back, "registration should be rewritten under a new session");
    let fresh = cluster.store.get(&info.key()).await.unwrap().session.unwrap();
    assert_ne!(fresh, session);

    client.deregister_service(&info).await.unwrap();
    assert_eq!(cluster.store.session_count(), 0);
}

/// Memory store whose session creation yields for a while, so concurrent
/// registrations interleave.
struct SlowSessions {
    inner: Arc<MemoryStore>,
}

#[async_trait]
impl StoreAdapter for SlowSessions {
    fn name(&self) -> &str {
        "slow"
    }

    async fn get(&self, key: &str) -> Result<KvPair> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<(Vec<KvPair>, u64)> {
        self.inner.list(prefix).await
    }

    async fn watch(
        &self,
        prefix: &str,
        cursor: &mut WatchCursor,
        wait: Duration,
    ) -> Result<Vec<KvEvent>> {
        self.inner.watch(prefix, cursor, wait).await
    }

    async fn create_session(&self, ttl: Duration) -> Result<SessionId> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.create_session(ttl).await
    }

    async fn renew_session(&self, session: &SessionId) -> Result<()> {
        self.inner.renew_session(session).await
    }

    async fn destroy_session(&self, session: &SessionId) -> Result<()> {
        self.inner.destroy_session(session).await
    }

    async fn acquire_key(&self, key: &str, value: &[u8], session: &SessionId) -> Result<bool> {
        self.inner.acquire_key(key, value, session).await
    }

    async fn release_key(&self, key: &str, session: &SessionId) -> Result<()> {
        self.inner.release_key(key, session).await
    }

    async fn put_with_session(&self, key: &str, value: &[u8], session: &SessionId) -> Result<()> {
        self.inner.put_with_session(key, value, session).await
    }
}

#[tokio::test]
async fn test_concurrent_registration_stays_deregistered() {
    let store = Arc::new(MemoryStore::new());
    let registry = ServiceRegistry::new(
        Arc::new(SlowSessions {
            inner: store.clone(),
        }),
        fast_config().watch,
    );
    let info = netplugin("10.0.0.1", 9001, 3);

    let (a, b) = tokio::join!(
        registry.register_service(info.clone()),
        registry.register_service(info.clone())
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(registry.registered_services().len(), 1);
    assert_eq!(store.stats().sessions_created, 1);

    registry.deregister_service(&info).await.unwrap();

    // Several refresh periods later nothing has brought the key back.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(registry.get_service("netplugin").await.unwrap().is_empty());
    assert_eq!(store.session_count(), 0);
}
