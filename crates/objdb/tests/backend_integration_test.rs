//! Backend integration tests against real etcd and Consul containers.
//!
//! Every scenario runs once per backend so both adapters are held to the
//! same behaviour.
//!
//! Run with: cargo test -p contiv-objdb --test backend_integration_test -- --ignored

mod store_helper;

use contiv_objdb::{LockEvent, ServiceInfo, WatchEventType};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use store_helper::StoreTestEnv;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

const EVENT_WAIT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Network {
    name: String,
    vlan: u16,
}

async fn next_lock_event(events: &mut broadcast::Receiver<LockEvent>) -> Option<LockEvent> {
    tokio::time::timeout(EVENT_WAIT, events.recv()).await.ok()?.ok()
}

async fn objects_round_trip(env: &StoreTestEnv) {
    let client = env.client().await;
    let blue = Network {
        name: "blue".to_string(),
        vlan: 100,
    };
    let red = Network {
        name: "red".to_string(),
        vlan: 200,
    };
    client.set_obj("nets/blue", &blue).await.unwrap();
    client.set_obj("nets/red", &red).await.unwrap();

    assert_eq!(client.get_obj::<Network>("nets/blue").await.unwrap(), blue);
    assert_eq!(
        client.list_dir("nets").await.unwrap(),
        vec!["nets/blue", "nets/red"]
    );

    client.del_obj("nets/blue").await.unwrap();
    assert!(client
        .get_obj::<Network>("nets/blue")
        .await
        .unwrap_err()
        .is_not_found());
    assert_eq!(client.list_dir_values("nets").await.unwrap().len(), 1);
}

async fn lock_hand_over(env: &StoreTestEnv) {
    let ttl = Duration::from_secs(10);
    let lock1 = env.client().await.new_lock("master", "node1", ttl);
    let lock2 = env.client().await.new_lock("master", "node2", ttl);
    let mut events1 = lock1.subscribe();
    let mut events2 = lock2.subscribe();

    lock1.acquire(Duration::ZERO).await.unwrap();
    assert_eq!(next_lock_event(&mut events1).await, Some(LockEvent::Acquired));
    assert_eq!(lock1.get_holder().await, "node1");

    lock2.acquire(Duration::ZERO).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!lock2.is_acquired());

    lock1.release().await;
    assert_eq!(next_lock_event(&mut events1).await, Some(LockEvent::Released));
    assert_eq!(next_lock_event(&mut events2).await, Some(LockEvent::Acquired));
    assert_eq!(lock2.get_holder().await, "node2");
    lock2.release().await;
}

async fn lock_timeout(env: &StoreTestEnv) {
    let ttl = Duration::from_secs(10);
    let holder = env.client().await.new_lock("timeout", "node1", ttl);
    let waiter = env.client().await.new_lock("timeout", "node2", ttl);
    let mut holder_events = holder.subscribe();
    let mut waiter_events = waiter.subscribe();

    holder.acquire(Duration::ZERO).await.unwrap();
    assert_eq!(next_lock_event(&mut holder_events).await, Some(LockEvent::Acquired));

    waiter.acquire(Duration::from_secs(2)).await.unwrap();
    assert_eq!(
        next_lock_event(&mut waiter_events).await,
        Some(LockEvent::AcquireTimeout)
    );
    waiter.wait_stopped().await;
    assert!(holder.is_acquired());
    holder.release().await;
}

async fn lock_ttl_reclaim(env: &StoreTestEnv) {
    let lock1 = env
        .client()
        .await
        .new_lock("reclaim", "node1", Duration::from_secs(10));
    let lock2 = env
        .client()
        .await
        .new_lock("reclaim", "node2", Duration::from_secs(10));
    let mut events1 = lock1.subscribe();
    let mut events2 = lock2.subscribe();

    lock1.acquire(Duration::ZERO).await.unwrap();
    assert_eq!(next_lock_event(&mut events1).await, Some(LockEvent::Acquired));
    lock2.acquire(Duration::ZERO).await.unwrap();

    lock1.kill();
    let reclaimed = tokio::time::timeout(Duration::from_secs(40), events2.recv())
        .await
        .expect("lock should be reclaimed after the session TTL")
        .unwrap();
    assert_eq!(reclaimed, LockEvent::Acquired);
    lock2.release().await;
}

async fn service_lifecycle(env: &StoreTestEnv) {
    let watcher = env.client().await;
    let member = env.client().await;
    let (tx, mut rx) = mpsc::channel(16);
    let stop = CancellationToken::new();
    watcher.watch_service("athena", tx, stop.clone()).await.unwrap();

    let first = ServiceInfo::new("athena", "10.0.0.1", 4567, 30);
    let second = ServiceInfo::new("athena", "10.0.0.2", 4567, 30);
    member.register_service(first.clone()).await.unwrap();
    member.register_service(second.clone()).await.unwrap();
    member.register_service(second.clone()).await.unwrap();

    let mut adds = Vec::new();
    while adds.len() < 2 {
        let event = tokio::time::timeout(EVENT_WAIT, rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, WatchEventType::Add);
        adds.push(event.service_info);
    }
    adds.sort_by(|a, b| a.host_addr.cmp(&b.host_addr));
    assert_eq!(adds, vec![first.clone(), second.clone()]);
    assert_eq!(member.get_service("athena").await.unwrap().len(), 2);

    member.deregister_service(&first).await.unwrap();
    let event = tokio::time::timeout(EVENT_WAIT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.event_type, WatchEventType::Del);
    assert_eq!(event.service_info, first);

    stop.cancel();
    member.deregister_service(&second).await.unwrap();
    assert!(member.get_service("athena").await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_etcd_backend() {
    let env = StoreTestEnv::etcd().await.expect("Failed to start etcd");
    objects_round_trip(&env).await;
    lock_hand_over(&env).await;
    lock_timeout(&env).await;
    lock_ttl_reclaim(&env).await;
    service_lifecycle(&env).await;
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_consul_backend() {
    let env = StoreTestEnv::consul().await.expect("Failed to start consul");
    objects_round_trip(&env).await;
    lock_hand_over(&env).await;
    lock_timeout(&env).await;
    lock_ttl_reclaim(&env).await;
    service_lifecycle(&env).await;
}
