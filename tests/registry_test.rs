//! 注册中心客户端与名称解析集成测试（内存存储）

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use flare_rpc_discovery::discovery::{
    BackendType, ChangeListener, ChangeNotifier, DiscoveryClient, EtcdDiscoveryClient,
    LeaseOptions, LeaseState, MemoryStore, Registration, RegistryEvent, ServiceEntity,
};
use flare_rpc_discovery::resolver::{DiscoveryResolver, ResolutionListener, ResolutionUpdate};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

const PREFIX: &str = "/services/order/v1/grpc/";

fn options() -> LeaseOptions {
    LeaseOptions {
        ttl: Duration::from_secs(10),
        renew_interval: Duration::from_millis(20),
        grant_timeout: Duration::from_millis(200),
        max_grant_attempts: 3,
        grant_retry_delay: Duration::from_millis(1),
    }
}

fn setup() -> (Arc<MemoryStore>, Arc<ChangeNotifier>, Arc<EtcdDiscoveryClient>) {
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(ChangeNotifier::new());
    let client = Arc::new(EtcdDiscoveryClient::with_store(
        store.clone(),
        options(),
        notifier.clone(),
    ));
    (store, notifier, client)
}

fn value(endpoint: &str, weight: u32) -> String {
    format!(r#"{{"endPoint":"{}","lbWeight":{}}}"#, endpoint, weight)
}

/// 轮询直到条件满足，超时后失败
async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let polled = timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
async fn test_reregistration_keeps_single_lease() {
    let (store, _notifier, client) = setup();
    let key = format!("{}10.0.0.1:9090", PREFIX);

    let mut first = client
        .register_and_keep_alive(&key, &value("10.0.0.1:9090", 5))
        .await;
    let replaced = first
        .wait_for(|s| matches!(s, LeaseState::Leased { .. }))
        .await
        .lease_id();
    let mut second = client
        .register_and_keep_alive(&key, &value("10.0.0.1:9090", 8))
        .await;
    let state = second
        .wait_for(|s| matches!(s, LeaseState::Leased { .. }))
        .await;

    eventually("old lease revoked", || store.active_leases().len() == 1).await;
    assert_ne!(state.lease_id(), replaced);
    assert_eq!(store.lease_of(&key), Some(state.lease_id()));
    assert_eq!(first.state(), LeaseState::Stopped);

    let services = client.find_services(PREFIX).await;
    assert_eq!(services.len(), 1);
    assert_eq!(services.iter().next().unwrap().lb_weight(), 8);
}

#[tokio::test]
async fn test_rapid_reregistration_leaves_no_orphan_lease() {
    for round in 0..10 {
        let (store, _notifier, client) = setup();
        let key = format!("{}10.0.0.1:9090", PREFIX);

        let mut first = client
            .register_and_keep_alive(&key, &value("10.0.0.1:9090", 1))
            .await;
        first
            .wait_for(|s| matches!(s, LeaseState::Leased { .. }))
            .await;

        let second = client
            .register_and_keep_alive(&key, &value("10.0.0.1:9090", 2))
            .await;
        let mut third = client
            .register_and_keep_alive(&key, &value("10.0.0.1:9090", 3))
            .await;
        let lease = third
            .wait_for(|s| matches!(s, LeaseState::Leased { .. }))
            .await
            .lease_id()
            .unwrap();

        eventually("superseded leases revoked", || {
            store.active_leases() == vec![lease]
        })
        .await;
        assert_eq!(store.lease_of(&key), Some(Some(lease)), "round {}", round);
        assert_eq!(second.state(), LeaseState::Stopped, "round {}", round);

        let services = client.find_services(PREFIX).await;
        assert_eq!(services.iter().next().unwrap().lb_weight(), 3);
    }
}

#[tokio::test]
async fn test_lease_loss_is_recovered() {
    let (store, _notifier, client) = setup();
    let key = format!("{}10.0.0.1:9090", PREFIX);

    let mut registration = client
        .register_and_keep_alive(&key, &value("10.0.0.1:9090", 10))
        .await;
    let lost = registration
        .wait_for(|s| matches!(s, LeaseState::Leased { .. }))
        .await
        .lease_id()
        .unwrap();

    assert!(store.expire_lease(lost));
    // 一个续约周期内重新申请并写入
    let recovered = timeout(
        options().renew_interval * 3,
        registration.wait_for(|s| matches!(s, LeaseState::Leased { lease_id } if *lease_id != lost)),
    )
    .await
    .expect("registration should re-grant a lease");

    assert_ne!(recovered.lease_id(), Some(lost));
    assert_eq!(store.lease_of(&key), Some(recovered.lease_id()));
    assert_eq!(client.find_services(PREFIX).await.len(), 1);
}

#[tokio::test]
async fn test_grant_failure_degrades_then_recovers() {
    let (store, _notifier, client) = setup();
    let key = format!("{}10.0.0.2:9090", PREFIX);
    // 前两轮注册都拿不到租约
    store.fail_next_grants(options().max_grant_attempts * 2);

    let mut registration = client
        .register_and_keep_alive(&key, &value("10.0.0.2:9090", 10))
        .await;
    let state = registration
        .wait_for(|s| !matches!(s, LeaseState::Unregistered))
        .await;
    assert_eq!(state, LeaseState::Unleased);
    assert!(registration.is_degraded());

    let state = timeout(
        Duration::from_secs(5),
        registration.wait_for(|s| matches!(s, LeaseState::Leased { .. })),
    )
    .await
    .expect("registration should obtain a lease once grants succeed");
    assert_eq!(store.lease_of(&key), Some(state.lease_id()));
    assert!(!registration.is_degraded());
}

#[tokio::test]
async fn test_find_services_degrades_to_empty() {
    let (store, _notifier, client) = setup();
    assert!(client.find_services(PREFIX).await.is_empty());

    let key = format!("{}10.0.0.3:9090", PREFIX);
    let mut registration = client
        .register_and_keep_alive(&key, &value("10.0.0.3:9090", 10))
        .await;
    registration
        .wait_for(|s| matches!(s, LeaseState::Leased { .. }))
        .await;
    assert_eq!(client.find_services(PREFIX).await.len(), 1);

    store.set_unavailable(true);
    assert!(client.find_services(PREFIX).await.is_empty());
    store.set_unavailable(false);
    assert_eq!(client.find_services(PREFIX).await.len(), 1);
}

struct CountingListener(AtomicUsize);

#[async_trait]
impl ChangeListener for CountingListener {
    async fn on_change(&self, _event: RegistryEvent) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_watch_resubscribes_after_interruption() {
    let (store, notifier, client) = setup();
    let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
    notifier.subscribe(listener.clone());

    client.watch(PREFIX).await;
    let status = client.watch_status(PREFIX).unwrap();
    eventually("watch established", || status.is_live()).await;

    store.interrupt_watches();
    eventually("watch resubscribed", || status.subscriptions() >= 2 && status.is_live()).await;
    assert!(!status.is_stale());
    assert!(store.watch_count() >= 2);

    let before = listener.0.load(Ordering::SeqCst);
    let key = format!("{}10.0.0.4:9090", PREFIX);
    client
        .register_and_keep_alive(&key, &value("10.0.0.4:9090", 10))
        .await;
    eventually("change published after resubscribe", || {
        listener.0.load(Ordering::SeqCst) > before
    })
    .await;
}

#[derive(Default)]
struct RecordingListener {
    updates: Mutex<Vec<ResolutionUpdate>>,
}

#[async_trait]
impl ResolutionListener for RecordingListener {
    async fn on_addresses(&self, update: ResolutionUpdate) {
        self.updates.lock().await.push(update);
    }
}

#[tokio::test]
async fn test_resolver_groups_by_weight_and_follows_changes() {
    let (_store, notifier, client) = setup();
    for (endpoint, weight) in [("10.0.1.1:9090", 10), ("10.0.1.2:9090", 10), ("10.0.1.3:9090", 3)] {
        let mut registration = client
            .register_and_keep_alive(&format!("{}{}", PREFIX, endpoint), &value(endpoint, weight))
            .await;
        registration
            .wait_for(|s| matches!(s, LeaseState::Leased { .. }))
            .await;
    }

    let listener = Arc::new(RecordingListener::default());
    let resolver = Arc::new(DiscoveryResolver::new(
        PREFIX,
        client.clone() as Arc<dyn DiscoveryClient>,
        listener.clone(),
        notifier,
    ));
    resolver.start().await;

    {
        let updates = listener.updates.lock().await;
        let first = updates.first().expect("initial resolution");
        assert_eq!(first.groups.len(), 2);
        assert_eq!(first.groups[0].weight, 10);
        assert_eq!(first.groups[0].addresses.len(), 2);
        assert_eq!(first.groups[1].weight, 3);
        assert_eq!(first.address_count(), 3);
    }

    eventually("resolver watch established", || {
        client.watch_status(PREFIX).is_some_and(|status| status.is_live())
    })
    .await;

    client.deregister(&format!("{}10.0.1.3:9090", PREFIX)).await.unwrap();
    let resolved_two = timeout(Duration::from_secs(5), async {
        loop {
            if listener
                .updates
                .lock()
                .await
                .last()
                .is_some_and(|u| u.address_count() == 2)
            {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(resolved_two.is_ok(), "resolver did not follow deregistration");

    resolver.shutdown().await;
    eventually("watch released", || client.active_watches() == 0).await;
}

/// 查询耗时较长的注册中心客户端，统计查询次数
struct SlowClient {
    inner: Arc<EtcdDiscoveryClient>,
    lookups: AtomicUsize,
}

#[async_trait]
impl DiscoveryClient for SlowClient {
    fn backend_type(&self) -> BackendType {
        self.inner.backend_type()
    }

    async fn register_and_keep_alive(&self, key: &str, value: &str) -> Registration {
        self.inner.register_and_keep_alive(key, value).await
    }

    async fn find_services(&self, key_prefix: &str) -> HashSet<ServiceEntity> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(50)).await;
        self.inner.find_services(key_prefix).await
    }

    async fn watch(&self, _key_prefix: &str) {}

    async fn deregister(&self, key: &str) -> flare_rpc_discovery::Result<()> {
        self.inner.deregister(key).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_concurrent_refreshes_are_coalesced() {
    let (_store, notifier, client) = setup();
    let slow = Arc::new(SlowClient {
        inner: client,
        lookups: AtomicUsize::new(0),
    });
    let listener = Arc::new(RecordingListener::default());
    let resolver = Arc::new(DiscoveryResolver::new(
        PREFIX,
        slow.clone() as Arc<dyn DiscoveryClient>,
        listener.clone(),
        notifier,
    ));

    let refreshes: Vec<_> = (0..16)
        .map(|_| {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.refresh().await })
        })
        .collect();
    for refresh in refreshes {
        refresh.await.unwrap();
    }

    // 一次正在执行的解析 + 合并后的一次补充解析
    assert_eq!(slow.lookups.load(Ordering::SeqCst), 2);
    assert_eq!(listener.updates.lock().await.len(), 2);
    assert!(!resolver.is_resolving());
}
