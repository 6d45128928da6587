//! etcd 后端集成测试
//!
//! 这些测试需要运行中的 etcd 服务器实例。
//! 默认情况下，测试会被忽略，需要使用 `cargo test --test etcd_backend_test -- --ignored` 运行。
//!
//! 启动 etcd 服务器：
//! ```bash
//! # 使用 Docker 启动 etcd
//! docker run -d --name etcd-test -p 2379:2379 -p 2380:2380 \
//!   quay.io/coreos/etcd:v3.5.9 \
//!   etcd --advertise-client-urls=http://127.0.0.1:2379 \
//!        --listen-client-urls=http://0.0.0.0:2379
//! ```

#![cfg(feature = "etcd")]

use std::sync::Arc;

use anyhow::Context;

use flare_rpc_discovery::config::EtcdConfig;
use flare_rpc_discovery::discovery::{
    ChangeNotifier, DiscoveryClient, EtcdDiscoveryClient, LeaseState, RegistryStore,
};
use flare_rpc_discovery::discovery::store::EtcdStore;
use tokio::time::{Duration, sleep, timeout};

/// etcd 服务器地址
/// 可以通过环境变量 ETCD_ENDPOINTS 覆盖，默认为 http://127.0.0.1:2379
fn etcd_endpoints() -> Vec<String> {
    std::env::var("ETCD_ENDPOINTS")
        .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_else(|_| vec!["http://127.0.0.1:2379".to_string()])
}

fn config() -> EtcdConfig {
    EtcdConfig {
        endpoints: etcd_endpoints(),
        lease_ttl_secs: 4,
        renew_interval_secs: 1,
        ..EtcdConfig::default()
    }
}

/// 每个测试使用独立的服务名，避免互相干扰
fn test_prefix(name: &str) -> String {
    format!("/services/flare-test-{}-{}/v1/grpc/", name, std::process::id())
}

async fn connect() -> anyhow::Result<(Arc<ChangeNotifier>, EtcdDiscoveryClient)> {
    let notifier = Arc::new(ChangeNotifier::new());
    let client = EtcdDiscoveryClient::connect(&config(), notifier.clone())
        .await
        .context("etcd should be reachable, set ETCD_ENDPOINTS")?;
    Ok((notifier, client))
}

#[tokio::test]
#[ignore]
async fn test_register_find_and_deregister() -> anyhow::Result<()> {
    let (_notifier, client) = connect().await?;
    let prefix = test_prefix("register");
    let key = format!("{}127.0.0.1:50051", prefix);

    let mut registration = client
        .register_and_keep_alive(&key, r#"{"endPoint":"127.0.0.1:50051","lbWeight":7}"#)
        .await;
    let state = timeout(
        Duration::from_secs(10),
        registration.wait_for(|s| matches!(s, LeaseState::Leased { .. })),
    )
    .await
    .expect("registration should be leased");
    assert!(state.lease_id().is_some());

    let services = client.find_services(&prefix).await;
    assert_eq!(services.len(), 1);
    let entity = services.iter().next().unwrap();
    assert_eq!(entity.endpoint(), "127.0.0.1:50051");
    assert_eq!(entity.lb_weight(), 7);

    // 超过 TTL 后仍然存在，说明续约生效
    sleep(Duration::from_secs(6)).await;
    assert_eq!(client.find_services(&prefix).await.len(), 1);

    client.deregister(&key).await?;
    assert!(client.find_services(&prefix).await.is_empty());
    client.close().await;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_lease_revoked_externally_is_recovered() -> anyhow::Result<()> {
    let (_notifier, client) = connect().await?;
    let prefix = test_prefix("revoke");
    let key = format!("{}127.0.0.1:50052", prefix);

    let mut registration = client
        .register_and_keep_alive(&key, r#"{"endPoint":"127.0.0.1:50052","lbWeight":10}"#)
        .await;
    let lost = registration
        .wait_for(|s| matches!(s, LeaseState::Leased { .. }))
        .await
        .lease_id()
        .unwrap();

    // 通过独立连接撤销租约，模拟注册中心侧租约丢失
    let store = EtcdStore::connect(&config()).await?;
    store.lease_revoke(lost).await?;

    let recovered = timeout(
        Duration::from_secs(10),
        registration.wait_for(|s| matches!(s, LeaseState::Leased { lease_id } if *lease_id != lost)),
    )
    .await
    .expect("registration should re-grant a lease");
    assert_ne!(recovered.lease_id(), Some(lost));
    assert_eq!(client.find_services(&prefix).await.len(), 1);

    client.close().await;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_watch_publishes_changes() -> anyhow::Result<()> {
    let (notifier, client) = connect().await?;
    let prefix = test_prefix("watch");
    let key = format!("{}127.0.0.1:50053", prefix);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    struct Forward(tokio::sync::mpsc::UnboundedSender<String>);

    #[async_trait::async_trait]
    impl flare_rpc_discovery::discovery::ChangeListener for Forward {
        async fn on_change(&self, event: flare_rpc_discovery::discovery::RegistryEvent) {
            let _ = self.0.send(event.prefix().to_string());
        }
    }
    notifier.subscribe(Arc::new(Forward(tx)));

    client.watch(&prefix).await;
    let status = client.watch_status(&prefix).unwrap();
    timeout(Duration::from_secs(10), async {
        while !status.is_live() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("watch should be established");
    while rx.try_recv().is_ok() {}

    client
        .register_and_keep_alive(&key, r#"{"endPoint":"127.0.0.1:50053","lbWeight":10}"#)
        .await;
    let changed = timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("change should be published")
        .unwrap();
    assert_eq!(changed, prefix);

    client.close().await;
    Ok(())
}
