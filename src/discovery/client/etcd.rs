//! 基于租约的注册中心客户端（etcd）

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::keeper::LeaseKeeper;
use super::{BackendType, DiscoveryClient, LeaseOptions, LeaseState, Registration};
use crate::discovery::entity::ServiceEntity;
use crate::discovery::notifier::ChangeNotifier;
use crate::discovery::store::RegistryStore;
use crate::discovery::watch::{WatchStatus, WatchSupervisor};
use crate::error::Result;

struct KeeperHandle {
    cancel: CancellationToken,
    task: JoinHandle<Option<i64>>,
    state: watch::Receiver<LeaseState>,
}

impl KeeperHandle {
    /// 停止续约任务，返回它最后持有的租约
    async fn stop(self) -> Option<i64> {
        self.cancel.cancel();
        match self.task.await {
            Ok(lease) => lease,
            Err(e) => {
                debug!(error = %e, "Lease keeper task aborted");
                self.state.borrow().lease_id()
            }
        }
    }
}

struct WatchHandle {
    cancel: CancellationToken,
    status: Arc<WatchStatus>,
    watchers: usize,
}

/// etcd 注册中心客户端
///
/// 所有注册中心操作通过 [`RegistryStore`] 完成，测试中可以替换为内存实现。
pub struct EtcdDiscoveryClient {
    store: Arc<dyn RegistryStore>,
    options: LeaseOptions,
    notifier: Arc<ChangeNotifier>,
    registrations: Mutex<HashMap<String, KeeperHandle>>,
    watches: DashMap<String, WatchHandle>,
}

impl EtcdDiscoveryClient {
    /// 连接 etcd
    #[cfg(feature = "etcd")]
    pub async fn connect(
        config: &crate::config::EtcdConfig,
        notifier: Arc<ChangeNotifier>,
    ) -> Result<Self> {
        let store = crate::discovery::store::EtcdStore::connect(config).await?;
        Ok(Self::with_store(
            Arc::new(store),
            LeaseOptions::from(config),
            notifier,
        ))
    }

    pub fn with_store(
        store: Arc<dyn RegistryStore>,
        options: LeaseOptions,
        notifier: Arc<ChangeNotifier>,
    ) -> Self {
        Self {
            store,
            options,
            notifier,
            registrations: Mutex::new(HashMap::new()),
            watches: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }

    pub fn options(&self) -> &LeaseOptions {
        &self.options
    }

    /// 当前键的注册句柄
    pub async fn registration(&self, key: &str) -> Option<Registration> {
        self.registrations
            .lock()
            .await
            .get(key)
            .map(|handle| Registration::new(key, handle.state.clone()))
    }

    /// 当前正在监听的前缀数量
    pub fn active_watches(&self) -> usize {
        self.watches.len()
    }
}

#[async_trait]
impl DiscoveryClient for EtcdDiscoveryClient {
    fn backend_type(&self) -> BackendType {
        BackendType::Etcd
    }

    async fn register_and_keep_alive(&self, key: &str, value: &str) -> Registration {
        let mut registrations = self.registrations.lock().await;

        let replaced = match registrations.remove(key) {
            Some(previous) => {
                info!(key, "Replacing existing registration");
                previous.stop().await
            }
            None => None,
        };

        let (tx, rx) = watch::channel(LeaseState::Unregistered);
        let keeper = LeaseKeeper::new(
            self.store.clone(),
            key,
            value,
            self.options.clone(),
            tx,
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(keeper.run(replaced, cancel.clone()));

        registrations.insert(
            key.to_string(),
            KeeperHandle {
                cancel,
                task,
                state: rx.clone(),
            },
        );
        Registration::new(key, rx)
    }

    async fn find_services(&self, key_prefix: &str) -> HashSet<ServiceEntity> {
        let kvs = match self.store.get_prefix(key_prefix).await {
            Ok(kvs) => kvs,
            Err(e) => {
                error!(prefix = key_prefix, error = %e, "Failed to query registry");
                return HashSet::new();
            }
        };

        kvs.into_iter()
            .filter_map(|kv| match ServiceEntity::from_registry_value(&kv.value) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    warn!(key = %kv.key, error = %e, "Skipping malformed registry entry");
                    None
                }
            })
            .collect()
    }

    async fn watch(&self, key_prefix: &str) {
        let mut handle = self
            .watches
            .entry(key_prefix.to_string())
            .or_insert_with(|| {
                let status = Arc::new(WatchStatus::default());
                let cancel = CancellationToken::new();
                let supervisor = WatchSupervisor::new(
                    self.store.clone(),
                    key_prefix,
                    self.notifier.clone(),
                    status.clone(),
                );
                tokio::spawn(supervisor.run(cancel.clone()));
                info!(prefix = key_prefix, "Watching registry prefix");
                WatchHandle {
                    cancel,
                    status,
                    watchers: 0,
                }
            });
        handle.watchers += 1;
    }

    async fn unwatch(&self, key_prefix: &str) {
        if let Some(mut handle) = self.watches.get_mut(key_prefix) {
            handle.watchers = handle.watchers.saturating_sub(1);
        }
        if let Some((_, handle)) = self
            .watches
            .remove_if(key_prefix, |_, handle| handle.watchers == 0)
        {
            handle.cancel.cancel();
            info!(prefix = key_prefix, "Stopped watching registry prefix");
        }
    }

    fn watch_status(&self, key_prefix: &str) -> Option<Arc<WatchStatus>> {
        self.watches
            .get(key_prefix)
            .map(|handle| handle.status.clone())
    }

    async fn deregister(&self, key: &str) -> Result<()> {
        let handle = self.registrations.lock().await.remove(key);
        let lease = match handle {
            Some(handle) => handle.stop().await,
            None => None,
        };
        if let Some(lease_id) = lease {
            // 租约可能已经过期，撤销失败不影响删除
            if let Err(e) = self.store.lease_revoke(lease_id).await {
                warn!(key, lease_id, error = %e, "Failed to revoke lease on deregister");
            }
        }
        // 无租约写入的键需要显式删除
        self.store.delete(key).await?;
        info!(key, "Service deregistered");
        Ok(())
    }

    async fn close(&self) {
        let keys: Vec<String> = self.registrations.lock().await.keys().cloned().collect();
        for key in keys {
            if let Err(e) = self.deregister(&key).await {
                warn!(key = %key, error = %e, "Failed to deregister service on close");
            }
        }

        let prefixes: Vec<String> = self.watches.iter().map(|e| e.key().clone()).collect();
        for prefix in prefixes {
            if let Some((_, handle)) = self.watches.remove(&prefix) {
                handle.cancel.cancel();
            }
        }
        info!("Discovery client closed");
    }
}
