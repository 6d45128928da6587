//! 租约续约任务
//!
//! 每个注册键对应一个续约任务：
//! 1. 申请租约（带超时与有限次重试），失败则以无租约方式写入
//! 2. 按续约间隔发送 keep-alive；返回 TTL 为 0 说明租约已丢失，立即重新注册
//! 3. 无租约或写入失败时，每个续约周期重新尝试完整注册

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{LeaseOptions, LeaseState};
use crate::discovery::store::RegistryStore;
use crate::retry::{FixedRetryPolicy, RetryPolicy};

pub(super) struct LeaseKeeper {
    store: Arc<dyn RegistryStore>,
    key: String,
    value: String,
    options: LeaseOptions,
    state: watch::Sender<LeaseState>,
}

impl LeaseKeeper {
    pub(super) fn new(
        store: Arc<dyn RegistryStore>,
        key: impl Into<String>,
        value: impl Into<String>,
        options: LeaseOptions,
        state: watch::Sender<LeaseState>,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            value: value.into(),
            options,
            state,
        }
    }

    /// 运行续约循环，返回退出时持有的租约
    ///
    /// `replaced` 是同一个键上一次注册的租约，新注册完成后撤销；
    /// 首次注册前被取消时原样返回，交给下一个续约任务撤销。
    pub(super) async fn run(self, replaced: Option<i64>, cancel: CancellationToken) -> Option<i64> {
        let Some(state) = self.register(&cancel).await else {
            debug!(
                key = %self.key,
                replaced = ?replaced,
                "Lease keeper cancelled before registering"
            );
            self.state.send_replace(LeaseState::Stopped);
            return replaced;
        };
        if let Some(old) = replaced {
            self.revoke(old).await;
        }
        self.state.send_replace(state);

        let mut lease = state.lease_id();
        let mut ticker = tokio::time::interval(self.options.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 第一次 tick 立即完成
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            lease = match lease {
                Some(lease_id) => self.keep_alive(lease_id, &cancel).await,
                None => self.reregister(&cancel).await,
            };
        }

        debug!(key = %self.key, lease_id = ?lease, "Lease keeper stopped");
        self.state.send_replace(LeaseState::Stopped);
        lease
    }

    async fn keep_alive(&self, lease_id: i64, cancel: &CancellationToken) -> Option<i64> {
        match self.store.lease_keep_alive_once(lease_id).await {
            Ok(ttl) if ttl > 0 => {
                debug!(key = %self.key, lease_id, ttl, "Lease renewed");
                Some(lease_id)
            }
            Ok(_) => {
                warn!(key = %self.key, lease_id, "Lease expired, re-registering service");
                self.reregister(cancel).await
            }
            Err(e) => {
                // 保留租约，下个周期再试；若期间已过期会得到 TTL 0
                error!(key = %self.key, lease_id, error = %e, "Failed to renew lease");
                Some(lease_id)
            }
        }
    }

    async fn reregister(&self, cancel: &CancellationToken) -> Option<i64> {
        let state = self.register(cancel).await?;
        self.state.send_replace(state);
        state.lease_id()
    }

    /// 申请租约并写入注册键
    ///
    /// 只在申请租约期间响应取消，返回 `None`；写入开始后一定执行完，
    /// 保证拿到的租约要么被返回要么被撤销。
    async fn register(&self, cancel: &CancellationToken) -> Option<LeaseState> {
        let lease = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            lease = self.grant_lease() => lease,
        };
        if lease.is_none() {
            warn!(
                key = %self.key,
                "Can't get a lease, registering without lease, please check the registry connection"
            );
        }

        match self.store.put(&self.key, &self.value, lease).await {
            Ok(()) => {
                info!(key = %self.key, lease_id = ?lease, "Service registered");
                Some(match lease {
                    Some(lease_id) => LeaseState::Leased { lease_id },
                    None => LeaseState::Unleased,
                })
            }
            Err(e) => {
                error!(key = %self.key, error = %e, "Failed to register service");
                if let Some(lease_id) = lease {
                    self.revoke(lease_id).await;
                }
                Some(LeaseState::Unregistered)
            }
        }
    }

    async fn grant_lease(&self) -> Option<i64> {
        let policy = FixedRetryPolicy::new(
            self.options.max_grant_attempts,
            self.options.grant_retry_delay,
        );

        let mut attempt = 0;
        loop {
            attempt += 1;
            let grant = self.store.lease_grant(self.options.ttl);
            match tokio::time::timeout(self.options.grant_timeout, grant).await {
                Ok(Ok(lease_id)) => return Some(lease_id),
                Ok(Err(e)) => {
                    error!(key = %self.key, attempt, error = %e, "Failed to grant lease");
                }
                Err(_) => {
                    error!(
                        key = %self.key,
                        attempt,
                        timeout = ?self.options.grant_timeout,
                        "Lease grant timed out"
                    );
                }
            }

            if !policy.should_retry(attempt) {
                return None;
            }
            tokio::time::sleep(policy.backoff_duration(attempt)).await;
        }
    }

    async fn revoke(&self, lease_id: i64) {
        match self.store.lease_revoke(lease_id).await {
            Ok(()) => debug!(key = %self.key, lease_id, "Lease revoked"),
            Err(e) => debug!(key = %self.key, lease_id, error = %e, "Failed to revoke lease"),
        }
    }
}
