//! 前缀监听守护任务
//!
//! 监听流出错或结束后按指数退避重新订阅，重新订阅成功时补发一次变更事件，
//! 覆盖断开期间可能丢失的注册中心变化。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::notifier::{ChangeNotifier, RegistryEvent};
use super::store::RegistryStore;
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};

/// 连续失败达到该次数后认为监听已失效
pub const STALE_THRESHOLD: u32 = 5;

const BACKOFF_BASE: Duration = Duration::from_millis(200);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// 监听状态
#[derive(Debug, Default)]
pub struct WatchStatus {
    live: AtomicBool,
    consecutive_failures: AtomicU32,
    subscriptions: AtomicU64,
}

impl WatchStatus {
    /// 当前是否持有一个正常的监听流
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// 重新订阅连续失败次数过多，地址列表可能已过期
    pub fn is_stale(&self) -> bool {
        self.consecutive_failures() >= STALE_THRESHOLD
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// 成功建立监听流的次数（含首次）
    pub fn subscriptions(&self) -> u64 {
        self.subscriptions.load(Ordering::Acquire)
    }

    fn mark_live(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.subscriptions.fetch_add(1, Ordering::AcqRel);
        self.live.store(true, Ordering::Release);
    }

    fn mark_failed(&self) -> u32 {
        self.live.store(false, Ordering::Release);
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// 单个前缀的监听守护
pub(crate) struct WatchSupervisor {
    store: Arc<dyn RegistryStore>,
    prefix: String,
    notifier: Arc<ChangeNotifier>,
    status: Arc<WatchStatus>,
    backoff: ExponentialBackoffPolicy,
}

impl WatchSupervisor {
    pub(crate) fn new(
        store: Arc<dyn RegistryStore>,
        prefix: impl Into<String>,
        notifier: Arc<ChangeNotifier>,
        status: Arc<WatchStatus>,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            notifier,
            status,
            backoff: ExponentialBackoffPolicy::unbounded(BACKOFF_BASE, BACKOFF_MAX).with_jitter(0.2),
        }
    }

    pub(crate) async fn run(self, cancel: CancellationToken) {
        let prefix = self.prefix.as_str();
        let mut resubscribing = false;

        'supervise: loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.store.watch_prefix(prefix).await {
                Ok(mut stream) => {
                    self.status.mark_live();
                    if resubscribing {
                        info!(prefix, "Watch resubscribed");
                        self.notifier.publish(RegistryEvent::changed(prefix));
                    } else {
                        debug!(prefix, "Watch started");
                    }

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                debug!(prefix, "Watch cancelled");
                                break 'supervise;
                            }
                            item = stream.next() => match item {
                                // 建立监听时的确认响应不带事件
                                Some(Ok(batch)) if batch.events.is_empty() => {}
                                Some(Ok(batch)) => {
                                    debug!(prefix, events = batch.events.len(), "Watch event");
                                    self.notifier.publish(RegistryEvent::changed(prefix));
                                }
                                Some(Err(e)) => {
                                    warn!(prefix, error = %e, "Watch stream error");
                                    break;
                                }
                                None => {
                                    warn!(prefix, "Watch stream completed");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(prefix, error = %e, "Failed to watch registry prefix");
                }
            }

            resubscribing = true;
            let failures = self.status.mark_failed();
            if failures == STALE_THRESHOLD {
                error!(prefix, failures, "Watch is stale, addresses may be outdated");
            }

            let delay = self.backoff.backoff_duration(failures as usize);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.status.live.store(false, Ordering::Release);
    }
}
