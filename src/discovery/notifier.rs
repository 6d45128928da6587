//! 注册中心变更通知
//!
//! 监听任务收到注册中心事件后发布一次 [`RegistryEvent`]，
//! 每个订阅者在独立的任务中处理，互不阻塞，也不阻塞发布方。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

/// 注册中心变更事件
///
/// 只表示"注册中心的某个前缀发生过变化"，订阅者需要自行重新查询。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEvent {
    prefix: String,
}

impl RegistryEvent {
    pub fn changed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// 变更订阅者
#[async_trait]
pub trait ChangeListener: Send + Sync {
    async fn on_change(&self, event: RegistryEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// 变更通知器
#[derive(Default)]
pub struct ChangeNotifier {
    subscribers: DashMap<SubscriptionId, Arc<dyn ChangeListener>>,
    next_id: AtomicU64,
}

static GLOBAL_NOTIFIER: OnceLock<Arc<ChangeNotifier>> = OnceLock::new();

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 进程级共享通知器
    pub fn global() -> Arc<ChangeNotifier> {
        GLOBAL_NOTIFIER
            .get_or_init(|| Arc::new(ChangeNotifier::new()))
            .clone()
    }

    pub fn subscribe(&self, listener: Arc<dyn ChangeListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.insert(id, listener);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// 发布事件，返回分发到的订阅者数量
    pub fn publish(&self, event: RegistryEvent) -> usize {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(prefix = %event.prefix, "No tokio runtime, registry event dropped");
                return 0;
            }
        };

        // 先取快照，避免在 DashMap 分片锁内 spawn
        let listeners: Vec<Arc<dyn ChangeListener>> = self
            .subscribers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        debug!(
            prefix = %event.prefix,
            subscribers = listeners.len(),
            "Publishing registry event"
        );
        for listener in &listeners {
            let listener = listener.clone();
            let event = event.clone();
            handle.spawn(async move { listener.on_change(event).await });
        }
        listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Counting {
        calls: AtomicUsize,
        notify: Notify,
    }

    #[async_trait]
    impl ChangeListener for Counting {
        async fn on_change(&self, _event: RegistryEvent) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_one();
        }
    }

    struct Blocking;

    #[async_trait]
    impl ChangeListener for Blocking {
        async fn on_change(&self, _event: RegistryEvent) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let notifier = ChangeNotifier::new();
        let counting = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            notify: Notify::new(),
        });
        notifier.subscribe(Arc::new(Blocking));
        notifier.subscribe(counting.clone());

        assert_eq!(notifier.publish(RegistryEvent::changed("/services/a/")), 2);
        tokio::time::timeout(Duration::from_secs(1), counting.notify.notified())
            .await
            .unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let notifier = ChangeNotifier::new();
        let id = notifier.subscribe(Arc::new(Blocking));
        assert_eq!(notifier.subscriber_count(), 1);
        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));
        assert_eq!(notifier.publish(RegistryEvent::changed("/")), 0);
    }
}
