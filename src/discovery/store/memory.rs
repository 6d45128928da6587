//! 内存存储实现
//!
//! 进程内模拟租约与前缀监听，用于单元测试和不依赖 etcd 的本地调试。
//! 额外提供故障注入接口：让租约立即过期、让接下来的若干次租约申请失败、
//! 让存储整体不可用、以及中断当前所有监听流。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{KeyValue, RegistryStore, WatchBatch, WatchEvent, WatchEventKind, WatchStream};
use crate::error::{FlareError, Result};

const WATCH_BUFFER: usize = 256;

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    lease_id: Option<i64>,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<i64, Duration>,
    next_lease_id: i64,
}

/// 内存存储
pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<WatchBatch>,
    watch_generation: Mutex<CancellationToken>,
    unavailable: AtomicBool,
    failing_grants: AtomicUsize,
    grant_count: AtomicUsize,
    watch_count: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            state: Mutex::new(State {
                next_lease_id: 1,
                ..State::default()
            }),
            events,
            watch_generation: Mutex::new(CancellationToken::new()),
            unavailable: AtomicBool::new(false),
            failing_grants: AtomicUsize::new(0),
            grant_count: AtomicUsize::new(0),
            watch_count: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(FlareError::registry_unavailable("memory store is unavailable"));
        }
        Ok(())
    }

    fn emit(&self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        // 没有订阅者时发送失败，直接忽略
        let _ = self.events.send(WatchBatch { events });
    }

    /// 删除租约及其绑定的键，返回删除事件
    fn drop_lease(state: &mut State, lease_id: i64) -> Vec<WatchEvent> {
        state.leases.remove(&lease_id);
        let keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.lease_id == Some(lease_id))
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter()
            .map(|key| {
                state.entries.remove(&key);
                WatchEvent {
                    kind: WatchEventKind::Delete,
                    key,
                }
            })
            .collect()
    }

    /// 让租约立即过期（模拟注册中心侧的租约丢失）
    pub fn expire_lease(&self, lease_id: i64) -> bool {
        let events = {
            let mut state = self.state();
            if !state.leases.contains_key(&lease_id) {
                return false;
            }
            Self::drop_lease(&mut state, lease_id)
        };
        debug!(lease_id, "lease expired");
        self.emit(events);
        true
    }

    /// 让接下来 `count` 次租约申请失败
    pub fn fail_next_grants(&self, count: usize) {
        self.failing_grants.store(count, Ordering::Release);
    }

    /// 设置存储整体不可用
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// 中断当前所有监听流（流正常结束）
    pub fn interrupt_watches(&self) {
        let mut generation = self
            .watch_generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        generation.cancel();
        *generation = CancellationToken::new();
    }

    pub fn active_leases(&self) -> Vec<i64> {
        let mut leases: Vec<i64> = self.state().leases.keys().copied().collect();
        leases.sort_unstable();
        leases
    }

    /// 键绑定的租约；键不存在返回 `None`，未绑定租约返回 `Some(None)`
    pub fn lease_of(&self, key: &str) -> Option<Option<i64>> {
        self.state().entries.get(key).map(|entry| entry.lease_id)
    }

    pub fn grant_count(&self) -> usize {
        self.grant_count.load(Ordering::Acquire)
    }

    /// 成功建立的监听次数
    pub fn watch_count(&self) -> usize {
        self.watch_count.load(Ordering::Acquire)
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn lease_grant(&self, ttl: Duration) -> Result<i64> {
        self.check_available()?;
        self.grant_count.fetch_add(1, Ordering::AcqRel);

        let failing = self
            .failing_grants
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FlareError::lease_grant_failed("injected lease grant failure"));
        }

        let mut state = self.state();
        let lease_id = state.next_lease_id;
        state.next_lease_id += 1;
        state.leases.insert(lease_id, ttl);
        Ok(lease_id)
    }

    async fn lease_keep_alive_once(&self, lease_id: i64) -> Result<i64> {
        self.check_available()?;
        let state = self.state();
        Ok(state
            .leases
            .get(&lease_id)
            .map(|ttl| ttl.as_secs().max(1) as i64)
            .unwrap_or(0))
    }

    async fn lease_revoke(&self, lease_id: i64) -> Result<()> {
        self.check_available()?;
        let events = {
            let mut state = self.state();
            if !state.leases.contains_key(&lease_id) {
                return Err(FlareError::registry_unavailable(format!(
                    "requested lease not found: {}",
                    lease_id
                )));
            }
            Self::drop_lease(&mut state, lease_id)
        };
        self.emit(events);
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease_id: Option<i64>) -> Result<()> {
        self.check_available()?;
        {
            let mut state = self.state();
            if let Some(id) = lease_id {
                if !state.leases.contains_key(&id) {
                    return Err(FlareError::registry_unavailable(format!(
                        "requested lease not found: {}",
                        id
                    )));
                }
            }
            state.entries.insert(
                key.to_string(),
                Entry {
                    value: value.as_bytes().to_vec(),
                    lease_id,
                },
            );
        }
        self.emit(vec![WatchEvent {
            kind: WatchEventKind::Put,
            key: key.to_string(),
        }]);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        let removed = self.state().entries.remove(key).is_some();
        if removed {
            self.emit(vec![WatchEvent {
                kind: WatchEventKind::Delete,
                key: key.to_string(),
            }]);
        }
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.check_available()?;
        let state = self.state();
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        self.check_available()?;
        let generation = self
            .watch_generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.watch_count.fetch_add(1, Ordering::AcqRel);

        let prefix = prefix.to_string();
        let stream = BroadcastStream::new(self.events.subscribe())
            .filter_map(move |item| {
                let prefix = prefix.clone();
                async move {
                    match item {
                        Ok(batch) => {
                            let events: Vec<WatchEvent> = batch
                                .events
                                .into_iter()
                                .filter(|event| event.key.starts_with(&prefix))
                                .collect();
                            (!events.is_empty()).then(|| Ok(WatchBatch { events }))
                        }
                        Err(e) => Some(Err(FlareError::watch_failed(e.to_string()))),
                    }
                }
            })
            .take_until(generation.cancelled_owned());

        Ok(stream.boxed())
    }
}
