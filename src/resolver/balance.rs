//! 解析结果到 tonic 负载均衡 channel 的桥接
//!
//! tonic 的 `Channel::balance_channel` 通过 `tonic::transport::channel::Change` 增删后端。
//! [`BalanceListener`] 记录当前已插入的后端集合，每次解析结果到达时只发送差量。
//! 权重通过副本实现：加权轮询策略下权重为 N 的地址插入 N 个后端。

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;
use tracing::{debug, error, info, warn};

use super::{AddressGroup, EndpointAddress, ResolutionListener, ResolutionUpdate};
use crate::config::GrpcClientConfig;
use crate::error::{FlareError, Result};

/// 负载均衡策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancePolicy {
    /// 轮询（所有地址等概率）
    #[default]
    RoundRobin,
    /// 加权轮询（按权重复制后端）
    WeightedRoundRobin,
    /// 只使用权重最高组中的第一个地址
    PickFirst,
}

impl LoadBalancePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancePolicy::RoundRobin => "round_robin",
            LoadBalancePolicy::WeightedRoundRobin => "weighted_round_robin",
            LoadBalancePolicy::PickFirst => "pick_first",
        }
    }
}

impl fmt::Display for LoadBalancePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Ok(LoadBalancePolicy::RoundRobin),
            "weighted_round_robin" | "weighted" => Ok(LoadBalancePolicy::WeightedRoundRobin),
            "pick_first" | "pickfirst" => Ok(LoadBalancePolicy::PickFirst),
            _ => Err(format!("Unknown load balancing policy: {}", s)),
        }
    }
}

/// 负载均衡 channel 中一个后端的标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub address: EndpointAddress,
    pub replica: u32,
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.replica)
    }
}

/// 根据策略计算期望的后端集合
pub fn desired_endpoints(policy: LoadBalancePolicy, groups: &[AddressGroup]) -> BTreeSet<EndpointKey> {
    let single = |address: &EndpointAddress| EndpointKey {
        address: address.clone(),
        replica: 0,
    };

    match policy {
        LoadBalancePolicy::RoundRobin => groups
            .iter()
            .flat_map(|group| group.addresses.iter().map(single))
            .collect(),
        LoadBalancePolicy::WeightedRoundRobin => groups
            .iter()
            .flat_map(|group| {
                group.addresses.iter().flat_map(move |address| {
                    (0..group.weight.max(1)).map(move |replica| EndpointKey {
                        address: address.clone(),
                        replica,
                    })
                })
            })
            .collect(),
        LoadBalancePolicy::PickFirst => groups
            .first()
            .and_then(|group| group.addresses.iter().next())
            .map(single)
            .into_iter()
            .collect(),
    }
}

/// 后端连接参数
#[derive(Debug, Clone)]
pub struct EndpointTemplate {
    pub connect_timeout: Duration,
    pub keep_alive: Option<KeepAlive>,
}

#[derive(Debug, Clone)]
pub struct KeepAlive {
    pub interval: Duration,
    pub timeout: Duration,
    pub while_idle: bool,
}

impl From<&GrpcClientConfig> for EndpointTemplate {
    fn from(config: &GrpcClientConfig) -> Self {
        let keep_alive = config.enable_keep_alive.then(|| KeepAlive {
            interval: config.keep_alive_time(),
            timeout: config.keep_alive_timeout(),
            while_idle: config.keep_alive_without_calls,
        });
        Self {
            connect_timeout: config.connect_timeout(),
            keep_alive,
        }
    }
}

impl EndpointTemplate {
    pub fn build(&self, address: &EndpointAddress) -> Result<Endpoint> {
        let mut endpoint = Endpoint::from_shared(address.to_uri())
            .map_err(|e| FlareError::invalid_endpoint(format!("{}: {}", address, e)))?
            .connect_timeout(self.connect_timeout)
            .tcp_nodelay(true);

        if let Some(keep_alive) = &self.keep_alive {
            endpoint = endpoint
                .http2_keep_alive_interval(keep_alive.interval)
                .keep_alive_timeout(keep_alive.timeout)
                .keep_alive_while_idle(keep_alive.while_idle);
        }
        Ok(endpoint)
    }
}

/// 把解析结果同步到 tonic 负载均衡 channel
pub struct BalanceListener {
    sender: Mutex<Option<mpsc::Sender<Change<EndpointKey, Endpoint>>>>,
    active: Mutex<BTreeSet<EndpointKey>>,
    template: EndpointTemplate,
    policy: LoadBalancePolicy,
}

impl BalanceListener {
    pub fn new(
        sender: mpsc::Sender<Change<EndpointKey, Endpoint>>,
        template: EndpointTemplate,
        policy: LoadBalancePolicy,
    ) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
            active: Mutex::new(BTreeSet::new()),
            template,
            policy,
        }
    }

    pub fn policy(&self) -> LoadBalancePolicy {
        self.policy
    }

    /// 当前已插入的后端
    pub async fn active_endpoints(&self) -> BTreeSet<EndpointKey> {
        self.active.lock().await.clone()
    }

    /// 移除全部后端并关闭发送端，之后的解析结果会被忽略
    pub async fn close(&self) {
        let Some(sender) = self.sender.lock().await.take() else {
            return;
        };
        let mut active = self.active.lock().await;
        for key in std::mem::take(&mut *active) {
            let _ = sender.send(Change::Remove(key)).await;
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.sender.lock().await.is_none()
    }

    async fn apply(&self, desired: BTreeSet<EndpointKey>) {
        let sender = match self.sender.lock().await.as_ref() {
            Some(sender) => sender.clone(),
            None => {
                debug!("Balance listener closed, ignoring resolution update");
                return;
            }
        };

        let mut active = self.active.lock().await;
        let removed: Vec<EndpointKey> = active.difference(&desired).cloned().collect();
        let added: Vec<EndpointKey> = desired.difference(&active).cloned().collect();

        for key in removed {
            if sender.send(Change::Remove(key.clone())).await.is_err() {
                warn!("Balance channel dropped, stop applying updates");
                return;
            }
            active.remove(&key);
        }

        let mut invalid: HashSet<EndpointAddress> = HashSet::new();
        for key in added {
            let endpoint = match self.template.build(&key.address) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    if invalid.insert(key.address.clone()) {
                        error!(address = %key.address, error = %e, "Invalid endpoint");
                    }
                    continue;
                }
            };
            if sender.send(Change::Insert(key.clone(), endpoint)).await.is_err() {
                warn!("Balance channel dropped, stop applying updates");
                return;
            }
            active.insert(key);
        }

        info!(
            policy = %self.policy,
            endpoints = active.len(),
            "Balance endpoints updated"
        );
    }
}

#[async_trait]
impl ResolutionListener for BalanceListener {
    async fn on_addresses(&self, update: ResolutionUpdate) {
        self.apply(desired_endpoints(self.policy, &update.groups))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups() -> Vec<AddressGroup> {
        vec![
            AddressGroup {
                weight: 3,
                addresses: [
                    EndpointAddress::new("10.0.0.1", 9090),
                    EndpointAddress::new("10.0.0.2", 9090),
                ]
                .into_iter()
                .collect(),
            },
            AddressGroup {
                weight: 1,
                addresses: [EndpointAddress::new("10.0.0.3", 9090)].into_iter().collect(),
            },
        ]
    }

    fn template() -> EndpointTemplate {
        EndpointTemplate {
            connect_timeout: Duration::from_secs(1),
            keep_alive: None,
        }
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(
            "round_robin".parse::<LoadBalancePolicy>().unwrap(),
            LoadBalancePolicy::RoundRobin
        );
        assert_eq!(
            "Weighted-Round-Robin".parse::<LoadBalancePolicy>().unwrap(),
            LoadBalancePolicy::WeightedRoundRobin
        );
        let err = "least_request".parse::<LoadBalancePolicy>().unwrap_err();
        assert!(err.contains("least_request"));
    }

    #[test]
    fn test_desired_endpoints_per_policy() {
        let groups = groups();
        assert_eq!(desired_endpoints(LoadBalancePolicy::RoundRobin, &groups).len(), 3);
        assert_eq!(
            desired_endpoints(LoadBalancePolicy::WeightedRoundRobin, &groups).len(),
            3 + 3 + 1
        );

        let first = desired_endpoints(LoadBalancePolicy::PickFirst, &groups);
        assert_eq!(first.len(), 1);
        assert_eq!(
            first.iter().next().unwrap().address,
            EndpointAddress::new("10.0.0.1", 9090)
        );
        assert!(desired_endpoints(LoadBalancePolicy::PickFirst, &[]).is_empty());
    }

    #[tokio::test]
    async fn test_listener_sends_only_differences() {
        let (tx, mut rx) = mpsc::channel(64);
        let listener = BalanceListener::new(tx, template(), LoadBalancePolicy::RoundRobin);

        listener
            .on_addresses(ResolutionUpdate {
                groups: groups(),
                metadata: Default::default(),
            })
            .await;
        let mut inserts = 0;
        while let Ok(change) = rx.try_recv() {
            assert!(matches!(change, Change::Insert(..)));
            inserts += 1;
        }
        assert_eq!(inserts, 3);

        // 只剩第一组
        let mut next = groups();
        next.truncate(1);
        listener
            .on_addresses(ResolutionUpdate {
                groups: next,
                metadata: Default::default(),
            })
            .await;
        match rx.try_recv().unwrap() {
            Change::Remove(key) => assert_eq!(key.address, EndpointAddress::new("10.0.0.3", 9090)),
            Change::Insert(..) => panic!("unexpected insert"),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(listener.active_endpoints().await.len(), 2);
    }

    #[tokio::test]
    async fn test_close_removes_everything_and_ignores_later_updates() {
        let (tx, mut rx) = mpsc::channel(64);
        let listener = BalanceListener::new(tx, template(), LoadBalancePolicy::RoundRobin);
        listener
            .on_addresses(ResolutionUpdate {
                groups: groups(),
                metadata: Default::default(),
            })
            .await;
        while rx.try_recv().is_ok() {}

        listener.close().await;
        let mut removes = 0;
        while let Ok(change) = rx.try_recv() {
            assert!(matches!(change, Change::Remove(_)));
            removes += 1;
        }
        assert_eq!(removes, 3);
        assert!(listener.is_closed().await);

        listener
            .on_addresses(ResolutionUpdate {
                groups: groups(),
                metadata: Default::default(),
            })
            .await;
        // 发送端已释放，channel 结束
        assert!(rx.recv().await.is_none());
    }
}
