//! etcd 存储实现

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions, Watcher,
    WatchStream as EtcdWatchStream,
};
use futures::StreamExt;
use tracing::{debug, info};

use super::{KeyValue, RegistryStore, WatchBatch, WatchEvent, WatchEventKind, WatchStream};
use crate::config::EtcdConfig;
use crate::error::{ErrorCode, FlareError, Result, map_infra_error};

/// etcd 存储
///
/// `etcd_client::Client` 内部是共享的 tonic channel，克隆开销很小，每次请求克隆一份即可。
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    timeout: Duration,
}

impl EtcdStore {
    pub async fn connect(config: &EtcdConfig) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(config.timeout())
            .with_timeout(config.timeout());
        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(|e| {
                map_infra_error(
                    e,
                    ErrorCode::RegistryUnavailable,
                    format!("Failed to connect to etcd {:?}", config.endpoints),
                )
            })?;

        info!(endpoints = ?config.endpoints, "etcd client connected");
        Ok(Self::from_client(client, config.timeout()))
    }

    pub fn from_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn with_timeout<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, etcd_client::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res.map_err(FlareError::from),
            Err(_) => Err(FlareError::registry_timeout(format!(
                "etcd {} timed out after {:?}",
                op, self.timeout
            ))),
        }
    }
}

#[async_trait]
impl RegistryStore for EtcdStore {
    async fn lease_grant(&self, ttl: Duration) -> Result<i64> {
        let mut client = self.client.clone();
        let ttl_secs = ttl.as_secs().max(1) as i64;
        let resp = self
            .with_timeout("lease_grant", client.lease_grant(ttl_secs, None))
            .await?;
        Ok(resp.id())
    }

    async fn lease_keep_alive_once(&self, lease_id: i64) -> Result<i64> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = self
            .with_timeout("lease_keep_alive", client.lease_keep_alive(lease_id))
            .await?;
        self.with_timeout("lease_keep_alive", keeper.keep_alive())
            .await?;
        match self.with_timeout("lease_keep_alive", stream.message()).await? {
            Some(resp) => Ok(resp.ttl()),
            None => Err(FlareError::registry_unavailable(format!(
                "keep-alive stream closed for lease {}",
                lease_id
            ))),
        }
    }

    async fn lease_revoke(&self, lease_id: i64) -> Result<()> {
        let mut client = self.client.clone();
        self.with_timeout("lease_revoke", client.lease_revoke(lease_id))
            .await?;
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease_id: Option<i64>) -> Result<()> {
        let mut client = self.client.clone();
        let options = lease_id.map(|id| PutOptions::new().with_lease(id));
        self.with_timeout("put", client.put(key, value, options))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        self.with_timeout("delete", client.delete(key, None)).await?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let mut client = self.client.clone();
        let resp = self
            .with_timeout(
                "get",
                client.get(prefix, Some(GetOptions::new().with_prefix())),
            )
            .await?;

        Ok(resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
            })
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let (watcher, stream) = self
            .with_timeout(
                "watch",
                client.watch(prefix, Some(WatchOptions::new().with_prefix())),
            )
            .await?;
        debug!(prefix, watch_id = watcher.watch_id(), "etcd watch created");

        // watcher 必须与流一起存活，否则服务端会取消这次监听
        let state: Option<(Watcher, EtcdWatchStream)> = Some((watcher, stream));
        let events = futures::stream::unfold(state, |state| async move {
            let (watcher, mut stream) = state?;
            match stream.message().await {
                Ok(Some(resp)) if resp.canceled() => Some((
                    Err(FlareError::watch_failed(format!(
                        "watch {} canceled by server",
                        resp.watch_id()
                    ))),
                    None,
                )),
                Ok(Some(resp)) => {
                    let events = resp
                        .events()
                        .iter()
                        .filter_map(|event| {
                            let kv = event.kv()?;
                            let kind = match event.event_type() {
                                EventType::Put => WatchEventKind::Put,
                                EventType::Delete => WatchEventKind::Delete,
                            };
                            Some(WatchEvent {
                                kind,
                                key: String::from_utf8_lossy(kv.key()).into_owned(),
                            })
                        })
                        .collect();
                    Some((Ok(WatchBatch { events }), Some((watcher, stream))))
                }
                Ok(None) => None,
                Err(e) => Some((Err(FlareError::from(e)), None)),
            }
        });

        Ok(events.boxed())
    }
}
