//! 解析器提供者
//!
//! 目标地址形如 `discovery:///services/example/v1.0/grpc/`，也可以直接传注册键。
//! 只有路径以 `/services` 开头的目标由本提供者处理。

use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::debug;

use super::{DiscoveryResolver, ResolutionListener};
use crate::discovery::client::DiscoveryClient;
use crate::discovery::key::SERVICE_PREFIX;
use crate::discovery::notifier::ChangeNotifier;
use crate::error::{FlareError, Result};

/// 默认目标 scheme
pub const DEFAULT_SCHEME: &str = "discovery";

/// 解析器提供者
pub struct ResolverProvider {
    client: Arc<dyn DiscoveryClient>,
    notifier: Arc<ChangeNotifier>,
    resolvers: Mutex<Vec<Weak<DiscoveryResolver>>>,
}

impl ResolverProvider {
    pub fn new(client: Arc<dyn DiscoveryClient>, notifier: Arc<ChangeNotifier>) -> Self {
        Self {
            client,
            notifier,
            resolvers: Mutex::new(Vec::new()),
        }
    }

    pub fn default_scheme(&self) -> &'static str {
        DEFAULT_SCHEME
    }

    /// 为目标创建解析器
    ///
    /// 目标不属于注册中心时返回 `Ok(None)`；注册键为空时返回错误。
    pub fn new_resolver(
        &self,
        target: &str,
        listener: Arc<dyn ResolutionListener>,
    ) -> Result<Option<Arc<DiscoveryResolver>>> {
        let Some(key) = registry_key(target) else {
            debug!(target, "Target is not a registry path");
            return Ok(None);
        };
        if key.trim().is_empty() || key.trim_end_matches('/') == SERVICE_PREFIX {
            return Err(FlareError::invalid_service_key(format!(
                "target has an empty registry key: {:?}",
                target
            )));
        }

        let resolver = Arc::new(DiscoveryResolver::new(
            key,
            self.client.clone(),
            listener,
            self.notifier.clone(),
        ));

        let mut resolvers = self
            .resolvers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        resolvers.retain(|r| r.strong_count() > 0);
        resolvers.push(Arc::downgrade(&resolver));

        Ok(Some(resolver))
    }

    /// 仍在使用中的解析器数量
    pub fn active_resolvers(&self) -> usize {
        self.resolvers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|r| !r.is_shutdown())
            .count()
    }
}

/// 从目标中取出注册键；不是注册中心路径时返回 `None`
fn registry_key(target: &str) -> Option<&str> {
    let path = match target.split_once("://") {
        // scheme://authority/path
        Some((_, rest)) => &rest[rest.find('/')?..],
        None => target,
    };
    path.starts_with(SERVICE_PREFIX).then_some(path)
}
