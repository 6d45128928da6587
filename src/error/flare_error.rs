//! 统一错误类型

use super::code::{ErrorCategory, ErrorCode};
use thiserror::Error;

/// 服务发现与 RPC 连接层的统一错误类型
#[derive(Error, Debug, Clone)]
pub enum FlareError {
    /// 带错误代码的业务错误
    #[error("错误 [{code}] {reason}", code = .code.as_str())]
    Localized {
        code: ErrorCode,
        reason: String,
        details: Option<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// 系统错误（用于内部错误）
    #[error("系统错误: {0}")]
    System(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(String),
}

impl FlareError {
    /// 创建带错误代码的错误
    pub fn localized(code: ErrorCode, reason: impl Into<String>) -> Self {
        FlareError::Localized {
            code,
            reason: reason.into(),
            details: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// 附加错误详情
    #[must_use]
    pub fn with_details(self, extra: impl Into<String>) -> Self {
        match self {
            FlareError::Localized {
                code,
                reason,
                timestamp,
                ..
            } => FlareError::Localized {
                code,
                reason,
                details: Some(extra.into()),
                timestamp,
            },
            other => other,
        }
    }

    /// 创建系统错误
    pub fn system(msg: impl Into<String>) -> Self {
        FlareError::System(msg.into())
    }

    /// 创建 IO 错误
    pub fn io(msg: impl Into<String>) -> Self {
        FlareError::Io(msg.into())
    }

    // ============================================================
    // 便捷方法：连接相关错误
    // ============================================================

    /// 创建连接失败错误
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::ConnectionFailed, reason)
    }

    /// 创建非法地址错误
    pub fn invalid_endpoint(endpoint: impl AsRef<str>) -> Self {
        Self::localized(
            ErrorCode::InvalidEndpoint,
            format!("endpoint must be host:port, got {:?}", endpoint.as_ref()),
        )
    }

    // ============================================================
    // 便捷方法：注册中心相关错误
    // ============================================================

    /// 注册中心不可用
    pub fn registry_unavailable(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::RegistryUnavailable, reason)
    }

    /// 注册中心调用超时
    pub fn registry_timeout(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::RegistryTimeout, reason)
    }

    /// 租约申请失败
    pub fn lease_grant_failed(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::LeaseGrantFailed, reason)
    }

    /// 监听失败
    pub fn watch_failed(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::WatchFailed, reason)
    }

    // ============================================================
    // 便捷方法：生命周期与配置相关错误
    // ============================================================

    /// 组件已关闭
    pub fn already_closed(component: impl Into<String>) -> Self {
        Self::localized(
            ErrorCode::AlreadyClosed,
            format!("{} is already closed!", component.into()),
        )
    }

    /// 配置错误
    pub fn configuration_error(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::ConfigurationError, reason)
    }

    /// 重复的服务实现
    pub fn duplicate_service(name: impl AsRef<str>) -> Self {
        Self::localized(
            ErrorCode::DuplicateService,
            format!("Found duplicate service implementation: {}", name.as_ref()),
        )
    }

    /// 非法的注册键
    pub fn invalid_service_key(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::InvalidServiceKey, reason)
    }

    // ============================================================
    // 便捷方法：序列化相关错误
    // ============================================================

    /// 创建序列化错误
    pub fn serialization_error(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::SerializationError, reason)
    }

    /// 创建反序列化错误
    pub fn deserialization_error(reason: impl Into<String>) -> Self {
        Self::localized(ErrorCode::DeserializationError, reason)
    }

    /// 获取错误代码
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            FlareError::Localized { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// 获取错误类别
    pub fn category(&self) -> ErrorCategory {
        match self {
            FlareError::Localized { code, .. } => code.category(),
            FlareError::System(_) => ErrorCategory::System,
            FlareError::Io(_) => ErrorCategory::Connection,
        }
    }

    /// 获取错误原因
    pub fn reason(&self) -> &str {
        match self {
            FlareError::Localized { reason, .. } => reason,
            FlareError::System(msg) => msg,
            FlareError::Io(msg) => msg,
        }
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        match self {
            FlareError::Io(_) => true,
            _ => self.code().map(|code| code.is_retryable()).unwrap_or(false),
        }
    }

    /// 判断是否为致命错误
    pub fn is_fatal(&self) -> bool {
        self.code().map(|code| code.is_fatal()).unwrap_or(false)
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, FlareError>;
