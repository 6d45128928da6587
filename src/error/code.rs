//! 错误代码和错误类别定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
///
/// 错误代码按类别分组，每个类别占用1000个代码范围：
/// - 1000-1999: 连接相关错误
/// - 2000-2999: 注册中心相关错误（租约、查询、监听）
/// - 3000-3999: 生命周期相关错误
/// - 6000-6999: 系统与配置相关错误
/// - 8000-8999: 序列化相关错误
/// - 9000-9999: 通用错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 连接相关错误 (1000-1999)
    // ============================================================
    ConnectionFailed = 1000,
    InvalidEndpoint = 1003,

    // ============================================================
    // 注册中心相关错误 (2000-2999)
    // ============================================================
    RegistryUnavailable = 2000,
    RegistryTimeout = 2001,
    LeaseGrantFailed = 2002,
    WatchFailed = 2004,

    // ============================================================
    // 生命周期相关错误 (3000-3999)
    // ============================================================
    AlreadyClosed = 3000,

    // ============================================================
    // 系统相关错误 (6000-6999)
    // ============================================================
    InternalError = 6000,
    ConfigurationError = 6003,
    DuplicateService = 6005,
    InvalidServiceKey = 6006,

    // ============================================================
    // 序列化相关错误 (8000-8999)
    // ============================================================
    SerializationError = 8000,
    DeserializationError = 8001,

    // ============================================================
    // 通用错误 (9000-9999)
    // ============================================================
    InvalidParameter = 9001,
    OperationNotSupported = 9002,
    OperationTimeout = 9004,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ErrorCode {
    /// 获取错误代码的数字值
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// 从数字值创建错误代码
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1000 => Some(ErrorCode::ConnectionFailed),
            1003 => Some(ErrorCode::InvalidEndpoint),
            2000 => Some(ErrorCode::RegistryUnavailable),
            2001 => Some(ErrorCode::RegistryTimeout),
            2002 => Some(ErrorCode::LeaseGrantFailed),
            2004 => Some(ErrorCode::WatchFailed),
            3000 => Some(ErrorCode::AlreadyClosed),
            6000 => Some(ErrorCode::InternalError),
            6003 => Some(ErrorCode::ConfigurationError),
            6005 => Some(ErrorCode::DuplicateService),
            6006 => Some(ErrorCode::InvalidServiceKey),
            8000 => Some(ErrorCode::SerializationError),
            8001 => Some(ErrorCode::DeserializationError),
            9001 => Some(ErrorCode::InvalidParameter),
            9002 => Some(ErrorCode::OperationNotSupported),
            9004 => Some(ErrorCode::OperationTimeout),
            _ => None,
        }
    }

    /// 获取错误代码的英文标识符
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::InvalidEndpoint => "INVALID_ENDPOINT",
            ErrorCode::RegistryUnavailable => "REGISTRY_UNAVAILABLE",
            ErrorCode::RegistryTimeout => "REGISTRY_TIMEOUT",
            ErrorCode::LeaseGrantFailed => "LEASE_GRANT_FAILED",
            ErrorCode::WatchFailed => "WATCH_FAILED",
            ErrorCode::AlreadyClosed => "ALREADY_CLOSED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::DuplicateService => "DUPLICATE_SERVICE",
            ErrorCode::InvalidServiceKey => "INVALID_SERVICE_KEY",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
            ErrorCode::DeserializationError => "DESERIALIZATION_ERROR",
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::OperationNotSupported => "OPERATION_NOT_SUPPORTED",
            ErrorCode::OperationTimeout => "OPERATION_TIMEOUT",
        }
    }

    /// 获取错误代码的类别（用于错误分类）
    pub fn category(&self) -> ErrorCategory {
        match self.as_u32() {
            1000..=1999 => ErrorCategory::Connection,
            2000..=2999 => ErrorCategory::Registry,
            3000..=3999 => ErrorCategory::Lifecycle,
            6000..=6999 => ErrorCategory::System,
            8000..=8999 => ErrorCategory::Serialization,
            _ => ErrorCategory::General,
        }
    }

    /// 判断是否为可重试的错误
    ///
    /// 注册中心的瞬时错误在边界处被吞掉并降级，这里只用于日志与重试决策
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionFailed
                | ErrorCode::RegistryUnavailable
                | ErrorCode::RegistryTimeout
                | ErrorCode::LeaseGrantFailed
                | ErrorCode::WatchFailed
        )
    }

    /// 判断是否为致命错误（配置错误、生命周期误用）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Lifecycle
        ) || matches!(
            self,
            ErrorCode::ConfigurationError
                | ErrorCode::DuplicateService
                | ErrorCode::InvalidServiceKey
        )
    }
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Connection,
    Registry,
    Lifecycle,
    System,
    Serialization,
    General,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Connection => write!(f, "CONNECTION"),
            ErrorCategory::Registry => write!(f, "REGISTRY"),
            ErrorCategory::Lifecycle => write!(f, "LIFECYCLE"),
            ErrorCategory::System => write!(f, "SYSTEM"),
            ErrorCategory::Serialization => write!(f, "SERIALIZATION"),
            ErrorCategory::General => write!(f, "GENERAL"),
        }
    }
}
