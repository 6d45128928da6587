//! 错误处理模块
//!
//! 提供统一的错误类型、错误代码分类和错误转换。
//! 注册中心的瞬时错误在组件边界被记录并降级，配置错误与生命周期误用直接返回给调用方。

pub mod code;
pub mod conversions;
pub mod flare_error;

pub use code::{ErrorCategory, ErrorCode};
pub use flare_error::{FlareError, Result};

/// 将基础设施错误转换为 `FlareError`，原始错误保留在详情中
pub fn map_infra_error<E, S>(error: E, code: ErrorCode, message: S) -> FlareError
where
    E: std::fmt::Display,
    S: Into<String>,
{
    FlareError::localized(code, message).with_details(error.to_string())
}
