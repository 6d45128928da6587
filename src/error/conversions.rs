//! 错误类型转换实现

use super::{ErrorCode, FlareError};
use std::io;

impl From<io::Error> for FlareError {
    fn from(err: io::Error) -> Self {
        FlareError::io(err.to_string())
    }
}

impl From<serde_json::Error> for FlareError {
    fn from(err: serde_json::Error) -> Self {
        FlareError::serialization_error(format!("JSON 序列化错误: {}", err))
    }
}

impl From<toml::de::Error> for FlareError {
    fn from(err: toml::de::Error) -> Self {
        FlareError::configuration_error(format!("TOML 解析错误: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for FlareError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        FlareError::localized(ErrorCode::OperationTimeout, err.to_string())
    }
}

impl From<tonic::transport::Error> for FlareError {
    fn from(err: tonic::transport::Error) -> Self {
        FlareError::connection_failed(err.to_string())
    }
}

#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for FlareError {
    fn from(err: etcd_client::Error) -> Self {
        FlareError::registry_unavailable(format!("etcd 错误: {}", err))
    }
}

impl From<FlareError> for tonic::Status {
    fn from(err: FlareError) -> Self {
        let code = match err.code() {
            Some(ErrorCode::InvalidParameter) | Some(ErrorCode::InvalidServiceKey) => {
                tonic::Code::InvalidArgument
            }
            Some(ErrorCode::AlreadyClosed) => tonic::Code::FailedPrecondition,
            Some(ErrorCode::OperationTimeout) | Some(ErrorCode::RegistryTimeout) => {
                tonic::Code::DeadlineExceeded
            }
            Some(ErrorCode::OperationNotSupported) => tonic::Code::Unimplemented,
            _ if err.is_retryable() => tonic::Code::Unavailable,
            _ => tonic::Code::Internal,
        };
        tonic::Status::new(code, err.to_string())
    }
}
