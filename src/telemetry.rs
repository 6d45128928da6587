//! 日志初始化

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogConfig, LogFormat};
use crate::error::{ErrorCode, FlareError, Result, map_infra_error};

/// 初始化全局 tracing subscriber
///
/// 设置了 `RUST_LOG` 时以它为准，否则使用 `config.level`。
/// 已经初始化过时返回错误，不会覆盖已有的 subscriber。
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| FlareError::configuration_error(format!("invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_thread_names(true))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init(),
    };
    result.map_err(|e| map_infra_error(e, ErrorCode::InternalError, "failed to init tracing"))
}
