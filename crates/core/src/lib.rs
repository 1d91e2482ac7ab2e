//! relaycast 核心类型
//!
//! 包含渠道模型、配置、错误类型和日志初始化。

pub mod config;
pub mod errors;
pub mod logger;
pub mod models;

pub use config::{DispatchConfig, GatewayConfig, LoggingConfig, RetryPolicy, SharedDispatchConfig};
pub use errors::{AttemptFailure, ConfigError, DispatchError, DispatchErrorCode, FailureKind};
pub use models::{Channel, ChannelId, ChannelStatus, ChannelTelemetry, Usage};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
