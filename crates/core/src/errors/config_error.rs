//! 配置错误
//!
//! 在配置写入/加载时校验，调度器在请求期间不会观察到这些错误。

use thiserror::Error;

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("RetryTimes 不能为负数: {0}")]
    NegativeRetryTimes(i64),

    #[error("ChannelDisableThreshold 无效: {0}")]
    InvalidDisableThreshold(f64),

    #[error("{key} 超出上限 {max}: {value}")]
    OutOfRange { key: &'static str, value: f64, max: f64 },

    #[error("连续失败阈值必须大于 0")]
    ZeroFailureThreshold,

    #[error("配置项 {key} 的值无效: {value}")]
    InvalidOptionValue { key: String, value: String },

    #[error("未知配置项: {0}")]
    UnknownOption(String),

    #[error("读取配置文件失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("解析配置文件失败: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("渠道 ID 重复: {0}")]
    DuplicateChannel(u64),
}
