//! 配置管理模块
//!
//! 网关配置从 YAML 文件加载；调度相关设置可由管理端按键值对热更新，
//! 写入时即校验，非法值被拒绝且不影响当前配置。

use crate::errors::ConfigError;
use crate::models::Channel;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// 冷却秒数上限（30 天）
pub const MAX_RETRY_COOLDOWN_SECONDS: u64 = 30 * 24 * 3600;
/// 测速阈值上限（秒）
pub const MAX_DISABLE_THRESHOLD_SECONDS: f64 = 3600.0;
/// 自动测速频率上限（分钟，一年）
pub const MAX_TEST_FREQUENCY_MINUTES: u64 = 365 * 24 * 60;

/// 共享的调度配置，调度器在每个请求开始时读取快照
pub type SharedDispatchConfig = Arc<RwLock<DispatchConfig>>;

/// 网关配置根对象
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub logging: LoggingConfig,
    pub dispatch: DispatchConfig,
    pub channels: Vec<Channel>,
}

impl GatewayConfig {
    /// 从 YAML 文本解析并校验
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dispatch.validate()?;
        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.id) {
                return Err(ConfigError::DuplicateChannel(channel.id));
            }
        }
        Ok(())
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 默认日志级别，`RUST_LOG` 优先
    pub level: String,
    /// 是否输出 target
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_target: false,
        }
    }
}

/// 调度设置（管理端可写）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// 首次尝试之后最多再重试的次数
    pub retry_times: i64,
    /// 失败渠道的冷却秒数，0 表示不冻结
    pub retry_cooldown_seconds: u64,
    /// 测速响应时间超过该秒数视为失败，0 表示不限制
    pub channel_disable_threshold: f64,
    /// 失败时自动禁用渠道
    pub automatic_disable_channel_enabled: bool,
    /// 成功时自动启用被自动禁用的渠道
    pub automatic_enable_channel_enabled: bool,
    /// 连续多少次致命失败后自动禁用
    pub auto_disable_failure_threshold: u32,
    /// 单次尝试超时（毫秒），0 表示完全交给传输层
    pub request_timeout_ms: u64,
    /// 批量测速时两个渠道之间的间隔（毫秒）
    pub test_request_interval_ms: u64,
    /// 自动测速频率（分钟），为空则不自动测速
    pub channel_test_frequency_minutes: Option<u64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_times: 0,
            retry_cooldown_seconds: 0,
            channel_disable_threshold: 5.0,
            automatic_disable_channel_enabled: false,
            automatic_enable_channel_enabled: false,
            auto_disable_failure_threshold: 1,
            request_timeout_ms: 60_000,
            test_request_interval_ms: 0,
            channel_test_frequency_minutes: None,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_times < 0 {
            return Err(ConfigError::NegativeRetryTimes(self.retry_times));
        }
        if !self.channel_disable_threshold.is_finite() || self.channel_disable_threshold < 0.0 {
            return Err(ConfigError::InvalidDisableThreshold(
                self.channel_disable_threshold,
            ));
        }
        if self.retry_cooldown_seconds > MAX_RETRY_COOLDOWN_SECONDS {
            return Err(ConfigError::OutOfRange {
                key: "RetryCooldownSeconds",
                value: self.retry_cooldown_seconds as f64,
                max: MAX_RETRY_COOLDOWN_SECONDS as f64,
            });
        }
        if self.channel_disable_threshold > MAX_DISABLE_THRESHOLD_SECONDS {
            return Err(ConfigError::OutOfRange {
                key: "ChannelDisableThreshold",
                value: self.channel_disable_threshold,
                max: MAX_DISABLE_THRESHOLD_SECONDS,
            });
        }
        if let Some(minutes) = self.channel_test_frequency_minutes {
            if minutes > MAX_TEST_FREQUENCY_MINUTES {
                return Err(ConfigError::OutOfRange {
                    key: "ChannelTestFrequency",
                    value: minutes as f64,
                    max: MAX_TEST_FREQUENCY_MINUTES as f64,
                });
            }
        }
        if self.auto_disable_failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        Ok(())
    }

    /// 按管理端的配置键写入单个设置
    ///
    /// 校验失败时返回错误，当前配置保持不变。
    pub fn apply_option(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidOptionValue {
            key: key.to_string(),
            value: value.to_string(),
        };

        let mut next = self.clone();
        match key {
            "RetryTimes" => next.retry_times = value.trim().parse().map_err(|_| invalid())?,
            "RetryCooldownSeconds" => {
                next.retry_cooldown_seconds = value.trim().parse().map_err(|_| invalid())?
            }
            "ChannelDisableThreshold" => {
                next.channel_disable_threshold = value.trim().parse().map_err(|_| invalid())?
            }
            "AutomaticDisableChannelEnabled" => {
                next.automatic_disable_channel_enabled =
                    value.trim().parse().map_err(|_| invalid())?
            }
            "AutomaticEnableChannelEnabled" => {
                next.automatic_enable_channel_enabled =
                    value.trim().parse().map_err(|_| invalid())?
            }
            _ => return Err(ConfigError::UnknownOption(key.to_string())),
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    /// 当前设置对应的重试策略快照
    ///
    /// 配置在写入时已校验，这里对负数做饱和处理而非报错。
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_times: u32::try_from(self.retry_times.max(0)).unwrap_or(u32::MAX),
            retry_interval: Duration::from_secs(self.retry_cooldown_seconds),
        }
    }

    /// 测速判定阈值，0 表示不限制
    ///
    /// 无法表示为 `Duration` 的值同样视为不限制。
    pub fn disable_threshold(&self) -> Option<Duration> {
        if self.channel_disable_threshold > 0.0 {
            Duration::try_from_secs_f64(self.channel_disable_threshold).ok()
        } else {
            None
        }
    }

    /// 自动测速周期，未配置或为 0 时返回 None
    pub fn test_frequency(&self) -> Option<Duration> {
        self.channel_test_frequency_minutes
            .filter(|minutes| *minutes > 0)
            .map(|minutes| Duration::from_secs(minutes.saturating_mul(60)))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn test_request_interval(&self) -> Duration {
        Duration::from_millis(self.test_request_interval_ms)
    }

    pub fn into_shared(self) -> SharedDispatchConfig {
        Arc::new(RwLock::new(self))
    }
}

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 首次尝试之后最多再重试的次数
    pub retry_times: u32,
    /// 失败渠道的冷却时长，零表示不冻结
    pub retry_interval: Duration,
}

impl RetryPolicy {
    pub fn new(retry_times: u32, retry_interval: Duration) -> Self {
        Self {
            retry_times,
            retry_interval,
        }
    }

    /// 单个请求允许的最大尝试次数
    pub fn max_attempts(&self) -> u32 {
        self.retry_times.saturating_add(1)
    }

    pub fn freezes_on_failure(&self) -> bool {
        !self.retry_interval.is_zero()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(0, Duration::ZERO)
    }
}
