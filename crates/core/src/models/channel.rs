//! 渠道数据模型
//!
//! 渠道（Channel）是一个可以服务一个或多个模型的上游后端。
//! 管理端负责增删改，调度器只读取选择相关字段，并回写状态与观测字段。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// 渠道 ID
pub type ChannelId = u64;

/// 默认分组
pub const DEFAULT_GROUP: &str = "default";

/// 最小有效权重
pub const MIN_CHANNEL_WEIGHT: u32 = 1;

/// 渠道状态
///
/// `AutoDisabled` 由调度器根据健康检查或线上失败自动进入，
/// 开启"自动启用"策略时可在后续成功后恢复为 `Enabled`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// 启用
    #[default]
    Enabled,
    /// 手动禁用
    ManuallyDisabled,
    /// 自动禁用
    AutoDisabled,
}

impl ChannelStatus {
    /// 获取状态的显示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            ChannelStatus::Enabled => "已启用",
            ChannelStatus::ManuallyDisabled => "已手动禁用",
            ChannelStatus::AutoDisabled => "已自动禁用",
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, ChannelStatus::Enabled)
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// 渠道
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// 渠道 ID（创建后不可变）
    pub id: ChannelId,
    /// 渠道名称
    #[serde(default)]
    pub name: String,
    /// 渠道类型标识（如 openai, azure）
    #[serde(default = "default_channel_type")]
    pub channel_type: String,
    /// 上游密钥
    #[serde(default)]
    pub key: String,
    /// 上游基础 URL
    #[serde(default)]
    pub base_url: String,
    /// 可服务的模型集合，以 `*` 结尾的条目为前缀通配
    #[serde(default)]
    pub models: HashSet<String>,
    /// 允许使用该渠道的调用方分组
    #[serde(default = "default_groups")]
    pub groups: HashSet<String>,
    /// 状态
    #[serde(default)]
    pub status: ChannelStatus,
    /// 优先级，越大越优先
    #[serde(default)]
    pub priority: i64,
    /// 同优先级内的相对权重
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// 模型映射：请求模型 -> 上游模型
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    /// 测速使用的模型
    #[serde(default)]
    pub test_model: Option<String>,
    /// 最近一次测速耗时（毫秒）
    #[serde(default)]
    pub response_time_ms: u64,
    /// 最近一次测速时间
    #[serde(default)]
    pub test_time: Option<DateTime<Utc>>,
    /// 余额（美元）
    #[serde(default)]
    pub balance: f64,
    /// 余额更新时间
    #[serde(default)]
    pub balance_updated_time: Option<DateTime<Utc>>,
    /// 已用额度
    #[serde(default)]
    pub used_quota: i64,
}

fn default_channel_type() -> String {
    "openai".to_string()
}

fn default_groups() -> HashSet<String> {
    HashSet::from([DEFAULT_GROUP.to_string()])
}

fn default_weight() -> u32 {
    MIN_CHANNEL_WEIGHT
}

impl Channel {
    /// 创建新的渠道（默认启用、默认分组、权重 1）
    pub fn new(id: ChannelId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            channel_type: default_channel_type(),
            key: String::new(),
            base_url: String::new(),
            models: HashSet::new(),
            groups: default_groups(),
            status: ChannelStatus::Enabled,
            priority: 0,
            weight: MIN_CHANNEL_WEIGHT,
            model_mapping: HashMap::new(),
            test_model: None,
            response_time_ms: 0,
            test_time: None,
            balance: 0.0,
            balance_updated_time: None,
            used_quota: 0,
        }
    }

    /// 设置可服务的模型
    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    /// 设置允许的分组
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_status(mut self, status: ChannelStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// 添加模型映射
    pub fn with_model_mapping(mut self, from: &str, to: &str) -> Self {
        self.model_mapping.insert(from.to_string(), to.to_string());
        self
    }

    /// 实际参与加权的权重（0 视为 1）
    pub fn effective_weight(&self) -> u32 {
        self.weight.max(MIN_CHANNEL_WEIGHT)
    }

    /// 渠道是否声明了该模型（含通配）
    pub fn serves_model(&self, model: &str) -> bool {
        self.models.contains(model)
            || self
                .models
                .iter()
                .filter_map(|m| wildcard_prefix(m))
                .any(|prefix| model.starts_with(prefix))
    }

    pub fn allows_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    /// 将请求模型映射为上游模型名
    pub fn upstream_model<'a>(&'a self, requested: &'a str) -> &'a str {
        self.model_mapping
            .get(requested)
            .map(String::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or(requested)
    }

    /// 测速默认模型：显式 test_model，否则取排序后第一个非通配模型
    pub fn default_test_model(&self) -> Option<String> {
        if let Some(model) = self.test_model.as_ref().filter(|m| !m.is_empty()) {
            return Some(model.clone());
        }
        let mut models: Vec<&String> = self
            .models
            .iter()
            .filter(|m| wildcard_prefix(m).is_none())
            .collect();
        models.sort();
        models.first().map(|m| (*m).clone())
    }

    /// 管理端表格使用的只读视图
    pub fn telemetry(&self) -> ChannelTelemetry {
        ChannelTelemetry {
            id: self.id,
            name: self.name.clone(),
            status: self.status,
            priority: self.priority,
            weight: self.weight,
            response_time_ms: self.response_time_ms,
            test_time: self.test_time,
            balance: self.balance,
            used_quota: self.used_quota,
        }
    }
}

/// 通配模型的前缀部分（`gpt-4*` -> `gpt-4`），非通配返回 None
pub fn wildcard_prefix(model: &str) -> Option<&str> {
    model.strip_suffix('*')
}

/// 渠道观测数据（只读）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelTelemetry {
    pub id: ChannelId,
    pub name: String,
    pub status: ChannelStatus,
    pub priority: i64,
    pub weight: u32,
    pub response_time_ms: u64,
    pub test_time: Option<DateTime<Utc>>,
    pub balance: f64,
    pub used_quota: i64,
}
