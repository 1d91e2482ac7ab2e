//! 数据模型
//!
//! - `channel` - 渠道及其状态、观测视图
//! - `usage` - 上游返回的 Token 用量

mod channel;
mod usage;

pub use channel::{
    wildcard_prefix, Channel, ChannelId, ChannelStatus, ChannelTelemetry, DEFAULT_GROUP,
    MIN_CHANNEL_WEIGHT,
};
pub use usage::Usage;
