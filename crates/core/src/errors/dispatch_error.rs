//! 调度终态错误
//!
//! 一次入站请求最终只会返回一个终态结果，单次尝试的失败在调度器内部吸收。

use super::attempt::AttemptFailure;
use crate::models::ChannelId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 调度错误
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// 首次选择时没有任何可用渠道，不重试
    #[error("分组 {group} 下没有可服务模型 {model} 的渠道")]
    NoChannelAvailable { model: String, group: String },

    /// 重试预算耗尽或中途再无可用渠道
    #[error("重试 {attempts} 次后仍失败: {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: AttemptFailure,
    },

    /// 上游拒绝了请求本身（如 400），换渠道也无济于事
    #[error("渠道 #{channel_id} 拒绝请求: {error}")]
    Rejected {
        channel_id: ChannelId,
        error: AttemptFailure,
    },

    /// 调用方取消
    #[error("请求已取消 (已完成尝试 {attempts} 次)")]
    Cancelled { attempts: u32 },
}

/// 错误码，便于客户端和告警统一区分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchErrorCode {
    NoChannelAvailable,
    RetryExhausted,
    Rejected,
    Cancelled,
}

impl DispatchError {
    pub fn code(&self) -> DispatchErrorCode {
        match self {
            DispatchError::NoChannelAvailable { .. } => DispatchErrorCode::NoChannelAvailable,
            DispatchError::RetryExhausted { .. } => DispatchErrorCode::RetryExhausted,
            DispatchError::Rejected { .. } => DispatchErrorCode::Rejected,
            DispatchError::Cancelled { .. } => DispatchErrorCode::Cancelled,
        }
    }

    /// 已完成的尝试次数
    pub fn attempts(&self) -> u32 {
        match self {
            DispatchError::NoChannelAvailable { .. } => 0,
            DispatchError::RetryExhausted { attempts, .. } => *attempts,
            DispatchError::Rejected { .. } => 1,
            DispatchError::Cancelled { attempts } => *attempts,
        }
    }

    /// 返回给调用方的 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::NoChannelAvailable { .. } => 503,
            DispatchError::RetryExhausted { last_error, .. } => match last_error.status_code {
                Some(code) if code >= 400 => code,
                _ => 502,
            },
            DispatchError::Rejected { error, .. } => error.status_code.unwrap_or(400),
            DispatchError::Cancelled { .. } => 499,
        }
    }

    /// 返回给调用方的错误文案
    pub fn user_message(&self) -> String {
        match self {
            DispatchError::RetryExhausted { last_error, .. }
                if last_error.status_code == Some(429) =>
            {
                "当前分组上游负载已饱和，请稍后再试".to_string()
            }
            DispatchError::RetryExhausted { last_error, .. } => last_error.message.clone(),
            DispatchError::Rejected { error, .. } => error.message.clone(),
            other => other.to_string(),
        }
    }

    /// 附带请求 ID 的文案，便于用户反馈时定位
    pub fn user_message_with_request_id(&self, request_id: &str) -> String {
        format!("{} (request id: {request_id})", self.user_message())
    }
}
