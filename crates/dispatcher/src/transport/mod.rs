//! 上游传输层
//!
//! 调度器只依赖 [`ChannelTransport`]，具体协议由实现决定。

mod http;

pub use http::HttpTransport;

use async_trait::async_trait;
use relaycast_core::{AttemptFailure, Channel, Usage};
use serde_json::Value;

/// 发往单个渠道的请求
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub request_id: String,
    /// 映射后的上游模型名
    pub model: String,
    pub payload: Value,
}

/// 上游成功响应
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status_code: u16,
    pub payload: Value,
    pub usage: Option<Usage>,
}

/// 渠道传输
///
/// 非成功响应以 [`AttemptFailure`] 返回，可重试性由实现按状态码判定。
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn send(
        &self,
        channel: &Channel,
        request: &UpstreamRequest,
    ) -> Result<TransportResponse, AttemptFailure>;
}
