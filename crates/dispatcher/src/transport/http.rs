//! OpenAI 兼容的 HTTP 传输

use super::{ChannelTransport, TransportResponse, UpstreamRequest};
use async_trait::async_trait;
use relaycast_core::logger::sanitize_log_message;
use relaycast_core::{AttemptFailure, Channel, Usage};
use serde_json::Value;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// 基于 reqwest 的 HTTP 传输
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// 拼接 chat/completions 地址，兼容 base_url 已带 `/v1` 的写法
pub(crate) fn chat_completions_url(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    let base = if base.is_empty() { DEFAULT_BASE_URL } else { base };
    format!("{base}/v1/chat/completions").replace("/v1/v1", "/v1")
}

/// 解析 OpenAI 风格的错误体 `{"error": {"message", "type", "code"}}`
pub(crate) fn failure_from_body(status: u16, body: &str) -> AttemptFailure {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));

    let message = error
        .and_then(|e| e.get("message").and_then(Value::as_str).map(str::to_string))
        .or_else(|| error.and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                format!("上游返回状态码 {status}")
            } else {
                body.chars().take(500).collect()
            }
        });

    let mut failure = AttemptFailure::from_status(status, sanitize_log_message(&message));
    if let Some(error_type) = error.and_then(|e| e.get("type")).and_then(Value::as_str) {
        failure = failure.with_error_type(error_type);
    }
    match error.and_then(|e| e.get("code")) {
        Some(Value::String(code)) => failure = failure.with_error_code(code.as_str()),
        Some(Value::Number(code)) => failure = failure.with_error_code(code.to_string()),
        _ => {}
    }
    failure
}

#[async_trait]
impl ChannelTransport for HttpTransport {
    async fn send(
        &self,
        channel: &Channel,
        request: &UpstreamRequest,
    ) -> Result<TransportResponse, AttemptFailure> {
        let url = chat_completions_url(&channel.base_url);
        let mut payload = request.payload.clone();
        if let Some(object) = payload.as_object_mut() {
            object.insert("model".to_string(), Value::String(request.model.clone()));
        }

        debug!(
            "[TRANSPORT] request_id={} channel_id={} url={} model={}",
            request.request_id, channel.id, url, request.model
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&channel.key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AttemptFailure::transport(sanitize_log_message(&e.to_string())))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| AttemptFailure::transport(format!("读取响应失败: {e}")))?;

        if !(200..300).contains(&status) {
            return Err(failure_from_body(status, &body));
        }

        let payload: Value = serde_json::from_str(&body)
            .map_err(|e| AttemptFailure::transport(format!("解析响应失败: {e}")))?;

        // 部分上游以 200 返回错误体
        if payload.get("error").is_some_and(|e| !e.is_null()) {
            return Err(failure_from_body(500, &body));
        }

        Ok(TransportResponse {
            status_code: status,
            usage: Usage::from_response(&payload),
            payload,
        })
    }
}
