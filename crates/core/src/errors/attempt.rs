//! 单次尝试失败
//!
//! 描述一次上游调用的失败原因，驱动冻结、重试与自动禁用判定。
//! 仅在调度器内部流转，不会单独返回给调用方。

use serde::{Deserialize, Serialize};

/// 失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 网络/连接错误
    Transport,
    /// 单次尝试超时
    Timeout,
    /// 上游返回非成功状态
    Upstream,
}

/// 单次尝试失败
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub kind: FailureKind,
    /// 上游 HTTP 状态码（传输错误时为空）
    pub status_code: Option<u16>,
    pub message: String,
    /// 上游错误类型，如 `insufficient_quota`
    pub error_type: Option<String>,
    /// 上游错误码，如 `invalid_api_key`
    pub error_code: Option<String>,
    /// 是否值得换渠道重试
    pub retryable: bool,
}

impl AttemptFailure {
    /// 传输层错误，总是可重试
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transport,
            status_code: None,
            message: message.into(),
            error_type: None,
            error_code: None,
            retryable: true,
        }
    }

    /// 超时，与其他失败一样冻结并重试
    pub fn timeout(timeout_ms: u64) -> Self {
        Self {
            kind: FailureKind::Timeout,
            status_code: Some(408),
            message: format!("请求超时: {timeout_ms}ms"),
            error_type: None,
            error_code: None,
            retryable: true,
        }
    }

    /// 根据上游状态码构造，可重试性按状态码判定
    pub fn from_status(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Upstream,
            status_code: Some(status_code),
            message: message.into(),
            error_type: None,
            error_code: None,
            retryable: Self::is_retryable_status(status_code),
        }
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_error_code(mut self, error_code: impl Into<String>) -> Self {
        self.error_code = Some(error_code.into());
        self
    }

    /// 状态码是否值得换渠道重试
    ///
    /// 429 和 5xx 重试；400 是请求本身的问题，2xx 不是失败，均不重试；
    /// 其余状态（401/403/404 等）视为渠道问题，换渠道重试。
    pub fn is_retryable_status(status_code: u16) -> bool {
        match status_code {
            429 => true,
            500..=599 => true,
            400 => false,
            200..=299 => false,
            _ => true,
        }
    }

    /// 该失败是否说明渠道本身已不可用（密钥失效、余额不足等）
    pub fn should_disable_channel(&self) -> bool {
        if self.status_code == Some(401) {
            return true;
        }

        if let Some(error_type) = self.error_type.as_deref() {
            if matches!(
                error_type,
                "insufficient_quota" | "authentication_error" | "permission_error" | "forbidden"
            ) {
                return true;
            }
        }

        if let Some(code) = self.error_code.as_deref() {
            if matches!(code, "invalid_api_key" | "account_deactivated") {
                return true;
            }
        }

        let message = self.message.as_str();
        message.starts_with("Your credit balance is too low")
            || message.starts_with("This organization has been disabled.")
            || message.contains("credit")
            || message.contains("balance")
            || message.contains("Access denied")
    }
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}
