//! Token 用量

use serde::{Deserialize, Serialize};

/// 上游返回的 Token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// 从响应体中提取用量，兼容 OpenAI 与 Anthropic 两种字段名
    pub fn from_response(response: &serde_json::Value) -> Option<Self> {
        let usage = response.get("usage")?;
        let read = |key: &str| usage.get(key).and_then(|v| v.as_u64());

        if let (Some(prompt), completion) = (read("prompt_tokens"), read("completion_tokens")) {
            return Some(Self::new(prompt, completion.unwrap_or(0)));
        }
        if let (Some(input), output) = (read("input_tokens"), read("output_tokens")) {
            return Some(Self::new(input, output.unwrap_or(0)));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_from_openai_response() {
        let body = serde_json::json!({"usage": {"prompt_tokens": 12, "completion_tokens": 3}});
        assert_eq!(Usage::from_response(&body), Some(Usage::new(12, 3)));
    }

    #[test]
    fn test_usage_from_anthropic_response() {
        let body = serde_json::json!({"usage": {"input_tokens": 5, "output_tokens": 9}});
        let usage = Usage::from_response(&body).unwrap();
        assert_eq!(usage.total_tokens(), 14);
    }

    #[test]
    fn test_usage_missing() {
        assert_eq!(Usage::from_response(&serde_json::json!({"id": "x"})), None);
    }
}
