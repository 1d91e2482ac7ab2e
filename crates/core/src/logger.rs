//! 日志管理模块
//!
//! 初始化 tracing 订阅者，并提供上游错误信息的脱敏工具。

use crate::config::LoggingConfig;
use regex::Regex;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

/// 初始化全局日志
///
/// `RUST_LOG` 存在时优先生效；重复调用不会报错。
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.show_target)
        .try_init();

    if result.is_err() {
        tracing::debug!("[LOGGER] 全局日志已初始化，跳过");
    }
}

fn sanitize_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"Bearer\s+[A-Za-z0-9._-]+", "Bearer ***"),
            (r"sk-[A-Za-z0-9_-]{8,}", "sk-***"),
            (
                r#"api[_-]?key["']?\s*[:=]\s*["']?[A-Za-z0-9._-]+"#,
                "api_key: ***",
            ),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| {
            Regex::new(pattern).ok().map(|re| (re, replacement))
        })
        .collect()
    })
}

/// 上游错误信息可能回显密钥，写日志前先脱敏
pub fn sanitize_log_message(message: &str) -> String {
    let mut sanitized = message.to_string();
    for (re, replacement) in sanitize_patterns() {
        sanitized = re.replace_all(&sanitized, *replacement).to_string();
    }
    sanitized
}

/// 密钥掩码，仅保留前 4 位
pub fn mask_key(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    if key.chars().count() <= 4 {
        "***".to_string()
    } else {
        format!("{prefix}***")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_bearer_token() {
        let output = sanitize_log_message("Authorization: Bearer abcDEF123._-XYZ");
        assert!(!output.contains("abcDEF123"));
        assert!(output.contains("***"));
    }

    #[test]
    fn test_sanitize_openai_key() {
        let output = sanitize_log_message("Incorrect API key provided: sk-proj-abcdefgh12345");
        assert!(!output.contains("abcdefgh12345"));
    }

    #[test]
    fn test_plain_text_unchanged() {
        let input = "upstream returned 502";
        assert_eq!(sanitize_log_message(input), input);
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("sk-1234567"), "sk-1***");
        assert_eq!(mask_key("abc"), "***");
    }

    #[test]
    fn test_init_logging_twice() {
        let config = LoggingConfig::default();
        init_logging(&config);
        init_logging(&config);
    }
}
