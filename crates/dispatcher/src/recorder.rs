//! 尝试结果记录
//!
//! 每次尝试（线上请求或测速）都会留下一条记录。线上成功累计额度，
//! 致命失败累计到阈值后自动禁用渠道；测速成功可自动恢复被自动禁用的渠道。
//! 冷却状态由调度器维护，这里不涉及。

use crate::registry::ChannelRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use relaycast_core::{
    AttemptFailure, Channel, ChannelId, ChannelStatus, SharedDispatchConfig, Usage,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_RECENT_CAPACITY: usize = 1000;

/// 尝试来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPath {
    /// 线上请求
    Live,
    /// 手动或定时测速
    HealthCheck,
}

/// 单次尝试记录
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub request_id: Option<String>,
    pub channel_id: ChannelId,
    pub model: String,
    pub path: AttemptPath,
    pub at: DateTime<Utc>,
    pub latency: Duration,
    /// 失败原因，成功时为空
    pub failure: Option<AttemptFailure>,
}

impl AttemptRecord {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// 额度计算
pub trait QuotaPolicy: Send + Sync {
    fn quota_for(&self, model: &str, group: &str, usage: &Usage) -> i64;
}

/// 按 Token 总数计费
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenQuota;

impl QuotaPolicy for TokenQuota {
    fn quota_for(&self, _model: &str, _group: &str, usage: &Usage) -> i64 {
        i64::try_from(usage.total_tokens()).unwrap_or(i64::MAX)
    }
}

/// 渠道状态变更通知
pub trait ChannelNotifier: Send + Sync {
    fn channel_disabled(&self, channel: &Channel, reason: &str);
    fn channel_enabled(&self, channel: &Channel);
}

/// 只写日志的通知实现
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl ChannelNotifier for LogNotifier {
    fn channel_disabled(&self, channel: &Channel, reason: &str) {
        warn!(
            "[NOTIFY] 渠道「{}」（#{}）已被禁用，原因：{}",
            channel.name, channel.id, reason
        );
    }

    fn channel_enabled(&self, channel: &Channel) {
        info!("[NOTIFY] 渠道「{}」（#{}）已被启用", channel.name, channel.id);
    }
}

/// 测速判定结果
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckVerdict {
    pub success: bool,
    pub message: String,
    /// 本次测速引起的状态变化
    pub status_change: Option<ChannelStatus>,
}

/// 尝试结果记录器
pub struct OutcomeRecorder {
    registry: Arc<ChannelRegistry>,
    config: SharedDispatchConfig,
    quota: Arc<dyn QuotaPolicy>,
    notifier: Arc<dyn ChannelNotifier>,
    failure_streaks: DashMap<ChannelId, u32>,
    recent: Mutex<VecDeque<AttemptRecord>>,
    capacity: usize,
}

impl OutcomeRecorder {
    pub fn new(registry: Arc<ChannelRegistry>, config: SharedDispatchConfig) -> Self {
        Self {
            registry,
            config,
            quota: Arc::new(TokenQuota),
            notifier: Arc::new(LogNotifier),
            failure_streaks: DashMap::new(),
            recent: Mutex::new(VecDeque::with_capacity(DEFAULT_RECENT_CAPACITY)),
            capacity: DEFAULT_RECENT_CAPACITY,
        }
    }

    pub fn with_quota_policy(mut self, quota: Arc<dyn QuotaPolicy>) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ChannelNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// 保留的最近记录条数
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// 线上请求成功
    pub fn record_live_success(
        &self,
        request_id: &str,
        group: &str,
        channel: &Channel,
        model: &str,
        latency: Duration,
        usage: Option<Usage>,
    ) {
        self.failure_streaks.remove(&channel.id);

        if let Some(usage) = usage {
            let quota = self.quota.quota_for(model, group, &usage);
            if quota != 0 {
                self.registry.add_used_quota(channel.id, quota);
            }
        }

        info!(
            "[RECORD] request_id={} channel_id={} model={} latency_ms={} success",
            request_id,
            channel.id,
            model,
            latency.as_millis()
        );
        self.push(AttemptRecord {
            request_id: Some(request_id.to_string()),
            channel_id: channel.id,
            model: model.to_string(),
            path: AttemptPath::Live,
            at: Utc::now(),
            latency,
            failure: None,
        });
    }

    /// 线上请求失败
    pub fn record_live_failure(
        &self,
        request_id: &str,
        channel: &Channel,
        model: &str,
        latency: Duration,
        failure: &AttemptFailure,
    ) {
        warn!(
            "[RECORD] request_id={} channel_id={} model={} latency_ms={} failed: {}",
            request_id,
            channel.id,
            model,
            latency.as_millis(),
            failure
        );
        self.push(AttemptRecord {
            request_id: Some(request_id.to_string()),
            channel_id: channel.id,
            model: model.to_string(),
            path: AttemptPath::Live,
            at: Utc::now(),
            latency,
            failure: Some(failure.clone()),
        });

        if failure.should_disable_channel() {
            self.register_fatal_failure(channel.id, &failure.to_string());
        }
    }

    /// 测速结果
    ///
    /// 上游正常响应时写入响应时间；超过阈值或致命失败计入连续失败；
    /// 成功时按配置恢复被自动禁用的渠道。手动禁用的渠道状态不会被改动。
    pub fn record_health_check(
        &self,
        channel_id: ChannelId,
        model: &str,
        latency: Duration,
        result: Result<(), AttemptFailure>,
    ) -> HealthCheckVerdict {
        let (threshold, auto_enable) = {
            let config = self.config.read();
            (
                config.disable_threshold(),
                config.automatic_enable_channel_enabled,
            )
        };

        let (failure, too_slow) = match result {
            Ok(()) => {
                let response_time_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
                self.registry
                    .record_test_result(channel_id, response_time_ms, Utc::now());
                let slow = threshold.filter(|limit| latency > *limit).map(|limit| {
                    AttemptFailure::transport(format!(
                        "响应时间 {:.2}s 超过阈值 {:.2}s",
                        latency.as_secs_f64(),
                        limit.as_secs_f64()
                    ))
                });
                let too_slow = slow.is_some();
                (slow, too_slow)
            }
            Err(failure) => (Some(failure), false),
        };

        self.push(AttemptRecord {
            request_id: None,
            channel_id,
            model: model.to_string(),
            path: AttemptPath::HealthCheck,
            at: Utc::now(),
            latency,
            failure: failure.clone(),
        });

        match failure {
            None => {
                self.failure_streaks.remove(&channel_id);
                let status_change = (auto_enable && self.enable(channel_id))
                    .then_some(ChannelStatus::Enabled);
                info!(
                    "[TEST] channel_id={} model={} latency_ms={} success",
                    channel_id,
                    model,
                    latency.as_millis()
                );
                HealthCheckVerdict {
                    success: true,
                    message: String::new(),
                    status_change,
                }
            }
            Some(failure) => {
                let message = failure.to_string();
                let status_change = if too_slow || failure.should_disable_channel() {
                    self.register_fatal_failure(channel_id, &message)
                } else {
                    None
                };
                warn!(
                    "[TEST] channel_id={} model={} latency_ms={} failed: {}",
                    channel_id,
                    model,
                    latency.as_millis(),
                    message
                );
                HealthCheckVerdict {
                    success: false,
                    message,
                    status_change,
                }
            }
        }
    }

    /// 写入渠道余额
    pub fn update_balance(&self, channel_id: ChannelId, balance: f64) -> bool {
        self.registry
            .set_balance(channel_id, balance, Utc::now())
            .is_some()
    }

    /// 最近的尝试记录，按时间先后
    pub fn recent_attempts(&self) -> Vec<AttemptRecord> {
        self.recent.lock().iter().cloned().collect()
    }

    /// 当前连续致命失败次数
    pub fn failure_streak(&self, channel_id: ChannelId) -> u32 {
        self.failure_streaks
            .get(&channel_id)
            .map(|streak| *streak)
            .unwrap_or(0)
    }

    /// 渠道被删除时清理计数
    pub fn forget(&self, channel_id: ChannelId) {
        self.failure_streaks.remove(&channel_id);
    }

    fn push(&self, record: AttemptRecord) {
        let mut recent = self.recent.lock();
        while recent.len() >= self.capacity {
            recent.pop_front();
        }
        recent.push_back(record);
    }

    fn register_fatal_failure(&self, channel_id: ChannelId, reason: &str) -> Option<ChannelStatus> {
        let streak = {
            let mut streak = self.failure_streaks.entry(channel_id).or_insert(0);
            *streak += 1;
            *streak
        };

        let (auto_disable, threshold) = {
            let config = self.config.read();
            (
                config.automatic_disable_channel_enabled,
                config.auto_disable_failure_threshold,
            )
        };
        if !auto_disable || streak < threshold {
            return None;
        }
        self.disable(channel_id, reason)
            .then_some(ChannelStatus::AutoDisabled)
    }

    fn disable(&self, channel_id: ChannelId, reason: &str) -> bool {
        if !self.registry.transition_status(
            channel_id,
            ChannelStatus::Enabled,
            ChannelStatus::AutoDisabled,
        ) {
            return false;
        }
        self.failure_streaks.remove(&channel_id);
        warn!("[DISABLE] channel_id={} reason={}", channel_id, reason);
        if let Some(channel) = self.registry.get(channel_id) {
            self.notifier.channel_disabled(&channel, reason);
        }
        true
    }

    fn enable(&self, channel_id: ChannelId) -> bool {
        if !self.registry.transition_status(
            channel_id,
            ChannelStatus::AutoDisabled,
            ChannelStatus::Enabled,
        ) {
            return false;
        }
        info!("[ENABLE] channel_id={}", channel_id);
        if let Some(channel) = self.registry.get(channel_id) {
            self.notifier.channel_enabled(&channel);
        }
        true
    }
}

impl std::fmt::Debug for OutcomeRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutcomeRecorder")
            .field("capacity", &self.capacity)
            .field("recent", &self.recent.lock().len())
            .finish_non_exhaustive()
    }
}
