//! 渠道测速
//!
//! 用最小的探测请求检查渠道是否可用，结果走 [`OutcomeRecorder`] 的测速路径，
//! 可能触发自动禁用或自动启用。手动测速不受渠道状态限制；批量测速跳过手动禁用的渠道。

use crate::recorder::OutcomeRecorder;
use crate::registry::ChannelRegistry;
use crate::transport::{ChannelTransport, UpstreamRequest};
use relaycast_core::{AttemptFailure, ChannelId, ChannelStatus, SharedDispatchConfig};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 测速错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TesterError {
    #[error("渠道不存在: {0}")]
    ChannelNotFound(ChannelId),

    #[error("渠道 #{0} 没有可用于测速的模型")]
    NoTestModel(ChannelId),

    #[error("批量测速正在进行中")]
    AlreadyRunning,
}

/// 单个渠道的测速结果
#[derive(Debug, Clone, Serialize)]
pub struct ChannelTestReport {
    pub channel_id: ChannelId,
    pub model: String,
    pub success: bool,
    /// 失败原因，成功时为空
    pub message: String,
    pub elapsed: Duration,
    pub status_change: Option<ChannelStatus>,
}

/// 批量测速汇总
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchTestSummary {
    pub tested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub disabled: usize,
    pub enabled: usize,
}

/// 批量测速期间置位，离开作用域时复位
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 渠道测速器
pub struct ChannelTester {
    registry: Arc<ChannelRegistry>,
    transport: Arc<dyn ChannelTransport>,
    recorder: Arc<OutcomeRecorder>,
    config: SharedDispatchConfig,
    running: AtomicBool,
}

impl ChannelTester {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        transport: Arc<dyn ChannelTransport>,
        recorder: Arc<OutcomeRecorder>,
        config: SharedDispatchConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            recorder,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// 批量测速是否正在进行
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 测试单个渠道，`model` 为空时使用渠道的测速模型
    pub async fn test_channel(
        &self,
        channel_id: ChannelId,
        model: Option<&str>,
    ) -> Result<ChannelTestReport, TesterError> {
        let channel = self
            .registry
            .get(channel_id)
            .ok_or(TesterError::ChannelNotFound(channel_id))?;
        let model = model
            .filter(|m| !m.trim().is_empty())
            .map(str::to_string)
            .or_else(|| channel.default_test_model())
            .ok_or(TesterError::NoTestModel(channel_id))?;

        let upstream_model = channel.upstream_model(&model).to_string();
        let request = UpstreamRequest {
            request_id: format!("test-{}", uuid::Uuid::new_v4()),
            payload: json!({
                "model": upstream_model,
                "max_tokens": 1,
                "messages": [{"role": "user", "content": "hi"}],
            }),
            model: upstream_model,
        };
        let timeout = self.config.read().request_timeout();

        let started = Instant::now();
        let call = self.transport.send(&channel, &request);
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or_else(|_| {
                    Err(AttemptFailure::timeout(
                        u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    ))
                }),
            None => call.await,
        };
        let elapsed = started.elapsed();

        let verdict = self
            .recorder
            .record_health_check(channel_id, &model, elapsed, result.map(|_| ()));

        Ok(ChannelTestReport {
            channel_id,
            model,
            success: verdict.success,
            message: verdict.message,
            elapsed,
            status_change: verdict.status_change,
        })
    }

    /// 测试所有未被手动禁用的渠道
    pub async fn test_all_channels(&self) -> Result<BatchTestSummary, TesterError> {
        self.run_batch(&CancellationToken::new()).await
    }

    async fn run_batch(&self, cancel: &CancellationToken) -> Result<BatchTestSummary, TesterError> {
        let _guard = RunningGuard::acquire(&self.running).ok_or(TesterError::AlreadyRunning)?;
        let interval = self.config.read().test_request_interval();
        let mut summary = BatchTestSummary::default();

        let channels = self.registry.list();
        info!("[TEST] 开始批量测速: {} 个渠道", channels.len());

        for (index, channel) in channels.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if channel.status == ChannelStatus::ManuallyDisabled {
                summary.skipped += 1;
                continue;
            }
            if index > 0 && !interval.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            match self.test_channel(channel.id, None).await {
                Ok(report) => {
                    summary.tested += 1;
                    if report.success {
                        summary.succeeded += 1;
                    } else {
                        summary.failed += 1;
                    }
                    match report.status_change {
                        Some(ChannelStatus::AutoDisabled) => summary.disabled += 1,
                        Some(ChannelStatus::Enabled) => summary.enabled += 1,
                        _ => {}
                    }
                }
                Err(err) => {
                    warn!("[TEST] channel_id={} skipped: {}", channel.id, err);
                    summary.skipped += 1;
                }
            }
        }

        info!(
            "[TEST] 批量测速完成: tested={} succeeded={} failed={} skipped={} disabled={} enabled={}",
            summary.tested,
            summary.succeeded,
            summary.failed,
            summary.skipped,
            summary.disabled,
            summary.enabled
        );
        Ok(summary)
    }

    /// 按配置的频率定时批量测速；未配置频率时不启动
    pub fn spawn_periodic(self: Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let mut period = self.config.read().test_frequency()?;
        info!("[TEST] 定时测速已启动，间隔 {} 秒", period.as_secs());

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("[TEST] 定时测速已停止");
                        break;
                    }
                    _ = tokio::time::sleep(period) => {
                        if let Err(err) = self.run_batch(&cancel).await {
                            warn!("[TEST] 定时测速跳过: {}", err);
                        }
                    }
                }
                match self.config.read().test_frequency() {
                    Some(next) => period = next,
                    None => {
                        info!("[TEST] 测速频率已关闭，定时测速退出");
                        break;
                    }
                }
            }
        }))
    }
}

impl std::fmt::Debug for ChannelTester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTester")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
