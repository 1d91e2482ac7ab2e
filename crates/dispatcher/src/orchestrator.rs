//! 请求调度与重试
//!
//! 一次请求在 选择 -> 发送 -> 失败/成功 之间循环，直到成功、被拒绝、
//! 预算耗尽或无渠道可选。预算在请求开始时从配置快照得到，之后不再变化。

use crate::health::HealthTracker;
use crate::recorder::OutcomeRecorder;
use crate::registry::ChannelRegistry;
use crate::selector::{filter_eligible, TierSelector};
use crate::transport::{ChannelTransport, TransportResponse, UpstreamRequest};
use relaycast_core::{
    AttemptFailure, Channel, ChannelId, DispatchError, RetryPolicy, SharedDispatchConfig, Usage,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 入站请求
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub request_id: String,
    /// 客户端请求的模型名
    pub model: String,
    pub group: String,
    pub payload: Value,
}

impl DispatchRequest {
    /// 创建请求并生成 request_id
    pub fn new(model: impl Into<String>, group: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            model: model.into(),
            group: group.into(),
            payload,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// 调度成功结果
#[derive(Debug, Clone)]
pub struct DispatchSuccess {
    pub channel_id: ChannelId,
    pub payload: Value,
    pub usage: Option<Usage>,
    /// 含成功那次在内的尝试次数
    pub attempts: u32,
}

/// 单个请求的尝试预算
#[derive(Debug, Clone, Copy)]
struct RetryBudget {
    policy: RetryPolicy,
    used: u32,
}

impl RetryBudget {
    fn new(policy: RetryPolicy) -> Self {
        Self { policy, used: 0 }
    }

    fn consume(&mut self) -> u32 {
        self.used += 1;
        self.used
    }

    fn exhausted(&self) -> bool {
        self.used >= self.policy.max_attempts()
    }
}

/// 调度状态
enum DispatchState {
    Selecting,
    Dispatching(Arc<Channel>),
    Failed {
        channel: Arc<Channel>,
        failure: AttemptFailure,
    },
}

/// 渠道调度器
pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
    health: Arc<HealthTracker>,
    selector: TierSelector,
    recorder: Arc<OutcomeRecorder>,
    transport: Arc<dyn ChannelTransport>,
    config: SharedDispatchConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        transport: Arc<dyn ChannelTransport>,
        config: SharedDispatchConfig,
    ) -> Self {
        let recorder = Arc::new(OutcomeRecorder::new(
            Arc::clone(&registry),
            Arc::clone(&config),
        ));
        Self {
            registry,
            health: Arc::new(HealthTracker::new()),
            selector: TierSelector::default(),
            recorder,
            transport,
            config,
        }
    }

    pub fn with_selector(mut self, selector: TierSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<OutcomeRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_health(mut self, health: Arc<HealthTracker>) -> Self {
        self.health = health;
        self
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn recorder(&self) -> &Arc<OutcomeRecorder> {
        &self.recorder
    }

    pub fn transport(&self) -> &Arc<dyn ChannelTransport> {
        &self.transport
    }

    pub fn config(&self) -> &SharedDispatchConfig {
        &self.config
    }

    /// 删除渠道，同时清理冷却与失败计数
    pub fn remove_channel(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.health.clear(id);
        self.recorder.forget(id);
        self.registry.remove(id)
    }

    /// 调度一次请求
    ///
    /// 首次选择即无渠道返回 `NoChannelAvailable`；可重试失败会冻结渠道
    /// （冷却时长非零时）并重新选择，直到预算耗尽；不可重试失败立即返回。
    /// 取消时正在进行的尝试被丢弃，不冻结也不记录。
    pub async fn dispatch(
        &self,
        request: &DispatchRequest,
        cancel: &CancellationToken,
    ) -> Result<DispatchSuccess, DispatchError> {
        let (policy, timeout) = {
            let config = self.config.read();
            (config.retry_policy(), config.request_timeout())
        };
        let mut budget = RetryBudget::new(policy);
        let mut excluded: HashSet<ChannelId> = HashSet::new();
        let mut last_failure: Option<AttemptFailure> = None;
        let mut state = DispatchState::Selecting;

        loop {
            state = match state {
                DispatchState::Selecting => {
                    if cancel.is_cancelled() {
                        return Err(DispatchError::Cancelled {
                            attempts: budget.used,
                        });
                    }
                    match self.select_channel(request, &policy, &excluded) {
                        Some(channel) => DispatchState::Dispatching(channel),
                        None => {
                            return Err(match last_failure.take() {
                                None => {
                                    error!(
                                        "[DISPATCH] request_id={} model={} group={} no channel available",
                                        request.request_id, request.model, request.group
                                    );
                                    DispatchError::NoChannelAvailable {
                                        model: request.model.clone(),
                                        group: request.group.clone(),
                                    }
                                }
                                Some(last_error) => {
                                    error!(
                                        "[DISPATCH] request_id={} attempts={} no channel left for retry",
                                        request.request_id, budget.used
                                    );
                                    DispatchError::RetryExhausted {
                                        attempts: budget.used,
                                        last_error,
                                    }
                                }
                            });
                        }
                    }
                }
                DispatchState::Dispatching(channel) => {
                    let attempt = budget.consume();
                    let upstream_model = channel.upstream_model(&request.model).to_string();
                    info!(
                        "[DISPATCH] request_id={} channel_id={} model={} upstream_model={} attempt={}/{}",
                        request.request_id,
                        channel.id,
                        request.model,
                        upstream_model,
                        attempt,
                        policy.max_attempts()
                    );
                    let upstream = UpstreamRequest {
                        request_id: request.request_id.clone(),
                        model: upstream_model,
                        payload: request.payload.clone(),
                    };

                    let started = Instant::now();
                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            info!(
                                "[DISPATCH] request_id={} cancelled during attempt {}",
                                request.request_id, attempt
                            );
                            return Err(DispatchError::Cancelled {
                                attempts: attempt - 1,
                            });
                        }
                        outcome = self.attempt(&channel, &upstream, timeout) => outcome,
                    };
                    let latency = started.elapsed();

                    match outcome {
                        Ok(response) => {
                            self.recorder.record_live_success(
                                &request.request_id,
                                &request.group,
                                &channel,
                                &request.model,
                                latency,
                                response.usage,
                            );
                            return Ok(DispatchSuccess {
                                channel_id: channel.id,
                                payload: response.payload,
                                usage: response.usage,
                                attempts: attempt,
                            });
                        }
                        Err(failure) => {
                            self.recorder.record_live_failure(
                                &request.request_id,
                                &channel,
                                &request.model,
                                latency,
                                &failure,
                            );
                            DispatchState::Failed { channel, failure }
                        }
                    }
                }
                DispatchState::Failed { channel, failure } => {
                    if !failure.retryable {
                        error!(
                            "[DISPATCH] request_id={} channel_id={} rejected: {}",
                            request.request_id, channel.id, failure
                        );
                        return Err(DispatchError::Rejected {
                            channel_id: channel.id,
                            error: failure,
                        });
                    }

                    if policy.freezes_on_failure() {
                        self.health
                            .freeze(channel.id, Instant::now(), policy.retry_interval);
                        excluded.insert(channel.id);
                    }

                    if budget.exhausted() {
                        error!(
                            "[RETRY] request_id={} attempts={} budget exhausted, last_error={}",
                            request.request_id, budget.used, failure
                        );
                        return Err(DispatchError::RetryExhausted {
                            attempts: budget.used,
                            last_error: failure,
                        });
                    }

                    warn!(
                        "[RETRY] request_id={} channel_id={} attempt={}/{} error={} status={:?}",
                        request.request_id,
                        channel.id,
                        budget.used,
                        policy.max_attempts(),
                        failure.message,
                        failure.status_code
                    );
                    last_failure = Some(failure);
                    DispatchState::Selecting
                }
            };
        }
    }

    fn select_channel(
        &self,
        request: &DispatchRequest,
        policy: &RetryPolicy,
        excluded: &HashSet<ChannelId>,
    ) -> Option<Arc<Channel>> {
        let now = Instant::now();
        let candidates = self.registry.lookup(&request.model, &request.group);
        let eligible = filter_eligible(&candidates, &request.model, &request.group, |id| {
            excluded.contains(&id)
                || (policy.freezes_on_failure() && self.health.is_frozen(id, now))
        });
        debug!(
            "[DISPATCH] request_id={} candidates={} eligible={}",
            request.request_id,
            candidates.len(),
            eligible.len()
        );
        self.selector.select(&eligible).ok()
    }

    async fn attempt(
        &self,
        channel: &Channel,
        upstream: &UpstreamRequest,
        timeout: Option<Duration>,
    ) -> Result<TransportResponse, AttemptFailure> {
        let call = self.transport.send(channel, upstream);
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    let timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                    warn!(
                        "[TIMEOUT] request_id={} channel_id={} timeout_ms={}",
                        upstream.request_id, channel.id, timeout_ms
                    );
                    Err(AttemptFailure::timeout(timeout_ms))
                }
            },
            None => call.await,
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("channels", &self.registry.len())
            .finish_non_exhaustive()
    }
}
