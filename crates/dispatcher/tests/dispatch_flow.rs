//! 调度流程集成测试
//!
//! 使用脚本化的传输层驱动完整的 选择 -> 发送 -> 重试 流程。

use async_trait::async_trait;
use parking_lot::Mutex;
use relaycast_core::{
    AttemptFailure, Channel, ChannelId, ChannelStatus, DispatchConfig, DispatchError,
    DispatchErrorCode, Usage,
};
use relaycast_dispatcher::{
    ChannelRegistry, ChannelTransport, DispatchRequest, Dispatcher, TierSelector,
    TransportResponse, UpstreamRequest,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
enum Behavior {
    Succeed,
    Fail(u16),
    Hang,
}

/// 按渠道脚本返回结果，并记录调用顺序
#[derive(Default)]
struct ScriptedTransport {
    behaviors: Mutex<HashMap<ChannelId, Behavior>>,
    calls: Mutex<Vec<ChannelId>>,
}

impl ScriptedTransport {
    fn with(behaviors: impl IntoIterator<Item = (ChannelId, Behavior)>) -> Arc<Self> {
        Arc::new(Self {
            behaviors: Mutex::new(behaviors.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn set(&self, id: ChannelId, behavior: Behavior) {
        self.behaviors.lock().insert(id, behavior);
    }

    fn calls(&self) -> Vec<ChannelId> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ChannelTransport for ScriptedTransport {
    async fn send(
        &self,
        channel: &Channel,
        _request: &UpstreamRequest,
    ) -> Result<TransportResponse, AttemptFailure> {
        self.calls.lock().push(channel.id);
        let behavior = self
            .behaviors
            .lock()
            .get(&channel.id)
            .cloned()
            .unwrap_or(Behavior::Succeed);
        match behavior {
            Behavior::Succeed => Ok(TransportResponse {
                status_code: 200,
                payload: json!({"channel": channel.id}),
                usage: Some(Usage::new(1, 1)),
            }),
            Behavior::Fail(status) => Err(AttemptFailure::from_status(status, "scripted failure")),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(AttemptFailure::transport("unreachable"))
            }
        }
    }
}

fn gpt(id: ChannelId, priority: i64, weight: u32) -> Channel {
    Channel::new(id, format!("channel-{id}"))
        .with_models(["gpt-4o"])
        .with_priority(priority)
        .with_weight(weight)
}

fn build(
    channels: Vec<Channel>,
    transport: Arc<ScriptedTransport>,
    config: DispatchConfig,
) -> Dispatcher {
    let registry = Arc::new(ChannelRegistry::from_channels(channels));
    Dispatcher::new(registry, transport, config.into_shared())
        .with_selector(TierSelector::seeded(11))
}

fn request() -> DispatchRequest {
    DispatchRequest::new("gpt-4o", "default", json!({"messages": [{"role": "user", "content": "hi"}]}))
}

#[tokio::test]
async fn retry_budget_is_a_hard_limit() {
    let transport = ScriptedTransport::with((1..=4).map(|id| (id, Behavior::Fail(500))));
    let config = DispatchConfig {
        retry_times: 2,
        retry_cooldown_seconds: 60,
        ..Default::default()
    };
    let dispatcher = build(
        (1..=4).map(|id| gpt(id, 0, 1)).collect(),
        Arc::clone(&transport),
        config,
    );

    let err = dispatcher
        .dispatch(&request(), &CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        DispatchError::RetryExhausted {
            attempts,
            last_error,
        } => {
            assert_eq!(*attempts, 3);
            assert_eq!(last_error.status_code, Some(500));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let calls = transport.calls();
    assert_eq!(calls.len(), 3);

    // 冷却时长非零时，同一请求不会重复选中已失败的渠道
    let mut distinct = calls.clone();
    distinct.sort_unstable();
    distinct.dedup();
    assert_eq!(distinct.len(), 3);
    for id in &calls {
        assert!(dispatcher.health().is_frozen(*id, Instant::now()));
    }
}

#[tokio::test]
async fn unknown_model_has_no_channel_and_no_attempts() {
    let transport = Arc::new(ScriptedTransport::default());
    let dispatcher = build(
        vec![gpt(1, 0, 1)],
        Arc::clone(&transport),
        DispatchConfig {
            retry_times: 3,
            ..Default::default()
        },
    );

    let request = DispatchRequest::new("gpt-9", "default", json!({}));
    let err = dispatcher
        .dispatch(&request, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), DispatchErrorCode::NoChannelAvailable);
    assert_eq!(err.attempts(), 0);
    assert_eq!(err.status_code(), 503);
    assert!(transport.calls().is_empty());
    assert!(dispatcher.recorder().recent_attempts().is_empty());
}

#[tokio::test]
async fn disabled_channels_are_never_selected() {
    let transport = Arc::new(ScriptedTransport::default());
    let dispatcher = build(
        vec![
            gpt(1, 10, 1).with_status(ChannelStatus::ManuallyDisabled),
            gpt(2, 10, 1).with_status(ChannelStatus::AutoDisabled),
            gpt(3, 0, 1),
        ],
        Arc::clone(&transport),
        DispatchConfig::default(),
    );

    for _ in 0..50 {
        let ok = dispatcher
            .dispatch(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ok.channel_id, 3);
    }
}

#[tokio::test]
async fn falls_back_to_lower_tier_while_top_tier_is_frozen() {
    let transport = Arc::new(ScriptedTransport::default());
    let config = DispatchConfig {
        retry_cooldown_seconds: 30,
        ..Default::default()
    };
    let dispatcher = build(
        vec![gpt(1, 10, 1), gpt(2, 5, 1)],
        Arc::clone(&transport),
        config,
    );
    dispatcher
        .health()
        .freeze(1, Instant::now(), Duration::from_secs(30));

    let ok = dispatcher
        .dispatch(&request(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(ok.channel_id, 2);
    assert_eq!(ok.attempts, 1);
}

#[tokio::test]
async fn top_tier_always_wins_when_eligible() {
    let transport = Arc::new(ScriptedTransport::default());
    let dispatcher = build(
        vec![gpt(1, 10, 1), gpt(2, 5, 1000)],
        Arc::clone(&transport),
        DispatchConfig::default(),
    );
    for _ in 0..1000 {
        let ok = dispatcher
            .dispatch(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ok.channel_id, 1);
    }
}

#[tokio::test(start_paused = true)]
async fn frozen_channel_returns_after_cooldown() {
    let transport = ScriptedTransport::with([(1, Behavior::Fail(502))]);
    let config = DispatchConfig {
        retry_times: 1,
        retry_cooldown_seconds: 10,
        ..Default::default()
    };
    let dispatcher = build(
        vec![gpt(1, 10, 1), gpt(2, 5, 1)],
        Arc::clone(&transport),
        config,
    );

    let first = dispatcher
        .dispatch(&request(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.channel_id, 2);
    assert_eq!(first.attempts, 2);
    assert_eq!(transport.calls(), vec![1, 2]);

    // 冷却期内直接走低优先级渠道
    let during = dispatcher
        .dispatch(&request(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(during.channel_id, 2);
    assert_eq!(during.attempts, 1);

    transport.set(1, Behavior::Succeed);
    tokio::time::advance(Duration::from_secs(10)).await;
    let after = dispatcher
        .dispatch(&request(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(after.channel_id, 1);
}

#[tokio::test]
async fn exhausts_when_no_channel_left_for_retry() {
    let transport = ScriptedTransport::with([(1, Behavior::Fail(429))]);
    let config = DispatchConfig {
        retry_times: 5,
        retry_cooldown_seconds: 60,
        ..Default::default()
    };
    let dispatcher = build(vec![gpt(1, 0, 1)], Arc::clone(&transport), config);

    let err = dispatcher
        .dispatch(&request(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), DispatchErrorCode::RetryExhausted);
    assert_eq!(err.attempts(), 1);
    assert_eq!(err.status_code(), 429);
    assert_eq!(err.user_message(), "当前分组上游负载已饱和，请稍后再试");
    assert_eq!(transport.calls(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn attempt_timeout_is_retried_on_another_channel() {
    let transport = ScriptedTransport::with([(1, Behavior::Hang)]);
    let config = DispatchConfig {
        retry_times: 1,
        retry_cooldown_seconds: 5,
        request_timeout_ms: 2_000,
        ..Default::default()
    };
    let dispatcher = build(
        vec![gpt(1, 10, 1), gpt(2, 0, 1)],
        Arc::clone(&transport),
        config,
    );

    let ok = dispatcher
        .dispatch(&request(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(ok.channel_id, 2);
    assert_eq!(ok.attempts, 2);

    let failure = dispatcher.recorder().recent_attempts()[0]
        .failure
        .clone()
        .unwrap();
    assert_eq!(failure.status_code, Some(408));
    assert!(dispatcher.health().is_frozen(1, Instant::now()));
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_without_freezing() {
    let transport = ScriptedTransport::with([(1, Behavior::Hang)]);
    let config = DispatchConfig {
        retry_times: 3,
        retry_cooldown_seconds: 60,
        request_timeout_ms: 0,
        ..Default::default()
    };
    let dispatcher = Arc::new(build(vec![gpt(1, 0, 1)], Arc::clone(&transport), config));
    let cancel = CancellationToken::new();

    let task = {
        let dispatcher = Arc::clone(&dispatcher);
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.dispatch(&request(), &cancel).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, DispatchError::Cancelled { attempts: 0 }));
    assert!(!dispatcher.health().is_frozen(1, Instant::now()));
    assert!(dispatcher.recorder().recent_attempts().is_empty());
    assert_eq!(transport.calls(), vec![1]);
}

#[tokio::test]
async fn cancelled_before_start_makes_no_attempt() {
    let transport = Arc::new(ScriptedTransport::default());
    let dispatcher = build(vec![gpt(1, 0, 1)], Arc::clone(&transport), DispatchConfig::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = dispatcher.dispatch(&request(), &cancel).await.unwrap_err();
    assert_eq!(err.code(), DispatchErrorCode::Cancelled);
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn config_changes_apply_to_next_request() {
    let transport = ScriptedTransport::with((1..=3).map(|id| (id, Behavior::Fail(503))));
    let dispatcher = build(
        (1..=3).map(|id| gpt(id, 0, 1)).collect(),
        Arc::clone(&transport),
        DispatchConfig::default(),
    );

    let err = dispatcher
        .dispatch(&request(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.attempts(), 1);

    dispatcher
        .config()
        .write()
        .apply_option("RetryTimes", "2")
        .unwrap();
    let err = dispatcher
        .dispatch(&request(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.attempts(), 3);
}

#[tokio::test]
async fn fatal_failure_auto_disables_and_fails_over() {
    let transport = ScriptedTransport::with([(1, Behavior::Fail(401))]);
    let config = DispatchConfig {
        retry_times: 1,
        automatic_disable_channel_enabled: true,
        ..Default::default()
    };
    let dispatcher = build(
        vec![gpt(1, 10, 1), gpt(2, 0, 1)],
        Arc::clone(&transport),
        config,
    );

    let ok = dispatcher
        .dispatch(&request(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(ok.channel_id, 2);
    assert_eq!(
        dispatcher.registry().get(1).unwrap().status,
        ChannelStatus::AutoDisabled
    );

    // 自动禁用后即使冷却时长为零也不再被选中
    let ok = dispatcher
        .dispatch(&request(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(ok.channel_id, 2);
    assert_eq!(transport.calls(), vec![1, 2, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatches_share_state_safely() {
    let transport = ScriptedTransport::with([(1, Behavior::Fail(500))]);
    let config = DispatchConfig {
        retry_times: 2,
        retry_cooldown_seconds: 60,
        ..Default::default()
    };
    let dispatcher = Arc::new(build(
        vec![gpt(1, 10, 1), gpt(2, 5, 1), gpt(3, 5, 3)],
        Arc::clone(&transport),
        config,
    ));

    let tasks = (0..64).map(|_| {
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            dispatcher
                .dispatch(&request(), &CancellationToken::new())
                .await
        }
    });
    let results = futures::future::join_all(tasks).await;

    for result in results {
        let ok = result.unwrap();
        assert!(ok.channel_id == 2 || ok.channel_id == 3);
        assert!(ok.attempts <= 2);
    }
    assert!(transport.calls().contains(&1));
    assert!(dispatcher.health().is_frozen(1, Instant::now()));
    let quota: i64 = [2, 3]
        .iter()
        .map(|id| dispatcher.registry().get(*id).unwrap().used_quota)
        .sum();
    assert_eq!(quota, 64 * 2);
}
