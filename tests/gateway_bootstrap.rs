//! 从配置文件组装网关并跑通一次调度与测速

use async_trait::async_trait;
use relaycast::Gateway;
use relaycast_core::{AttemptFailure, Channel, ChannelStatus, GatewayConfig};
use relaycast_dispatcher::{ChannelTransport, DispatchRequest, TransportResponse, UpstreamRequest};
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 渠道 1 密钥失效，其余渠道正常
struct FixtureTransport;

#[async_trait]
impl ChannelTransport for FixtureTransport {
    async fn send(
        &self,
        channel: &Channel,
        request: &UpstreamRequest,
    ) -> Result<TransportResponse, AttemptFailure> {
        if channel.id == 1 {
            return Err(AttemptFailure::from_status(401, "invalid api key")
                .with_error_code("invalid_api_key"));
        }
        Ok(TransportResponse {
            status_code: 200,
            payload: serde_json::json!({"model": request.model}),
            usage: None,
        })
    }
}

const CONFIG: &str = r#"
logging:
  level: warn
dispatch:
  retry_times: 2
  retry_cooldown_seconds: 30
  automatic_disable_channel_enabled: true
  automatic_enable_channel_enabled: true
channels:
  - id: 1
    name: primary
    models: [gpt-4o]
    priority: 10
  - id: 2
    name: backup
    models: [gpt-4o, "claude-*"]
    model_mapping:
      gpt-4o: gpt-4o-2024-08-06
  - id: 3
    name: vip-only
    models: [gpt-4o]
    groups: [vip]
    status: manually_disabled
"#;

fn load_gateway() -> Gateway {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    let config = GatewayConfig::load(file.path()).unwrap();
    Gateway::with_transport(config, Arc::new(FixtureTransport))
}

#[tokio::test]
async fn dispatch_fails_over_and_disables_broken_channel() {
    let gateway = load_gateway();
    let request = DispatchRequest::new("gpt-4o", "default", serde_json::json!({}));

    let ok = gateway
        .dispatcher
        .dispatch(&request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(ok.channel_id, 2);
    assert_eq!(ok.attempts, 2);
    assert_eq!(ok.payload["model"], "gpt-4o-2024-08-06");

    let registry = gateway.dispatcher.registry();
    assert_eq!(registry.get(1).unwrap().status, ChannelStatus::AutoDisabled);
    assert_eq!(registry.group_models("default"), vec!["claude-*", "gpt-4o"]);
}

#[tokio::test]
async fn wildcard_model_routes_to_declaring_channel() {
    let gateway = load_gateway();
    let request = DispatchRequest::new("claude-3-5-sonnet", "default", serde_json::json!({}));
    let ok = gateway
        .dispatcher
        .dispatch(&request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(ok.channel_id, 2);
}

#[tokio::test]
async fn batch_test_shares_recorder_with_dispatcher() {
    let gateway = load_gateway();
    let summary = gateway.tester.test_all_channels().await.unwrap();

    assert_eq!(summary.tested, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.disabled, 1);
    assert_eq!(gateway.dispatcher.recorder().recent_attempts().len(), 2);
    assert!(gateway
        .dispatcher
        .registry()
        .get(2)
        .unwrap()
        .test_time
        .is_some());
}

#[tokio::test]
async fn no_background_tasks_without_test_frequency() {
    let gateway = load_gateway();
    let cancel = CancellationToken::new();
    assert!(gateway.spawn_background(&cancel).is_empty());
}
