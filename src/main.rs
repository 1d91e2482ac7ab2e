use anyhow::Context;
use relaycast::Gateway;
use relaycast_core::logger::init_logging;
use relaycast_core::GatewayConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const CONFIG_ENV: &str = "RELAYCAST_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "relaycast.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config =
        GatewayConfig::load(&path).with_context(|| format!("加载配置文件失败: {path}"))?;
    init_logging(&config.logging);
    info!(
        "[MAIN] relaycast v{} 启动，配置文件: {}",
        relaycast_core::version(),
        path
    );

    let gateway = Gateway::from_config(config);
    let registry = gateway.dispatcher.registry();
    info!("[MAIN] 已加载 {} 个渠道", registry.len());
    for channel in registry.telemetry() {
        info!(
            "[MAIN] channel_id={} name={} status={} priority={} weight={}",
            channel.id, channel.name, channel.status, channel.priority, channel.weight
        );
    }

    let cancel = CancellationToken::new();
    let tasks = gateway.spawn_background(&cancel);

    tokio::signal::ctrl_c()
        .await
        .context("监听退出信号失败")?;
    info!("[MAIN] 收到退出信号，正在停止");
    cancel.cancel();

    for task in tasks {
        if let Err(err) = task.await {
            warn!("[MAIN] 后台任务退出异常: {}", err);
        }
    }
    Ok(())
}
