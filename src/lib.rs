//! Relaycast - 多上游模型网关的渠道调度服务
//!
//! ## Workspace 结构
//!
//! - relaycast-core crate（models, config, errors, logger）
//! - relaycast-dispatcher crate（registry, health, selector, orchestrator, recorder, tester, transport）
//! - 主 crate 负责组装与进程生命周期

use relaycast_core::{GatewayConfig, SharedDispatchConfig};
use relaycast_dispatcher::{
    ChannelRegistry, ChannelTester, ChannelTransport, Dispatcher, HttpTransport,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 组装好的网关组件
pub struct Gateway {
    pub config: SharedDispatchConfig,
    pub dispatcher: Arc<Dispatcher>,
    pub tester: Arc<ChannelTester>,
}

impl Gateway {
    /// 使用 HTTP 传输组装
    pub fn from_config(config: GatewayConfig) -> Self {
        Self::with_transport(config, Arc::new(HttpTransport::new()))
    }

    pub fn with_transport(config: GatewayConfig, transport: Arc<dyn ChannelTransport>) -> Self {
        let GatewayConfig {
            dispatch, channels, ..
        } = config;
        let shared = dispatch.into_shared();
        let registry = Arc::new(ChannelRegistry::from_channels(channels));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            Arc::clone(&shared),
        ));
        let tester = Arc::new(ChannelTester::new(
            registry,
            transport,
            Arc::clone(dispatcher.recorder()),
            Arc::clone(&shared),
        ));
        Self {
            config: shared,
            dispatcher,
            tester,
        }
    }

    /// 启动后台任务（目前只有定时测速）
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        Arc::clone(&self.tester)
            .spawn_periodic(cancel.child_token())
            .into_iter()
            .collect()
    }
}
