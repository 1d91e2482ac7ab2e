//! Relaycast 渠道调度
//!
//! 包含：
//! - 渠道注册表与模型索引
//! - 冷却状态跟踪
//! - 分层加权选择
//! - 带重试的请求调度
//! - 尝试结果记录与自动禁用/启用
//! - 渠道测速

pub mod health;
pub mod orchestrator;
pub mod recorder;
pub mod registry;
pub mod selector;
pub mod tester;
pub mod transport;

pub use health::HealthTracker;
pub use orchestrator::{DispatchRequest, DispatchSuccess, Dispatcher};
pub use recorder::{
    AttemptPath, AttemptRecord, ChannelNotifier, HealthCheckVerdict, LogNotifier, OutcomeRecorder,
    QuotaPolicy, TokenQuota,
};
pub use registry::ChannelRegistry;
pub use selector::{RandomSource, SeededRandom, SelectionError, ThreadRandom, TierSelector};
pub use tester::{BatchTestSummary, ChannelTestReport, ChannelTester, TesterError};
pub use transport::{ChannelTransport, HttpTransport, TransportResponse, UpstreamRequest};
