//! 渠道冷却状态
//!
//! 失败渠道在 `frozen_until` 之前不可被选中。状态只在内存中，重启即清空；
//! 与持久化的禁用状态相互独立。

use dashmap::DashMap;
use relaycast_core::ChannelId;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// 冷却时长溢出时使用的上限（约 30 年）
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// 冷却状态跟踪器
///
/// 按渠道分片存储，冻结一个渠道不会阻塞对其他渠道的判定。
#[derive(Debug, Default)]
pub struct HealthTracker {
    frozen_until: DashMap<ChannelId, Instant>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `now` 时刻渠道是否仍在冷却中；从未冻结过的渠道返回 false
    pub fn is_frozen(&self, id: ChannelId, now: Instant) -> bool {
        self.frozen_until
            .get(&id)
            .is_some_and(|until| now < *until)
    }

    /// 冻结到 `now + interval`，后写覆盖先写
    ///
    /// 时刻溢出时饱和到 `FAR_FUTURE`，不会中断请求。
    pub fn freeze(&self, id: ChannelId, now: Instant, interval: Duration) {
        let until = now
            .checked_add(interval)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        self.frozen_until.insert(id, until);
        debug!(
            "[FREEZE] channel_id={} interval={}s",
            id,
            interval.as_secs_f64()
        );
    }

    pub fn frozen_until(&self, id: ChannelId) -> Option<Instant> {
        self.frozen_until.get(&id).map(|until| *until)
    }

    /// 立即解除冷却
    pub fn clear(&self, id: ChannelId) {
        self.frozen_until.remove(&id);
    }
}
