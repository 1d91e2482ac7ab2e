//! 分层加权选择
//!
//! 先过滤出可用渠道，再取优先级最高的一层，层内按权重随机。
//! 随机源通过 [`RandomSource`] 注入，测试中可固定种子复现。

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use relaycast_core::{Channel, ChannelId};
use std::sync::Arc;
use thiserror::Error;

/// 选择错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("没有可用的渠道")]
    NoChannelAvailable,
}

/// 随机源
pub trait RandomSource: Send + Sync {
    /// 返回 `[0, upper)` 内的均匀随机数，`upper` 必须大于 0
    fn next_below(&self, upper: u64) -> u64;
}

/// 线程本地随机数
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_below(&self, upper: u64) -> u64 {
        rand::thread_rng().gen_range(0..upper)
    }
}

/// 固定种子的随机源
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_below(&self, upper: u64) -> u64 {
        self.rng.lock().gen_range(0..upper)
    }
}

/// 渠道是否可以参与本次选择
///
/// 状态启用、声明了该模型、允许该分组，且未被阻塞（冷却中或已被本请求排除）。
pub fn is_eligible(channel: &Channel, model: &str, group: &str, blocked: bool) -> bool {
    channel.status.is_enabled()
        && channel.serves_model(model)
        && channel.allows_group(group)
        && !blocked
}

/// 过滤候选渠道
///
/// `is_blocked` 返回 true 表示渠道正在冷却或已被本请求排除。
pub fn filter_eligible<F>(
    candidates: &[Arc<Channel>],
    model: &str,
    group: &str,
    is_blocked: F,
) -> Vec<Arc<Channel>>
where
    F: Fn(ChannelId) -> bool,
{
    candidates
        .iter()
        .filter(|c| is_eligible(c, model, group, is_blocked(c.id)))
        .cloned()
        .collect()
}

/// 优先级最高的一层（保持输入顺序）
pub fn highest_tier(candidates: &[Arc<Channel>]) -> Vec<Arc<Channel>> {
    let Some(top) = candidates.iter().map(|c| c.priority).max() else {
        return Vec::new();
    };
    candidates
        .iter()
        .filter(|c| c.priority == top)
        .cloned()
        .collect()
}

/// 分层加权选择器
#[derive(Clone)]
pub struct TierSelector {
    random: Arc<dyn RandomSource>,
}

impl TierSelector {
    pub fn new(random: Arc<dyn RandomSource>) -> Self {
        Self { random }
    }

    /// 固定种子，结果可复现
    pub fn seeded(seed: u64) -> Self {
        Self::new(Arc::new(SeededRandom::new(seed)))
    }

    /// 从已过滤的候选中选出一个渠道
    pub fn select(&self, eligible: &[Arc<Channel>]) -> Result<Arc<Channel>, SelectionError> {
        let tier = highest_tier(eligible);
        self.weighted_pick(&tier)
            .ok_or(SelectionError::NoChannelAvailable)
    }

    /// 层内按权重随机；权重 0 视为 1
    fn weighted_pick(&self, tier: &[Arc<Channel>]) -> Option<Arc<Channel>> {
        match tier {
            [] => None,
            [only] => Some(Arc::clone(only)),
            _ => {
                let total: u64 = tier.iter().map(|c| u64::from(c.effective_weight())).sum();
                let mut point = self.random.next_below(total);
                for channel in tier {
                    let weight = u64::from(channel.effective_weight());
                    if point < weight {
                        return Some(Arc::clone(channel));
                    }
                    point -= weight;
                }
                tier.last().cloned()
            }
        }
    }
}

impl Default for TierSelector {
    fn default() -> Self {
        Self::new(Arc::new(ThreadRandom))
    }
}

impl std::fmt::Debug for TierSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierSelector").finish_non_exhaustive()
    }
}
