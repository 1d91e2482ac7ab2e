//! 渠道注册表
//!
//! 按 分组 -> 模型 -> 渠道 ID 建立内存索引，`lookup` 的开销只与命中的渠道数相关。
//! 状态与冻结不在这里过滤，由选择阶段处理。
//!
//! 索引用读写锁保护（读多写少），渠道本体放在分片的 `DashMap` 中；
//! 加锁顺序固定为先索引后渠道表。

use dashmap::DashMap;
use parking_lot::RwLock;
use relaycast_core::models::wildcard_prefix;
use relaycast_core::{Channel, ChannelId, ChannelStatus, ChannelTelemetry};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

type ModelTable = HashMap<String, BTreeSet<ChannelId>>;

#[derive(Debug, Default)]
struct ModelIndex {
    /// group -> model -> channel ids
    exact: HashMap<String, ModelTable>,
    /// group -> 通配前缀 -> channel ids
    wildcard: HashMap<String, ModelTable>,
}

impl ModelIndex {
    fn insert(&mut self, channel: &Channel) {
        for group in &channel.groups {
            for model in &channel.models {
                let (table, key) = match wildcard_prefix(model) {
                    Some(prefix) => (&mut self.wildcard, prefix),
                    None => (&mut self.exact, model.as_str()),
                };
                table
                    .entry(group.clone())
                    .or_default()
                    .entry(key.to_string())
                    .or_default()
                    .insert(channel.id);
            }
        }
    }

    fn remove(&mut self, channel: &Channel) {
        for group in &channel.groups {
            for model in &channel.models {
                let (table, key) = match wildcard_prefix(model) {
                    Some(prefix) => (&mut self.wildcard, prefix),
                    None => (&mut self.exact, model.as_str()),
                };
                let Some(models) = table.get_mut(group) else {
                    continue;
                };
                if let Some(ids) = models.get_mut(key) {
                    ids.remove(&channel.id);
                    if ids.is_empty() {
                        models.remove(key);
                    }
                }
                if models.is_empty() {
                    table.remove(group);
                }
            }
        }
    }

    /// 精确命中优先；否则取前缀最长的通配条目
    fn matching_ids(&self, model: &str, group: &str) -> Option<&BTreeSet<ChannelId>> {
        if let Some(ids) = self.exact.get(group).and_then(|models| models.get(model)) {
            return Some(ids);
        }
        self.wildcard
            .get(group)?
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, ids)| ids)
    }
}

/// 渠道注册表
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: DashMap<ChannelId, Arc<Channel>>,
    index: RwLock<ModelIndex>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由一组渠道构建注册表
    pub fn from_channels(channels: impl IntoIterator<Item = Channel>) -> Self {
        let registry = Self::new();
        registry.load(channels);
        registry
    }

    /// 查询可服务 `model` 且允许 `group` 的渠道，按 ID 升序
    ///
    /// 不过滤状态和冻结；无匹配时返回空列表。
    pub fn lookup(&self, model: &str, group: &str) -> Vec<Arc<Channel>> {
        let index = self.index.read();
        let Some(ids) = index.matching_ids(model, group) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.channels.get(id).map(|c| Arc::clone(c.value())))
            .collect()
    }

    /// 新增或替换渠道，返回旧值
    ///
    /// 替换时保留旧渠道的观测与计费字段（用量、响应时间、测速时间、余额），
    /// 这些字段只由结果记录器写入。
    pub fn upsert(&self, mut channel: Channel) -> Option<Arc<Channel>> {
        let mut index = self.index.write();
        let previous = self.channels.remove(&channel.id).map(|(_, old)| old);
        if let Some(old) = &previous {
            index.remove(old);
            channel.used_quota = old.used_quota;
            channel.response_time_ms = old.response_time_ms;
            channel.test_time = old.test_time;
            channel.balance = old.balance;
            channel.balance_updated_time = old.balance_updated_time;
        }
        index.insert(&channel);
        debug!(
            "[REGISTRY] upsert channel_id={} name={} priority={} weight={}",
            channel.id, channel.name, channel.priority, channel.weight
        );
        self.channels.insert(channel.id, Arc::new(channel));
        previous
    }

    /// 删除渠道，返回被删除的渠道
    pub fn remove(&self, id: ChannelId) -> Option<Arc<Channel>> {
        let mut index = self.index.write();
        let (_, removed) = self.channels.remove(&id)?;
        index.remove(&removed);
        debug!("[REGISTRY] remove channel_id={}", id);
        Some(removed)
    }

    /// 整体替换注册表内容
    pub fn load(&self, channels: impl IntoIterator<Item = Channel>) {
        let mut fresh = ModelIndex::default();
        let mut index = self.index.write();
        self.channels.clear();
        for channel in channels {
            fresh.insert(&channel);
            self.channels.insert(channel.id, Arc::new(channel));
        }
        *index = fresh;
        info!("[REGISTRY] 渠道加载完成: {} 个", self.channels.len());
    }

    pub fn get(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.channels.get(&id).map(|c| Arc::clone(c.value()))
    }

    /// 所有渠道，按 ID 升序
    pub fn list(&self) -> Vec<Arc<Channel>> {
        let mut channels: Vec<_> = self
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        channels.sort_by_key(|c| c.id);
        channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// 分组可用的模型名（通配条目保留 `*` 后缀），已排序
    pub fn group_models(&self, group: &str) -> Vec<String> {
        let index = self.index.read();
        let exact = index
            .exact
            .get(group)
            .into_iter()
            .flat_map(|models| models.keys().cloned());
        let wildcard = index
            .wildcard
            .get(group)
            .into_iter()
            .flat_map(|models| models.keys().map(|prefix| format!("{prefix}*")));
        let mut models: Vec<String> = exact.chain(wildcard).collect();
        models.sort();
        models
    }

    /// 管理端表格使用的观测数据
    pub fn telemetry(&self) -> Vec<ChannelTelemetry> {
        self.list().iter().map(|c| c.telemetry()).collect()
    }

    /// 修改不参与索引的字段（状态、观测、计费）
    fn modify<F>(&self, id: ChannelId, f: F) -> Option<Arc<Channel>>
    where
        F: FnOnce(&mut Channel),
    {
        let mut entry = self.channels.get_mut(&id)?;
        f(Arc::make_mut(entry.value_mut()));
        Some(Arc::clone(entry.value()))
    }

    /// 更新持久化状态，返回修改前的状态
    pub fn set_status(&self, id: ChannelId, status: ChannelStatus) -> Option<ChannelStatus> {
        let mut previous = None;
        self.modify(id, |channel| {
            previous = Some(channel.status);
            channel.status = status;
        })?;
        previous
    }

    /// 仅当当前状态为 `expected` 时改为 `next`，返回是否发生了变更
    pub fn transition_status(
        &self,
        id: ChannelId,
        expected: ChannelStatus,
        next: ChannelStatus,
    ) -> bool {
        let Some(mut entry) = self.channels.get_mut(&id) else {
            return false;
        };
        if entry.status != expected {
            return false;
        }
        Arc::make_mut(entry.value_mut()).status = next;
        true
    }

    pub(crate) fn record_test_result(
        &self,
        id: ChannelId,
        response_time_ms: u64,
        tested_at: chrono::DateTime<chrono::Utc>,
    ) -> Option<Arc<Channel>> {
        self.modify(id, |channel| {
            channel.response_time_ms = response_time_ms;
            channel.test_time = Some(tested_at);
        })
    }

    pub(crate) fn add_used_quota(&self, id: ChannelId, quota: i64) -> Option<Arc<Channel>> {
        self.modify(id, |channel| {
            channel.used_quota = channel.used_quota.saturating_add(quota);
        })
    }

    pub(crate) fn set_balance(
        &self,
        id: ChannelId,
        balance: f64,
        updated_at: chrono::DateTime<chrono::Utc>,
    ) -> Option<Arc<Channel>> {
        self.modify(id, |channel| {
            channel.balance = balance;
            channel.balance_updated_time = Some(updated_at);
        })
    }
}
