use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use onerelay_provider_core::Channel;
use rand::Rng;

#[derive(Debug, thiserror::Error)]
pub enum ChannelStoreError {
    #[error("channel {0} not found")]
    NotFound(i64),
    #[error("channel store unavailable: {0}")]
    Unavailable(String),
}

/// Channel lookup and the two write-backs the relay performs.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// An enabled channel serving `model` for `group`, chosen at random among
    /// the highest-priority candidates.
    async fn select(&self, group: &str, model: &str) -> Result<Option<Channel>, ChannelStoreError>;

    async fn get(&self, id: i64) -> Result<Option<Channel>, ChannelStoreError>;

    async fn update_balance(&self, id: i64, balance: f64) -> Result<(), ChannelStoreError>;

    async fn add_used_quota(&self, id: i64, quota: i64) -> Result<(), ChannelStoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryChannelStore {
    channels: RwLock<HashMap<i64, Channel>>,
}

impl MemoryChannelStore {
    pub fn new(channels: impl IntoIterator<Item = Channel>) -> Self {
        Self {
            channels: RwLock::new(channels.into_iter().map(|c| (c.id, c)).collect()),
        }
    }

    pub fn upsert(&self, channel: Channel) -> Result<(), ChannelStoreError> {
        let mut guard = self.write()?;
        guard.insert(channel.id, channel);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.channels.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<i64, Channel>>, ChannelStoreError> {
        self.channels
            .read()
            .map_err(|_| ChannelStoreError::Unavailable("channel lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<i64, Channel>>, ChannelStoreError> {
        self.channels
            .write()
            .map_err(|_| ChannelStoreError::Unavailable("channel lock poisoned".to_string()))
    }

    fn update<F>(&self, id: i64, apply: F) -> Result<(), ChannelStoreError>
    where
        F: FnOnce(&mut Channel),
    {
        let mut guard = self.write()?;
        let channel = guard.get_mut(&id).ok_or(ChannelStoreError::NotFound(id))?;
        apply(channel);
        Ok(())
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn select(&self, group: &str, model: &str) -> Result<Option<Channel>, ChannelStoreError> {
        let guard = self.read()?;
        let candidates: Vec<&Channel> = guard
            .values()
            .filter(|channel| channel.enabled && channel.serves(group, model))
            .collect();
        let Some(top) = candidates.iter().map(|channel| channel.priority).max() else {
            return Ok(None);
        };
        let mut best: Vec<&Channel> = candidates
            .into_iter()
            .filter(|channel| channel.priority == top)
            .collect();
        best.sort_by_key(|channel| channel.id);
        let index = rand::rng().random_range(0..best.len());
        Ok(Some(best[index].clone()))
    }

    async fn get(&self, id: i64) -> Result<Option<Channel>, ChannelStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn update_balance(&self, id: i64, balance: f64) -> Result<(), ChannelStoreError> {
        self.update(id, |channel| channel.balance = balance)
    }

    async fn add_used_quota(&self, id: i64, quota: i64) -> Result<(), ChannelStoreError> {
        self.update(id, |channel| channel.used_quota += quota)
    }
}
