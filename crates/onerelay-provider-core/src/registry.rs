use std::collections::HashMap;
use std::sync::Arc;

use crate::channel::{Channel, ChannelKind};
use crate::errors::{ProviderError, ProviderResult};
use crate::provider::{Provider, RelayCtx};

/// Builds a fresh adapter bound to one channel and one inbound request.
/// Channels the adapter can never serve (bad credentials, missing base URL)
/// are rejected here, before the relay reserves any quota.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, channel: Channel, ctx: RelayCtx) -> ProviderResult<Box<dyn Provider>>;
}

impl<F> ProviderFactory for F
where
    F: Fn(Channel, RelayCtx) -> ProviderResult<Box<dyn Provider>> + Send + Sync,
{
    fn create(&self, channel: Channel, ctx: RelayCtx) -> ProviderResult<Box<dyn Provider>> {
        self(channel, ctx)
    }
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    factories: HashMap<ChannelKind, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ChannelKind, factory: Arc<dyn ProviderFactory>) {
        self.factories.insert(kind, factory);
    }

    pub fn contains(&self, kind: ChannelKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub fn create(&self, channel: Channel, ctx: RelayCtx) -> ProviderResult<Box<dyn Provider>> {
        let factory = self
            .factories
            .get(&channel.kind)
            .ok_or(ProviderError::Unsupported("channel type"))?;
        factory.create(channel, ctx)
    }
}
