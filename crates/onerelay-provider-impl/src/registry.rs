use std::sync::Arc;

use onerelay_provider_core::{ChannelKind, ProviderFactory, ProviderRegistry};

use crate::providers::{api2d, azure, custom, openai, xunfei};

pub fn register_builtin_providers(registry: &mut ProviderRegistry) {
    let builtins: [(ChannelKind, Arc<dyn ProviderFactory>); 5] = [
        (ChannelKind::OpenAI, Arc::new(openai::create)),
        (ChannelKind::Azure, Arc::new(azure::create)),
        (ChannelKind::Api2d, Arc::new(api2d::create)),
        (ChannelKind::Custom, Arc::new(custom::create)),
        (ChannelKind::Xunfei, Arc::new(xunfei::create)),
    ];
    for (kind, factory) in builtins {
        registry.register(kind, factory);
    }
}

pub fn builtin_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    register_builtin_providers(&mut registry);
    registry
}
