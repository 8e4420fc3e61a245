//! Azure OpenAI: deployment-scoped paths, `api-key` auth, API version taken
//! from the channel's `other` field.

use onerelay_provider_core::{Channel, Provider, ProviderResult, RelayCtx};

use crate::providers::openai::{OpenAIProvider, require_base_url};

const PROVIDER_NAME: &str = "azure";

pub fn create(channel: Channel, ctx: RelayCtx) -> ProviderResult<Box<dyn Provider>> {
    require_base_url(&channel)?;
    Ok(Box::new(
        OpenAIProvider::with_base_url(PROVIDER_NAME, channel, ctx, "").into_azure(),
    ))
}
