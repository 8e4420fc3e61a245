use onerelay_provider_core::{Channel, Provider, ProviderResult, RelayCtx};

use crate::providers::openai::{BalanceEndpoint, OpenAIProvider};

const PROVIDER_NAME: &str = "api2d";
pub const DEFAULT_BASE_URL: &str = "https://oa.api2d.net";

/// API2D resells OpenAI behind its own host and exposes credit grants.
pub fn create(channel: Channel, ctx: RelayCtx) -> ProviderResult<Box<dyn Provider>> {
    Ok(Box::new(
        OpenAIProvider::with_base_url(PROVIDER_NAME, channel, ctx, DEFAULT_BASE_URL)
            .with_balance(BalanceEndpoint::CreditGrants),
    ))
}
