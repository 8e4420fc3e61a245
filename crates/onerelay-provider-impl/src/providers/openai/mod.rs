//! OpenAI-compatible adapter.
//!
//! Also backs Azure (deployment-scoped paths, `api-key` auth), API2D and
//! custom OpenAI-compatible endpoints; those modules only pick the base URL,
//! mode and balance endpoint.

mod balance;

use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use onerelay_protocol::openai::create_chat_completions::{
    CreateChatCompletionRequestBody, CreateChatCompletionResponse,
    CreateChatCompletionStreamResponse,
};
use onerelay_protocol::openai::create_completions::{
    CreateCompletionRequestBody, CreateCompletionResponse, CreateCompletionStreamResponse,
};
use onerelay_protocol::openai::create_images::{CreateImageRequestBody, CreateImageResponse};
use onerelay_protocol::openai::{CanonicalError, OpenAIErrorResponse, Usage};
use onerelay_provider_core::{
    BalanceCapable, Channel, ChatCapable, CompletionCapable, Headers, ImageGenerationCapable,
    JsonStreamHandler, PendingStream, Provider, ProviderError, ProviderResult, RelayCtx,
    RelayOutput, StreamHandler, UpstreamBody, UpstreamHttpRequest, UpstreamHttpResponse, build_body,
};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::auth_extractor;

pub use balance::BalanceEndpoint;

const PROVIDER_NAME: &str = "openai";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const CLOUDFLARE_GATEWAY: &str = "https://gateway.ai.cloudflare.com";
const AZURE_DALL_E_2: &str = "dall-e-2";
const AZURE_DALL_E_2_API_VERSION: &str = "2023-09-01-preview";

/// Relative paths of the relayed endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub completions: &'static str,
    pub chat_completions: &'static str,
    pub images_generations: &'static str,
}

pub const OPENAI_ENDPOINTS: Endpoints = Endpoints {
    completions: "/v1/completions",
    chat_completions: "/v1/chat/completions",
    images_generations: "/v1/images/generations",
};

pub const AZURE_ENDPOINTS: Endpoints = Endpoints {
    completions: "/completions",
    chat_completions: "/chat/completions",
    images_generations: "/images/generations",
};

pub fn create(channel: Channel, ctx: RelayCtx) -> ProviderResult<Box<dyn Provider>> {
    Ok(Box::new(OpenAIProvider::new(channel, ctx)))
}

/// Adapters without a default host need the channel to name one.
pub(crate) fn require_base_url(channel: &Channel) -> ProviderResult<()> {
    if channel.base_url_or("").is_empty() {
        return Err(ProviderError::InvalidConfig(format!(
            "channel {} requires a base url",
            channel.id
        )));
    }
    Ok(())
}

pub struct OpenAIProvider {
    name: &'static str,
    channel: Channel,
    ctx: RelayCtx,
    base_url: String,
    is_azure: bool,
    endpoints: Endpoints,
    balance: BalanceEndpoint,
}

impl OpenAIProvider {
    /// api.openai.com (or the channel's base URL) with subscription balance.
    pub fn new(channel: Channel, ctx: RelayCtx) -> Self {
        Self::with_base_url(PROVIDER_NAME, channel, ctx, DEFAULT_BASE_URL)
            .with_balance(BalanceEndpoint::Subscription)
    }

    /// Generic OpenAI-compatible adapter; the channel's base URL wins over
    /// `default_base_url`.
    pub fn with_base_url(
        name: &'static str,
        channel: Channel,
        ctx: RelayCtx,
        default_base_url: &str,
    ) -> Self {
        let base_url = channel.base_url_or(default_base_url);
        Self {
            name,
            channel,
            ctx,
            base_url,
            is_azure: false,
            endpoints: OPENAI_ENDPOINTS,
            balance: BalanceEndpoint::None,
        }
    }

    pub fn into_azure(mut self) -> Self {
        self.is_azure = true;
        self.endpoints = AZURE_ENDPOINTS;
        self
    }

    pub fn with_balance(mut self, balance: BalanceEndpoint) -> Self {
        self.balance = balance;
        self
    }

    pub fn is_azure(&self) -> bool {
        self.is_azure
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_path(&self, path: &str, model: &str) -> String {
        let mut path = if self.is_azure {
            if model == AZURE_DALL_E_2 {
                format!(
                    "/openai/{}:submit?api-version={AZURE_DALL_E_2_API_VERSION}",
                    path.trim_start_matches('/')
                )
            } else {
                // Deployment names cannot contain dots; the api version keeps its own.
                let deployment = model.replace('.', "");
                format!(
                    "/openai/deployments/{deployment}{path}?api-version={}",
                    self.channel.other
                )
            }
        } else {
            path.to_string()
        };

        if self.base_url.starts_with(CLOUDFLARE_GATEWAY) {
            let prefix = if self.is_azure {
                "/openai/deployments"
            } else {
                "/v1"
            };
            if let Some(rest) = path.strip_prefix(prefix) {
                path = rest.to_string();
            }
        }
        path
    }

    async fn send(
        &self,
        path: &str,
        model: &str,
        body: Bytes,
        is_stream: bool,
    ) -> Result<UpstreamHttpResponse, CanonicalError> {
        let url = self.build_url(path, model);
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ProviderError::InvalidConfig(format!(
                "channel {} has no usable base url",
                self.channel.id
            ))
            .into());
        }
        let mut headers = self.build_headers();
        auth_extractor::set_accept(&mut headers, is_stream);

        info!(
            event = "upstream_request",
            trace_id = %self.ctx.trace_id,
            provider = self.name,
            channel_id = self.channel.id,
            model = %model,
            is_stream = is_stream
        );
        let started_at = Instant::now();
        let req = UpstreamHttpRequest::post(url, headers, body, is_stream);
        let result = self
            .ctx
            .clients
            .send(self.channel.proxy.as_deref(), req, &self.ctx.cancel)
            .await;
        let elapsed_ms = started_at.elapsed().as_millis();
        match result {
            Ok(resp) => {
                info!(
                    event = "upstream_response",
                    trace_id = %self.ctx.trace_id,
                    provider = self.name,
                    status = resp.status,
                    elapsed_ms = elapsed_ms
                );
                Ok(resp)
            }
            Err(failure) => {
                let err = CanonicalError::from(failure);
                warn!(
                    event = "upstream_response",
                    trace_id = %self.ctx.trace_id,
                    provider = self.name,
                    status = err.status,
                    elapsed_ms = elapsed_ms,
                    error = %err.error.message
                );
                Err(err)
            }
        }
    }

    fn into_output<R: DeserializeOwned>(
        &self,
        resp: UpstreamHttpResponse,
        stream_handler: impl FnOnce() -> Box<dyn StreamHandler>,
        summarize: impl FnOnce(&R) -> (Option<Usage>, String),
    ) -> Result<RelayOutput, CanonicalError> {
        match resp.body {
            UpstreamBody::Stream(upstream) => Ok(RelayOutput::Stream(PendingStream::new(
                upstream,
                stream_handler(),
                self.ctx.trace_id.clone(),
                self.ctx.cancel.clone(),
            ))),
            UpstreamBody::Bytes(body) => {
                // Some resellers answer 200 with an error object.
                if let Ok(embedded) = serde_json::from_slice::<OpenAIErrorResponse>(&body)
                    && !embedded.error.error_type.is_empty()
                {
                    return Err(CanonicalError::new(500, embedded.error));
                }
                let parsed: R = serde_json::from_slice(&body).map_err(|err| {
                    CanonicalError::wrap(err.to_string(), "unmarshal_response_body_failed", 500)
                })?;
                let (usage, text) = summarize(&parsed);
                Ok(RelayOutput::Json { body, usage, text })
            }
        }
    }
}

impl Provider for OpenAIProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn channel(&self) -> &Channel {
        &self.channel
    }

    fn build_url(&self, path: &str, model: &str) -> String {
        format!("{}{}", self.base_url, self.request_path(path, model))
    }

    fn build_headers(&self) -> Headers {
        let mut headers = Headers::new();
        auth_extractor::set_content_type_json(&mut headers);
        if self.is_azure {
            auth_extractor::set_api_key(&mut headers, &self.channel.key);
        } else {
            auth_extractor::set_bearer(&mut headers, &self.channel.key);
        }
        headers
    }

    fn as_completion(&self) -> Option<&dyn CompletionCapable> {
        Some(self)
    }

    fn as_chat(&self) -> Option<&dyn ChatCapable> {
        Some(self)
    }

    fn as_image_generation(&self) -> Option<&dyn ImageGenerationCapable> {
        Some(self)
    }

    fn as_balance(&self) -> Option<&dyn BalanceCapable> {
        match self.balance {
            BalanceEndpoint::None => None,
            _ => Some(self),
        }
    }
}

#[async_trait]
impl CompletionCapable for OpenAIProvider {
    async fn completion(
        &self,
        request: &CreateCompletionRequestBody,
        model_mapped: bool,
    ) -> Result<RelayOutput, CanonicalError> {
        let body = build_body(&self.ctx.raw_body, request, model_mapped)?;
        let resp = self
            .send(self.endpoints.completions, &request.model, body, request.is_stream())
            .await?;
        self.into_output(
            resp,
            || {
                Box::new(JsonStreamHandler::<CreateCompletionStreamResponse>::new(
                    CreateCompletionStreamResponse::text,
                ))
            },
            |parsed: &CreateCompletionResponse| {
                let text = parsed.choices.iter().map(|c| c.text.as_str()).collect();
                (parsed.usage, text)
            },
        )
    }
}

#[async_trait]
impl ChatCapable for OpenAIProvider {
    async fn chat_completion(
        &self,
        request: &CreateChatCompletionRequestBody,
        model_mapped: bool,
    ) -> Result<RelayOutput, CanonicalError> {
        let body = build_body(&self.ctx.raw_body, request, model_mapped)?;
        let resp = self
            .send(
                self.endpoints.chat_completions,
                &request.model,
                body,
                request.is_stream(),
            )
            .await?;
        self.into_output(
            resp,
            || {
                Box::new(
                    JsonStreamHandler::<CreateChatCompletionStreamResponse>::new(
                        CreateChatCompletionStreamResponse::text,
                    )
                    .with_usage(|chunk| chunk.usage),
                )
            },
            |parsed: &CreateChatCompletionResponse| {
                let text = parsed
                    .choices
                    .iter()
                    .map(|c| c.message.content_text())
                    .collect();
                (parsed.usage, text)
            },
        )
    }
}

#[async_trait]
impl ImageGenerationCapable for OpenAIProvider {
    async fn image_generation(
        &self,
        request: &CreateImageRequestBody,
        model_mapped: bool,
    ) -> Result<RelayOutput, CanonicalError> {
        let body = build_body(&self.ctx.raw_body, request, model_mapped)?;
        let resp = self
            .send(self.endpoints.images_generations, &request.model, body, false)
            .await?;
        self.into_output(
            resp,
            || Box::new(JsonStreamHandler::<CreateImageResponse>::new(|_| String::new())),
            |_: &CreateImageResponse| (None, String::new()),
        )
    }
}

#[async_trait]
impl BalanceCapable for OpenAIProvider {
    async fn query_balance(&self) -> Result<f64, CanonicalError> {
        balance::query(self).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use onerelay_provider_core::{ChannelKind, ClientPoolConfig, HttpClientPool, header_get};
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn ctx() -> RelayCtx {
        RelayCtx {
            trace_id: "t".to_string(),
            query: None,
            raw_body: Bytes::new(),
            cancel: CancellationToken::new(),
            clients: Arc::new(HttpClientPool::new(ClientPoolConfig::default())),
        }
    }

    fn azure(base_url: &str, version: &str) -> OpenAIProvider {
        let mut channel = Channel::new(1, ChannelKind::Azure, "az-key");
        channel.base_url = Some(base_url.to_string());
        channel.other = version.to_string();
        OpenAIProvider::with_base_url("azure", channel, ctx(), "").into_azure()
    }

    #[test]
    fn azure_strips_dots_from_deployment_only() {
        let provider = azure("https://res.openai.azure.com/", "2024.02.01");
        assert_eq!(
            provider.build_url("/chat/completions", "gpt-3.5.turbo"),
            "https://res.openai.azure.com/openai/deployments/gpt35turbo/chat/completions?api-version=2024.02.01"
        );
    }

    #[test]
    fn azure_dall_e_2_uses_submit_endpoint() {
        let provider = azure("https://res.openai.azure.com", "2023-12-01-preview");
        assert_eq!(
            provider.build_url("/images/generations", "dall-e-2"),
            "https://res.openai.azure.com/openai/images/generations:submit?api-version=2023-09-01-preview"
        );
    }

    #[test]
    fn cloudflare_gateway_drops_implied_prefix() {
        let gateway = "https://gateway.ai.cloudflare.com/v1/acc/gw/openai";
        let mut channel = Channel::new(2, ChannelKind::OpenAI, "sk");
        channel.base_url = Some(gateway.to_string());
        let provider = OpenAIProvider::new(channel, ctx());
        assert_eq!(
            provider.build_url("/v1/chat/completions", "gpt-4"),
            format!("{gateway}/chat/completions")
        );

        let provider = azure("https://gateway.ai.cloudflare.com/v1/acc/gw/azure-openai/res", "2024-02-01");
        assert_eq!(
            provider.build_url("/chat/completions", "gpt-4"),
            "https://gateway.ai.cloudflare.com/v1/acc/gw/azure-openai/res/gpt-4/chat/completions?api-version=2024-02-01"
        );
    }

    #[test]
    fn auth_header_depends_on_mode() {
        let provider = OpenAIProvider::new(Channel::new(3, ChannelKind::OpenAI, "sk-1"), ctx());
        let headers = provider.build_headers();
        assert_eq!(header_get(&headers, "authorization"), Some("Bearer sk-1"));
        assert_eq!(header_get(&headers, "api-key"), None);
        assert_eq!(provider.build_url("/v1/completions", "m"), "https://api.openai.com/v1/completions");

        let headers = azure("https://x", "v").build_headers();
        assert_eq!(header_get(&headers, "api-key"), Some("az-key"));
        assert_eq!(header_get(&headers, "authorization"), None);
    }
}
