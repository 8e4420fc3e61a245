use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use onerelay_protocol::openai::CanonicalError;
use onerelay_protocol::openai::Usage;
use onerelay_protocol::openai::create_chat_completions::CreateChatCompletionRequestBody;
use onerelay_protocol::openai::create_completions::CreateCompletionRequestBody;
use onerelay_protocol::openai::create_images::CreateImageRequestBody;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::channel::Channel;
use crate::client::HttpClientPool;
use crate::headers::Headers;
use crate::stream::PendingStream;

/// Per-request inputs shared by every adapter.
#[derive(Clone)]
pub struct RelayCtx {
    pub trace_id: String,
    /// Raw inbound query string, without the leading `?`.
    pub query: Option<String>,
    /// Inbound body exactly as received.
    pub raw_body: Bytes,
    /// Scoped to this relay; cancelled when the caller goes away.
    pub cancel: CancellationToken,
    pub clients: Arc<HttpClientPool>,
}

/// What an adapter hands back on success.
pub enum RelayOutput {
    Json {
        body: Bytes,
        /// Usage reported by the upstream, when present.
        usage: Option<Usage>,
        /// Generated text, used to count completion tokens when `usage` is absent.
        text: String,
    },
    Stream(PendingStream),
}

impl std::fmt::Debug for RelayOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayOutput::Json { usage, .. } => {
                f.debug_struct("Json").field("usage", usage).finish()
            }
            RelayOutput::Stream(_) => f.write_str("Stream(<pending>)"),
        }
    }
}

/// Base contract every adapter implements.
///
/// Optional operations are reached through the `as_*` capability accessors,
/// which return `None` unless the adapter opts in.
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    fn channel(&self) -> &Channel;

    /// Full upstream target for `path` and the (already mapped) model.
    fn build_url(&self, path: &str, model: &str) -> String;

    fn build_headers(&self) -> Headers;

    fn as_completion(&self) -> Option<&dyn CompletionCapable> {
        None
    }

    fn as_chat(&self) -> Option<&dyn ChatCapable> {
        None
    }

    fn as_image_generation(&self) -> Option<&dyn ImageGenerationCapable> {
        None
    }

    fn as_balance(&self) -> Option<&dyn BalanceCapable> {
        None
    }
}

#[async_trait]
pub trait CompletionCapable: Send + Sync {
    async fn completion(
        &self,
        request: &CreateCompletionRequestBody,
        model_mapped: bool,
    ) -> Result<RelayOutput, CanonicalError>;
}

#[async_trait]
pub trait ChatCapable: Send + Sync {
    async fn chat_completion(
        &self,
        request: &CreateChatCompletionRequestBody,
        model_mapped: bool,
    ) -> Result<RelayOutput, CanonicalError>;
}

#[async_trait]
pub trait ImageGenerationCapable: Send + Sync {
    async fn image_generation(
        &self,
        request: &CreateImageRequestBody,
        model_mapped: bool,
    ) -> Result<RelayOutput, CanonicalError>;
}

#[async_trait]
pub trait BalanceCapable: Send + Sync {
    /// Available credit in USD as reported by the upstream.
    async fn query_balance(&self) -> Result<f64, CanonicalError>;
}

/// Outbound body: the inbound bytes untouched when the model was not mapped,
/// otherwise the re-serialized request.
pub fn build_body<T: Serialize>(
    raw_body: &Bytes,
    request: &T,
    model_mapped: bool,
) -> Result<Bytes, CanonicalError> {
    if !model_mapped {
        return Ok(raw_body.clone());
    }
    serde_json::to_vec(request)
        .map(Bytes::from)
        .map_err(|err| CanonicalError::wrap(err.to_string(), "marshal_request_body_failed", 500))
}
