//! Request orchestration: validate, pick a channel, map the model, dispatch
//! to the adapter and settle quota on the way out.

mod chat;
mod completions;
mod images;
mod types;

use std::sync::Arc;

use bytes::Bytes;
use onerelay_protocol::openai::{CanonicalError, Usage};
use onerelay_provider_core::{
    Channel, HttpClientPool, Provider, ProviderRegistry, RelayCtx, RelayOutput,
};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::CallerCtx;
use crate::channels::{ChannelStore, ChannelStoreError};
use crate::quota::{QuotaInfo, QuotaSettlement};
use crate::tokens::TokenCounter;

pub use types::{InboundRequest, RelayBody, RelayMode, Relayed};

/// Frames buffered between the stream writer and the HTTP body.
const DOWNSTREAM_BUFFER: usize = 16;

pub struct RelayEngine {
    registry: Arc<ProviderRegistry>,
    channels: Arc<dyn ChannelStore>,
    quota: QuotaSettlement,
    tokens: Arc<dyn TokenCounter>,
    clients: Arc<HttpClientPool>,
}

impl RelayEngine {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        channels: Arc<dyn ChannelStore>,
        quota: QuotaSettlement,
        tokens: Arc<dyn TokenCounter>,
        clients: Arc<HttpClientPool>,
    ) -> Self {
        Self {
            registry,
            channels,
            quota,
            tokens,
            clients,
        }
    }

    pub fn channels(&self) -> &Arc<dyn ChannelStore> {
        &self.channels
    }

    pub async fn relay(
        &self,
        mode: RelayMode,
        inbound: InboundRequest,
    ) -> Result<Relayed, CanonicalError> {
        match mode {
            RelayMode::Completions => self.completions(inbound).await,
            RelayMode::ChatCompletions => self.chat_completions(inbound).await,
            RelayMode::ImagesGenerations => self.image_generations(inbound).await,
        }
    }

    /// Asks the channel's adapter for its available credit and stores the
    /// observed value on the channel.
    pub async fn refresh_balance(
        &self,
        channel_id: i64,
        trace_id: &str,
    ) -> Result<f64, CanonicalError> {
        let channel = self
            .channels
            .get(channel_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| CanonicalError::abort(404, format!("channel {channel_id} not found")))?;
        let ctx = RelayCtx {
            trace_id: trace_id.to_string(),
            query: None,
            raw_body: Bytes::new(),
            cancel: CancellationToken::new(),
            clients: self.clients.clone(),
        };
        let provider = self.create_provider(channel, ctx)?;
        let Some(capable) = provider.as_balance() else {
            return Err(not_implemented());
        };
        let balance = capable.query_balance().await?;
        if let Err(err) = self.channels.update_balance(channel_id, balance).await {
            warn!(event = "balance_store_failed", trace_id = %trace_id, channel_id, error = %err);
        }
        info!(
            event = "balance_refreshed",
            trace_id = %trace_id,
            channel_id,
            provider = provider.name(),
            balance
        );
        Ok(balance)
    }

    async fn select_channel(
        &self,
        caller: &CallerCtx,
        model: &str,
    ) -> Result<Channel, CanonicalError> {
        if let Some(id) = caller.specific_channel_id {
            let channel = self
                .channels
                .get(id)
                .await
                .map_err(store_error)?
                .ok_or_else(|| CanonicalError::abort(400, "invalid channel id"))?;
            if !channel.enabled {
                return Err(CanonicalError::abort(403, "channel disabled"));
            }
            return Ok(channel);
        }
        self.channels
            .select(&caller.group, model)
            .await
            .map_err(store_error)?
            .ok_or_else(|| {
                CanonicalError::abort(
                    503,
                    format!(
                        "no available channel for model {model} under group {}",
                        caller.group
                    ),
                )
            })
    }

    fn relay_ctx(&self, inbound: &InboundRequest) -> RelayCtx {
        RelayCtx {
            trace_id: inbound.trace_id.clone(),
            query: inbound.query.clone(),
            raw_body: inbound.body.clone(),
            cancel: inbound.cancel.child_token(),
            clients: self.clients.clone(),
        }
    }

    fn create_provider(
        &self,
        channel: Channel,
        ctx: RelayCtx,
    ) -> Result<Box<dyn Provider>, CanonicalError> {
        self.registry
            .create(channel, ctx)
            .map_err(CanonicalError::from)
    }

    /// Post-call step: refund on failure, settle on success. Streams are
    /// relayed on a background task that settles once the relay ends.
    fn finish(
        &self,
        result: Result<RelayOutput, CanonicalError>,
        quota: QuotaInfo,
        ctx: RelayCtx,
        model: &str,
    ) -> Result<Relayed, CanonicalError> {
        let output = match result {
            Ok(output) => output,
            Err(err) => {
                warn!(
                    event = "relay_failed",
                    trace_id = %ctx.trace_id,
                    status = err.status,
                    code = ?err.code_str(),
                    message = %err.error.message
                );
                quota.refund();
                return Err(err);
            }
        };

        match output {
            RelayOutput::Json { body, usage, text } => {
                let usage = resolve_usage(
                    self.tokens.as_ref(),
                    usage,
                    &text,
                    quota.prompt_tokens(),
                    model,
                );
                Ok(Relayed {
                    body: RelayBody::Json(body),
                    accounting: quota.settle(usage),
                })
            }
            RelayOutput::Stream(pending) => {
                let (tx, rx) = mpsc::channel(DOWNSTREAM_BUFFER);
                let tokens = self.tokens.clone();
                let model = model.to_string();
                let accounting = tokio::spawn(async move {
                    let _relay_guard = ctx.cancel.clone().drop_guard();
                    let outcome = pending.relay(tx).await;
                    info!(
                        event = "stream_finished",
                        trace_id = %ctx.trace_id,
                        forwarded = outcome.forwarded,
                        client_gone = outcome.client_gone
                    );
                    let usage = resolve_usage(
                        tokens.as_ref(),
                        outcome.usage,
                        &outcome.text,
                        quota.prompt_tokens(),
                        &model,
                    );
                    if let Err(err) = quota.settle(usage).await {
                        warn!(event = "quota_task_failed", trace_id = %ctx.trace_id, error = %err);
                    }
                });
                Ok(Relayed {
                    body: RelayBody::Stream(rx),
                    accounting,
                })
            }
        }
    }
}

/// Upstream usage when it carries anything, otherwise the estimated prompt
/// plus the generated text counted locally.
fn resolve_usage(
    tokens: &dyn TokenCounter,
    reported: Option<Usage>,
    text: &str,
    prompt_tokens: i64,
    model: &str,
) -> Usage {
    match reported {
        Some(usage) if !usage.is_empty() => usage,
        _ => Usage::new(prompt_tokens, tokens.count_text(model, text)),
    }
}

pub(crate) fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, CanonicalError> {
    serde_json::from_slice(body).map_err(|err| CanonicalError::abort(400, err.to_string()))
}

pub(crate) fn check_max_tokens(max_tokens: Option<i64>) -> Result<(), CanonicalError> {
    match max_tokens {
        Some(value) if !(0..=i64::from(i32::MAX / 2)).contains(&value) => {
            Err(CanonicalError::abort(400, "max_tokens is invalid"))
        }
        _ => Ok(()),
    }
}

pub(crate) fn require_field(value: &str, field: &str) -> Result<(), CanonicalError> {
    if value.trim().is_empty() {
        return Err(CanonicalError::abort(400, format!("field {field} is required")));
    }
    Ok(())
}

/// Replaces `model` with the channel's upstream name. Returns whether a
/// substitution happened.
pub(crate) fn apply_model_mapping(
    channel: &Channel,
    model: &mut String,
) -> Result<bool, CanonicalError> {
    let table = channel.model_mapping().map_err(|err| {
        CanonicalError::abort(500, format!("invalid model mapping of channel {}: {err}", channel.id))
    })?;
    let mapped = table
        .as_ref()
        .and_then(|table| table.get(model.as_str()))
        .filter(|mapped| !mapped.is_empty())
        .cloned();
    match mapped {
        Some(mapped) => {
            *model = mapped;
            Ok(true)
        }
        None => Ok(false),
    }
}

pub(crate) fn not_implemented() -> CanonicalError {
    CanonicalError::abort(501, "channel not implemented")
}

fn store_error(err: ChannelStoreError) -> CanonicalError {
    CanonicalError::wrap(err.to_string(), "channel_store_failed", 500)
}
