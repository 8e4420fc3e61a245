use onerelay_protocol::openai::CanonicalError;
use onerelay_protocol::openai::create_chat_completions::CreateChatCompletionRequestBody;
use tracing::info;

use super::{
    InboundRequest, RelayEngine, Relayed, apply_model_mapping, check_max_tokens, decode,
    not_implemented, require_field,
};

impl RelayEngine {
    pub async fn chat_completions(
        &self,
        inbound: InboundRequest,
    ) -> Result<Relayed, CanonicalError> {
        let mut request: CreateChatCompletionRequestBody = decode(&inbound.body)?;
        require_field(&request.model, "model")?;
        if request.messages.is_empty() {
            return Err(CanonicalError::abort(400, "field messages is required"));
        }
        check_max_tokens(request.max_tokens)?;

        let channel = self.select_channel(&inbound.caller, &request.model).await?;
        let channel_id = channel.id;
        let model_mapped = apply_model_mapping(&channel, &mut request.model)?;

        let ctx = self.relay_ctx(&inbound);
        let provider = self.create_provider(channel, ctx.clone())?;
        let Some(capable) = provider.as_chat() else {
            return Err(not_implemented());
        };
        info!(
            event = "relay_dispatch",
            trace_id = %inbound.trace_id,
            op = "chat_completions",
            channel_id,
            provider = provider.name(),
            model = %request.model,
            model_mapped,
            is_stream = request.is_stream()
        );

        let prompt_tokens = self
            .tokens
            .count_messages(&request.model, &request.messages);
        let quota = self
            .quota
            .reserve(
                &inbound.caller,
                channel_id,
                &request.model,
                prompt_tokens,
                &inbound.trace_id,
            )
            .await?;

        let result = capable.chat_completion(&request, model_mapped).await;
        self.finish(result, quota, ctx, &request.model)
    }
}
