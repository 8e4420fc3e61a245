use onerelay_protocol::openai::CanonicalError;
use onerelay_protocol::openai::create_images::CreateImageRequestBody;
use tracing::info;

use super::{
    InboundRequest, RelayEngine, Relayed, apply_model_mapping, decode, not_implemented,
    require_field,
};
use crate::tokens::{image_prompt_tokens, image_size_ratio};

const DEFAULT_IMAGE_MODEL: &str = "dall-e-2";
const DEFAULT_IMAGE_SIZE: &str = "1024x1024";
const DEFAULT_IMAGE_QUALITY: &str = "standard";
const PRICED_IMAGE_MODELS: [&str; 2] = ["dall-e-2", "dall-e-3"];

impl RelayEngine {
    pub async fn image_generations(
        &self,
        inbound: InboundRequest,
    ) -> Result<Relayed, CanonicalError> {
        let mut request: CreateImageRequestBody = decode(&inbound.body)?;
        apply_image_defaults(&mut request);
        validate_image_request(&request)?;

        let channel = self.select_channel(&inbound.caller, &request.model).await?;
        let channel_id = channel.id;
        let model_mapped = apply_model_mapping(&channel, &mut request.model)?;

        let ctx = self.relay_ctx(&inbound);
        let provider = self.create_provider(channel, ctx.clone())?;
        let Some(capable) = provider.as_image_generation() else {
            return Err(not_implemented());
        };
        info!(
            event = "relay_dispatch",
            trace_id = %inbound.trace_id,
            op = "images_generations",
            channel_id,
            provider = provider.name(),
            model = %request.model,
            model_mapped,
            n = request.n,
            size = %request.size
        );

        // Models without a price table are charged as one standard image each.
        let prompt_tokens =
            image_prompt_tokens(&request.model, &request.size, &request.quality, request.n)
                .unwrap_or(1000 * request.n);
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

        let result = capable.image_generation(&request, model_mapped).await;
        self.finish(result, quota, ctx, &request.model)
    }
}

fn apply_image_defaults(request: &mut CreateImageRequestBody) {
    if request.model.is_empty() {
        request.model = DEFAULT_IMAGE_MODEL.to_string();
    }
    if request.n == 0 {
        request.n = 1;
    }
    if request.size.is_empty() {
        request.size = DEFAULT_IMAGE_SIZE.to_string();
    }
    if request.quality.is_empty() {
        request.quality = DEFAULT_IMAGE_QUALITY.to_string();
    }
}

fn validate_image_request(request: &CreateImageRequestBody) -> Result<(), CanonicalError> {
    require_field(&request.prompt, "prompt")?;
    if !(1..=10).contains(&request.n) {
        return Err(CanonicalError::abort(400, "n must be between 1 and 10"));
    }
    if request.model == "dall-e-3" && request.n != 1 {
        return Err(CanonicalError::abort(400, "n must be 1 for dall-e-3"));
    }
    if PRICED_IMAGE_MODELS.contains(&request.model.as_str())
        && image_size_ratio(&request.model, &request.size).is_none()
    {
        return Err(CanonicalError::abort(
            400,
            format!("size {} is not supported by {}", request.size, request.model),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: &str) -> CreateImageRequestBody {
        let mut request: CreateImageRequestBody = serde_json::from_str(json).unwrap();
        apply_image_defaults(&mut request);
        request
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let request = request(r#"{"prompt":"a cat"}"#);
        assert_eq!(request.model, "dall-e-2");
        assert_eq!(request.n, 1);
        assert_eq!(request.size, "1024x1024");
        assert_eq!(request.quality, "standard");
        assert!(validate_image_request(&request).is_ok());
    }

    #[test]
    fn rejects_bad_counts_and_sizes() {
        let cases = [
            r#"{"prompt":"x","n":11}"#,
            r#"{"prompt":"x","model":"dall-e-3","n":2}"#,
            r#"{"prompt":"x","model":"dall-e-3","size":"256x256"}"#,
            r#"{"prompt":"","model":"dall-e-2"}"#,
        ];
        for case in cases {
            let err = validate_image_request(&request(case)).unwrap_err();
            assert_eq!(err.status, 400, "{case}");
        }
    }

    #[test]
    fn unpriced_models_skip_the_size_table() {
        let request = request(r#"{"prompt":"x","model":"flux","size":"640x640"}"#);
        assert!(validate_image_request(&request).is_ok());
    }
}
