use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use onerelay_protocol::openai::create_chat_completions::ChatMessage;
use tiktoken_rs::{CoreBPE, cl100k_base, get_bpe_from_model, o200k_base};
use tracing::warn;

/// Black-box token estimator used for quota pre-consumption and for counting
/// completion tokens when the upstream reports no usage.
pub trait TokenCounter: Send + Sync {
    fn count_text(&self, model: &str, text: &str) -> i64;

    fn count_prompts(&self, model: &str, prompts: &[String]) -> i64 {
        prompts
            .iter()
            .map(|prompt| self.count_text(model, prompt))
            .sum()
    }

    /// Every message costs 3 tokens of framing plus its role, content and name;
    /// the reply is primed with 3 more.
    fn count_messages(&self, model: &str, messages: &[ChatMessage]) -> i64 {
        let mut total = 0;
        for message in messages {
            total += 3;
            total += self.count_text(model, &message.role);
            total += self.count_text(model, &message.content_text());
            if let Some(name) = message.name.as_deref() {
                total += self.count_text(model, name) + 1;
            }
        }
        total + 3
    }
}

/// tiktoken-backed counter. Encoders are loaded once per model name.
#[derive(Default)]
pub struct TiktokenCounter {
    encoders: Mutex<HashMap<String, Option<Arc<CoreBPE>>>>,
}

impl TiktokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn encoder(&self, model: &str) -> Option<Arc<CoreBPE>> {
        let mut encoders = match self.encoders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(found) = encoders.get(model) {
            return found.clone();
        }
        let loaded = match bpe_for_model(model) {
            Ok(bpe) => Some(Arc::new(bpe)),
            Err(err) => {
                warn!(event = "tokenizer_unavailable", model = %model, error = %err);
                None
            }
        };
        encoders.insert(model.to_string(), loaded.clone());
        loaded
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_text(&self, model: &str, text: &str) -> i64 {
        if text.is_empty() {
            return 0;
        }
        match self.encoder(model) {
            Some(bpe) => bpe.encode_ordinary(text).len() as i64,
            None => approximate(text),
        }
    }
}

fn bpe_for_model(model: &str) -> Result<CoreBPE, String> {
    if let Ok(bpe) = get_bpe_from_model(model) {
        return Ok(bpe);
    }
    if is_o200k_model(model) {
        return o200k_base().map_err(|err| err.to_string());
    }
    cl100k_base().map_err(|err| err.to_string())
}

fn is_o200k_model(model: &str) -> bool {
    model.starts_with("gpt-4.1")
        || model.starts_with("gpt-4o")
        || model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4")
}

// Roughly four characters per token.
fn approximate(text: &str) -> i64 {
    (text.chars().count() as i64).div_ceil(4)
}

/// Prompt-token stand-in for image generation:
/// `floor(size_ratio * 1000) * n`.
pub fn image_prompt_tokens(model: &str, size: &str, quality: &str, n: i64) -> Option<i64> {
    let ratio = image_size_ratio(model, size)?;
    let ratio = if model == "dall-e-3" && quality == "hd" {
        if size == "1024x1024" { ratio * 2.0 } else { ratio * 1.5 }
    } else {
        ratio
    };
    Some((ratio * 1000.0).floor() as i64 * n)
}

/// Price ratio of `size` for `model`; `None` when the model does not offer it.
pub fn image_size_ratio(model: &str, size: &str) -> Option<f64> {
    match (model, size) {
        ("dall-e-2", "256x256") => Some(1.0),
        ("dall-e-2", "512x512") => Some(1.125),
        ("dall-e-2", "1024x1024") => Some(1.25),
        ("dall-e-3", "1024x1024") => Some(1.0),
        ("dall-e-3", "1024x1792") | ("dall-e-3", "1792x1024") => Some(2.0),
        _ => None,
    }
}
