use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::openai::create_chat_completions::types::ChatMessage;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateChatCompletionRequestBody {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl CreateChatCompletionRequestBody {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}
