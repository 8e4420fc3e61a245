use serde::{Deserialize, Serialize};

use crate::openai::create_chat_completions::types::ChatCompletionDelta;
use crate::openai::usage::Usage;

pub const CHAT_COMPLETION_CHUNK_OBJECT: &str = "chat.completion.chunk";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionStreamChoice {
    #[serde(default)]
    pub index: i64,
    #[serde(default)]
    pub delta: ChatCompletionDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateChatCompletionStreamResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChatCompletionStreamChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl CreateChatCompletionStreamResponse {
    pub fn text(&self) -> String {
        self.choices
            .iter()
            .filter_map(|choice| choice.delta.content.as_deref())
            .collect()
    }
}
