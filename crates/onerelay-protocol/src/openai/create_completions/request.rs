use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateCompletionRequestBody {
    #[serde(default)]
    pub model: String,
    /// String, array of strings, or token arrays.
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub prompt: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Fields the relay does not inspect, forwarded untouched.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl CreateCompletionRequestBody {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Text segments of `prompt` used for token counting.
    pub fn prompt_texts(&self) -> Vec<String> {
        match &self.prompt {
            JsonValue::String(text) => vec![text.clone()],
            JsonValue::Array(items) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}
