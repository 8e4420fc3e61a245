use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateImageRequestBody {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    /// `0` means "not set".
    #[serde(default, skip_serializing_if = "is_zero")]
    pub n: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub size: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub quality: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}
