use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The `error` object of an OpenAI error body.
///
/// `code` and `param` stay untyped: upstreams send strings, numbers and nulls
/// in both positions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenAIError {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub code: JsonValue,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub param: JsonValue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenAIErrorResponse {
    pub error: OpenAIError,
}

/// Error type for everything the gateway itself rejects.
pub const LOCAL_ERROR_TYPE: &str = "onerelay_error";

/// An HTTP status paired with the OpenAI-shaped error returned to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalError {
    pub status: u16,
    pub error: OpenAIError,
}

impl CanonicalError {
    pub fn new(status: u16, error: OpenAIError) -> Self {
        Self { status, error }
    }

    /// Builds a locally generated error with the gateway's own error type.
    pub fn wrap(message: impl Into<String>, code: &str, status: u16) -> Self {
        Self {
            status,
            error: OpenAIError {
                message: message.into(),
                error_type: LOCAL_ERROR_TYPE.to_string(),
                code: JsonValue::String(code.to_string()),
                param: JsonValue::Null,
            },
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::wrap(message, "invalid_request", 400)
    }

    /// A local rejection that carries no machine-readable code.
    pub fn abort(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            error: OpenAIError {
                message: message.into(),
                error_type: LOCAL_ERROR_TYPE.to_string(),
                code: JsonValue::Null,
                param: JsonValue::Null,
            },
        }
    }

    pub fn code_str(&self) -> Option<&str> {
        self.error.code.as_str()
    }

    /// JSON body `{"error": {...}}`.
    pub fn to_body(&self) -> Bytes {
        let body = OpenAIErrorResponse {
            error: self.error.clone(),
        };
        match serde_json::to_vec(&body) {
            Ok(bytes) => Bytes::from(bytes),
            Err(_) => Bytes::from_static(b"{\"error\":{\"message\":\"internal error\"}}"),
        }
    }
}

impl fmt::Display for CanonicalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.status, self.error.error_type, self.error.message)
    }
}

impl std::error::Error for CanonicalError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_error_serializes_without_param() {
        let err = CanonicalError::wrap("max_tokens is invalid", "invalid_request", 400);
        let value: JsonValue = serde_json::from_slice(&err.to_body()).unwrap();
        assert_eq!(value["error"]["message"], "max_tokens is invalid");
        assert_eq!(value["error"]["type"], LOCAL_ERROR_TYPE);
        assert_eq!(value["error"]["code"], "invalid_request");
        assert!(value["error"].get("param").is_none());
    }

    #[test]
    fn numeric_code_is_accepted() {
        let parsed: OpenAIErrorResponse =
            serde_json::from_str(r#"{"error":{"message":"m","type":"t","code":429,"param":null}}"#)
                .unwrap();
        assert_eq!(parsed.error.code, JsonValue::from(429));
        assert_eq!(parsed.error.param, JsonValue::Null);
    }
}
