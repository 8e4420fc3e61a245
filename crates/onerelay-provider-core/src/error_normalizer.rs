//! Maps arbitrary upstream error bodies onto [`CanonicalError`].

use onerelay_protocol::openai::{CanonicalError, OpenAIError};
use serde_json::Value as JsonValue;

pub const UPSTREAM_ERROR_TYPE: &str = "upstream_error";
pub const BAD_STATUS_CODE: &str = "bad_response_status_code";

/// Flat or nested locations checked after the OpenAI `error` object, in order.
const MESSAGE_POINTERS: [&str; 6] = [
    "/message",
    "/msg",
    "/err",
    "/error_msg",
    "/header/message",
    "/response/error/message",
];

/// Builds the caller-facing error for a non-2xx upstream response.
///
/// Never fails: undecodable or unrecognized bodies yield
/// `bad response status code <status>`.
pub fn normalize_error(status: u16, body: &[u8]) -> CanonicalError {
    let mut canonical = CanonicalError::new(
        status,
        OpenAIError {
            message: String::new(),
            error_type: UPSTREAM_ERROR_TYPE.to_string(),
            code: JsonValue::String(BAD_STATUS_CODE.to_string()),
            param: JsonValue::String(status.to_string()),
        },
    );

    let Ok(value) = serde_json::from_slice::<JsonValue>(body) else {
        canonical.error.message = fallback_message(status);
        return canonical;
    };

    if let Some(error) = openai_error(&value) {
        canonical.error = error;
        return canonical;
    }

    canonical.error.message = MESSAGE_POINTERS
        .iter()
        .filter_map(|pointer| value.pointer(pointer).and_then(JsonValue::as_str))
        .find(|message| !message.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| fallback_message(status));
    canonical
}

fn openai_error(value: &JsonValue) -> Option<OpenAIError> {
    let error = value.get("error")?;
    let message = error.get("message").and_then(JsonValue::as_str)?;
    if message.is_empty() {
        return None;
    }
    Some(OpenAIError {
        message: message.to_string(),
        error_type: error
            .get("type")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string(),
        code: error.get("code").cloned().unwrap_or(JsonValue::Null),
        param: error.get("param").cloned().unwrap_or(JsonValue::Null),
    })
}

fn fallback_message(status: u16) -> String {
    format!("bad response status code {status}")
}
