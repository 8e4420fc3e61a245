//! Spark chat envelope and its conversion from/to OpenAI chat shapes.
//!
//! <https://www.xfyun.cn/doc/spark/Web.html>

use onerelay_protocol::openai::create_chat_completions::{
    ChatCompletionChoice, ChatCompletionDelta, ChatCompletionStreamChoice, ChatMessage,
    CreateChatCompletionRequestBody, CreateChatCompletionResponse,
    CreateChatCompletionStreamResponse,
};
use onerelay_protocol::openai::create_chat_completions::stream::CHAT_COMPLETION_CHUNK_OBJECT;
use onerelay_protocol::openai::{CanonicalError, OpenAIError, Usage};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const SPARK_ERROR_TYPE: &str = "xunfei_error";
const LAST_FRAME_STATUS: i64 = 2;

#[derive(Debug, Clone, Serialize)]
pub struct SparkRequest {
    pub header: SparkRequestHeader,
    pub parameter: SparkParameter,
    pub payload: SparkRequestPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct SparkRequestHeader {
    pub app_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SparkParameter {
    pub chat: SparkChatParameter,
}

#[derive(Debug, Clone, Serialize)]
pub struct SparkChatParameter {
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SparkRequestPayload {
    pub message: SparkMessageList,
}

#[derive(Debug, Clone, Serialize)]
pub struct SparkMessageList {
    pub text: Vec<SparkMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparkMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SparkFrame {
    pub header: SparkFrameHeader,
    #[serde(default)]
    pub payload: Option<SparkFramePayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SparkFrameHeader {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub sid: String,
    #[serde(default)]
    pub status: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SparkFramePayload {
    #[serde(default)]
    pub choices: SparkChoices,
    #[serde(default)]
    pub usage: Option<SparkUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SparkChoices {
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub text: Vec<SparkMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SparkUsage {
    pub text: Usage,
}

/// Spark has no system role: a system prompt becomes a user turn followed by
/// an assistant acknowledgement.
pub fn build_request(
    request: &CreateChatCompletionRequestBody,
    app_id: &str,
    domain: &str,
) -> SparkRequest {
    let mut text = Vec::with_capacity(request.messages.len());
    for message in &request.messages {
        let content = message.content_text();
        if message.role == "system" {
            text.push(SparkMessage {
                role: "user".to_string(),
                content,
            });
            text.push(SparkMessage {
                role: "assistant".to_string(),
                content: "Okay".to_string(),
            });
        } else {
            text.push(SparkMessage {
                role: message.role.clone(),
                content,
            });
        }
    }
    SparkRequest {
        header: SparkRequestHeader {
            app_id: app_id.to_string(),
        },
        parameter: SparkParameter {
            chat: SparkChatParameter {
                domain: domain.to_string(),
                temperature: request.temperature,
                max_tokens: request.max_tokens.filter(|value| *value > 0),
            },
        },
        payload: SparkRequestPayload {
            message: SparkMessageList { text },
        },
    }
}

impl SparkFrame {
    pub fn error(&self) -> Option<CanonicalError> {
        if self.header.code == 0 {
            return None;
        }
        Some(CanonicalError::new(
            500,
            OpenAIError {
                message: self.header.message.clone(),
                error_type: SPARK_ERROR_TYPE.to_string(),
                code: JsonValue::from(self.header.code),
                param: JsonValue::Null,
            },
        ))
    }

    pub fn is_last(&self) -> bool {
        self.header.status == LAST_FRAME_STATUS
            || self
                .payload
                .as_ref()
                .is_some_and(|payload| payload.choices.status == LAST_FRAME_STATUS)
    }

    pub fn text(&self) -> String {
        self.payload
            .as_ref()
            .map(|payload| {
                payload
                    .choices
                    .text
                    .iter()
                    .map(|part| part.content.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn usage(&self) -> Option<Usage> {
        let usage = self.payload.as_ref()?.usage.as_ref()?.text;
        Some(Usage::new(usage.prompt_tokens, usage.completion_tokens))
    }
}

/// Identity stamped on every chunk of one response.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub id: String,
    pub created: i64,
    pub model: String,
}

pub fn to_stream_chunk(frame: &SparkFrame, meta: &ResponseMeta) -> CreateChatCompletionStreamResponse {
    let last = frame.is_last();
    CreateChatCompletionStreamResponse {
        id: meta.id.clone(),
        object: CHAT_COMPLETION_CHUNK_OBJECT.to_string(),
        created: meta.created,
        model: meta.model.clone(),
        choices: vec![ChatCompletionStreamChoice {
            index: 0,
            delta: ChatCompletionDelta {
                role: Some("assistant".to_string()),
                content: Some(frame.text()),
            },
            finish_reason: last.then(|| "stop".to_string()),
        }],
        usage: if last { frame.usage() } else { None },
    }
}

pub fn to_response(text: String, usage: Option<Usage>, meta: &ResponseMeta) -> CreateChatCompletionResponse {
    CreateChatCompletionResponse {
        id: meta.id.clone(),
        object: "chat.completion".to_string(),
        created: meta.created,
        model: meta.model.clone(),
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: ChatMessage::new("assistant", text),
            finish_reason: Some("stop".to_string()),
        }],
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_becomes_user_and_ack() {
        let request: CreateChatCompletionRequestBody = serde_json::from_str(
            r#"{"model":"SparkDesk","messages":[{"role":"system","content":"be brief"},{"role":"user","content":"hi"}],"temperature":0.5}"#,
        )
        .unwrap();
        let spark = build_request(&request, "app", "generalv3");
        let value = serde_json::to_value(&spark).unwrap();
        assert_eq!(value["header"]["app_id"], "app");
        assert_eq!(value["parameter"]["chat"]["domain"], "generalv3");
        assert_eq!(value["parameter"]["chat"]["temperature"], 0.5);
        assert!(value["parameter"]["chat"].get("max_tokens").is_none());
        assert_eq!(
            spark.payload.message.text,
            vec![
                SparkMessage { role: "user".into(), content: "be brief".into() },
                SparkMessage { role: "assistant".into(), content: "Okay".into() },
                SparkMessage { role: "user".into(), content: "hi".into() },
            ]
        );
    }

    #[test]
    fn frames_decode_text_usage_and_errors() {
        let frame: SparkFrame = serde_json::from_str(
            r#"{"header":{"code":0,"message":"Success","sid":"s","status":2},
                "payload":{"choices":{"status":2,"seq":1,"text":[{"content":"done","role":"assistant","index":0}]},
                "usage":{"text":{"question_tokens":2,"prompt_tokens":5,"completion_tokens":7,"total_tokens":12}}}}"#,
        )
        .unwrap();
        assert!(frame.is_last());
        assert!(frame.error().is_none());
        assert_eq!(frame.text(), "done");
        assert_eq!(frame.usage(), Some(Usage::new(5, 7)));

        let failed: SparkFrame = serde_json::from_str(
            r#"{"header":{"code":10013,"message":"input content audit failed","sid":"s","status":2}}"#,
        )
        .unwrap();
        let err = failed.error().unwrap();
        assert_eq!(err.status, 500);
        assert_eq!(err.error.message, "input content audit failed");
        assert_eq!(err.error.code, JsonValue::from(10013));
    }
}
