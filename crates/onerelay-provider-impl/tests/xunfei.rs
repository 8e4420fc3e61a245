use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use onerelay_protocol::openai::Usage;
use onerelay_protocol::openai::create_chat_completions::{
    CreateChatCompletionRequestBody, CreateChatCompletionResponse,
};
use onerelay_provider_core::{
    Channel, ChannelKind, ClientPoolConfig, HttpClientPool, Provider, RelayCtx, RelayOutput,
};
use onerelay_provider_impl::XunfeiProvider;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

fn ctx(query: Option<&str>) -> RelayCtx {
    RelayCtx {
        trace_id: "trace".to_string(),
        query: query.map(str::to_string),
        raw_body: Bytes::new(),
        cancel: CancellationToken::new(),
        clients: Arc::new(HttpClientPool::new(ClientPoolConfig::default())),
    }
}

fn provider(key: &str, base_url: Option<&str>, other: &str, query: Option<&str>) -> XunfeiProvider {
    let mut channel = Channel::new(5, ChannelKind::Xunfei, key);
    channel.base_url = base_url.map(str::to_string);
    channel.other = other.to_string();
    XunfeiProvider::new(channel, ctx(query))
}

fn frame(status: i64, content: &str, usage: Option<Value>) -> String {
    let mut payload = json!({
        "choices": {"status": status, "seq": 0, "text": [{"content": content, "role": "assistant", "index": 0}]}
    });
    if let Some(usage) = usage {
        payload["usage"] = json!({ "text": usage });
    }
    json!({
        "header": {"code": 0, "message": "Success", "sid": "sid-1", "status": status},
        "payload": payload
    })
    .to_string()
}

/// Accepts one connection, forwards the first client message, replies with `frames`.
async fn spark_server(frames: Vec<String>) -> (String, oneshot::Receiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        if let Some(Ok(Message::Text(text))) = ws.next().await {
            let _ = seen_tx.send(serde_json::from_str::<Value>(text.as_str()).unwrap());
        }
        for frame in frames {
            ws.send(Message::Text(frame.into())).await.unwrap();
        }
        let _ = ws.close(None).await;
    });
    (format!("ws://{addr}"), seen_rx)
}

fn chat_request(stream: bool) -> CreateChatCompletionRequestBody {
    serde_json::from_value(json!({
        "model": "SparkDesk",
        "messages": [
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "hello"}
        ],
        "stream": stream
    }))
    .unwrap()
}

#[test]
fn malformed_key_yields_empty_target_deterministically() {
    let provider = provider("only|two", None, "", None);
    assert_eq!(provider.build_url("", "SparkDesk"), "");
    assert_eq!(provider.build_url("", "SparkDesk"), "");
    assert!(provider.signed_target("Tue, 14 May 2024 08:00:00 GMT").is_none());
}

#[test]
fn version_falls_back_from_query_to_channel_to_default() {
    let date = "Tue, 14 May 2024 08:00:00 GMT";

    let target = provider("app|secret|key", None, "v2.1", Some("api-version=v3.1"))
        .signed_target(date)
        .unwrap();
    assert!(target.url.starts_with("wss://spark-api.xf-yun.com/v3.1/chat?authorization="));
    assert_eq!(target.domain, "generalv3");
    assert_eq!(target.app_id, "app");

    let target = provider("app|secret|key", None, "v2.1", None)
        .signed_target(date)
        .unwrap();
    assert!(target.url.starts_with("wss://spark-api.xf-yun.com/v2.1/chat?"));
    assert_eq!(target.domain, "generalv2");

    let target = provider("app|secret|key", None, "", None)
        .signed_target(date)
        .unwrap();
    assert!(target.url.starts_with("wss://spark-api.xf-yun.com/v1.1/chat?"));
    assert_eq!(target.domain, "general");

    let again = provider("app|secret|key", None, "", None)
        .signed_target(date)
        .unwrap();
    assert_eq!(target, again);
}

#[tokio::test]
async fn malformed_key_fails_before_connecting() {
    let provider = provider("not-a-triple", None, "", None);
    let err = provider
        .as_chat()
        .unwrap()
        .chat_completion(&chat_request(false), false)
        .await
        .unwrap_err();
    assert_eq!(err.status, 500);
    assert_eq!(err.code_str(), Some("invalid_channel_config"));
}

#[tokio::test]
async fn non_stream_chat_collects_frames() {
    let (base, seen) = spark_server(vec![
        frame(0, "Hi", None),
        frame(1, " there", None),
        frame(
            2,
            "!",
            Some(json!({"question_tokens": 2, "prompt_tokens": 6, "completion_tokens": 3, "total_tokens": 9})),
        ),
    ])
    .await;
    let provider = provider("app|secret|key", Some(&base), "v3.1", None);

    let output = provider
        .as_chat()
        .unwrap()
        .chat_completion(&chat_request(false), false)
        .await
        .unwrap();
    let RelayOutput::Json { body, usage, text } = output else {
        panic!("expected json output");
    };
    assert_eq!(text, "Hi there!");
    assert_eq!(usage, Some(Usage::new(6, 3)));
    let response: CreateChatCompletionResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(response.object, "chat.completion");
    assert_eq!(response.choices[0].message.content_text(), "Hi there!");

    let sent = seen.await.unwrap();
    assert_eq!(sent["header"]["app_id"], "app");
    assert_eq!(sent["parameter"]["chat"]["domain"], "generalv3");
    assert_eq!(sent["payload"]["message"]["text"][1]["content"], "Okay");
}

#[tokio::test]
async fn stream_chat_relays_chunks_and_usage() {
    let (base, _seen) = spark_server(vec![
        frame(0, "a", None),
        frame(
            2,
            "b",
            Some(json!({"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6})),
        ),
    ])
    .await;
    let provider = provider("app|secret|key", Some(&base), "", None);

    let output = provider
        .as_chat()
        .unwrap()
        .chat_completion(&chat_request(true), false)
        .await
        .unwrap();
    let RelayOutput::Stream(pending) = output else {
        panic!("expected a stream");
    };
    let (tx, mut rx) = mpsc::channel(8);
    let outcome = pending.relay(tx).await;
    assert_eq!(outcome.text, "ab");
    assert_eq!(outcome.usage, Some(Usage::new(4, 2)));
    assert_eq!(outcome.forwarded, 3);

    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    assert_eq!(frames.last(), Some(&Bytes::from("data: [DONE]\n\n")));
}

#[tokio::test]
async fn spark_error_frame_becomes_canonical_error() {
    let error = json!({"header": {"code": 11200, "message": "auth failed", "sid": "s", "status": 2}}).to_string();
    let (base, _seen) = spark_server(vec![error]).await;
    let provider = provider("app|secret|key", Some(&base), "", None);
    let err = provider
        .as_chat()
        .unwrap()
        .chat_completion(&chat_request(true), false)
        .await
        .unwrap_err();
    assert_eq!(err.status, 500);
    assert_eq!(err.error.message, "auth failed");
    assert_eq!(err.error.error_type, "xunfei_error");
}
