use std::sync::Arc;

use bytes::Bytes;
use onerelay_protocol::openai::{CanonicalError, Usage};
use onerelay_protocol::openai::create_chat_completions::CreateChatCompletionRequestBody;
use onerelay_protocol::openai::create_completions::CreateCompletionRequestBody;
use onerelay_protocol::openai::create_images::CreateImageRequestBody;
use onerelay_provider_core::{
    Channel, ChannelKind, ClientPoolConfig, HttpClientPool, ProviderError, RelayCtx, RelayOutput,
};
use onerelay_provider_impl::builtin_registry;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ctx(raw_body: &str) -> RelayCtx {
    RelayCtx {
        trace_id: "trace".to_string(),
        query: None,
        raw_body: Bytes::from(raw_body.to_string()),
        cancel: CancellationToken::new(),
        clients: Arc::new(HttpClientPool::new(ClientPoolConfig::default())),
    }
}

fn channel(kind: ChannelKind, base_url: &str) -> Channel {
    let mut channel = Channel::new(1, kind, "sk-test");
    channel.base_url = Some(base_url.to_string());
    channel
}

#[tokio::test]
async fn completion_passes_raw_body_and_reports_usage() {
    let server = MockServer::start().await;
    let raw = r#"{"model":"gpt-3.5-turbo-instruct","prompt":"hi","vendor_flag":true}"#;
    Mock::given(method("POST"))
        .and(path("/v1/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_json(json!({"model":"gpt-3.5-turbo-instruct","prompt":"hi","vendor_flag":true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cmpl-1",
            "object": "text_completion",
            "choices": [{"text": "hello", "index": 0, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3}
        })))
        .mount(&server)
        .await;

    let registry = builtin_registry();
    let provider = registry
        .create(channel(ChannelKind::OpenAI, &server.uri()), ctx(raw))
        .unwrap();
    let request: CreateCompletionRequestBody = serde_json::from_str(raw).unwrap();
    let output = provider
        .as_completion()
        .unwrap()
        .completion(&request, false)
        .await
        .unwrap();
    match output {
        RelayOutput::Json { usage, text, .. } => {
            assert_eq!(usage, Some(Usage::new(1, 2)));
            assert_eq!(text, "hello");
        }
        other => panic!("unexpected output {other:?}"),
    }
}

#[tokio::test]
async fn image_generation_round_trip_has_no_usage() {
    let server = MockServer::start().await;
    let raw = r#"{"model":"dall-e-3","prompt":"a cat","size":"1024x1792","quality":"hd"}"#;
    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_json(json!({"model":"dall-e-3","prompt":"a cat","size":"1024x1792","quality":"hd"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "created": 1,
            "data": [{"url": "https://images.example/cat.png"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = builtin_registry()
        .create(channel(ChannelKind::OpenAI, &server.uri()), ctx(raw))
        .unwrap();
    let request: CreateImageRequestBody = serde_json::from_str(raw).unwrap();
    let output = provider
        .as_image_generation()
        .unwrap()
        .image_generation(&request, false)
        .await
        .unwrap();
    match output {
        RelayOutput::Json { body, usage, text } => {
            assert_eq!(usage, None);
            assert!(text.is_empty());
            let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(value["data"][0]["url"], "https://images.example/cat.png");
        }
        other => panic!("unexpected output {other:?}"),
    }
}

#[tokio::test]
async fn mapped_chat_is_reserialized_and_streamed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_json(json!({
            "model": "gpt-4-turbo",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(concat!(
                    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
                    "data: [DONE]\n\n"
                )),
        )
        .mount(&server)
        .await;

    let raw = r#"{"model":"gpt-4","messages":[{"role":"user","content":"hi"}],"stream":true}"#;
    let mut request: CreateChatCompletionRequestBody = serde_json::from_str(raw).unwrap();
    request.model = "gpt-4-turbo".to_string();

    let provider = builtin_registry()
        .create(channel(ChannelKind::Custom, &server.uri()), ctx(raw))
        .unwrap();
    let output = provider
        .as_chat()
        .unwrap()
        .chat_completion(&request, true)
        .await
        .unwrap();
    let RelayOutput::Stream(pending) = output else {
        panic!("expected a stream");
    };
    let (tx, mut rx) = mpsc::channel(8);
    let outcome = pending.relay(tx).await;
    assert_eq!(outcome.text, "Hello");
    assert_eq!(outcome.forwarded, 3);
    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    assert_eq!(frames.last(), Some(&Bytes::from("data: [DONE]\n\n")));
}

#[tokio::test]
async fn upstream_error_is_normalized_before_streaming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"message": "Rate limit reached", "type": "requests", "code": "rate_limit_exceeded"}
        })))
        .mount(&server)
        .await;

    let raw = r#"{"model":"gpt-4","messages":[],"stream":true}"#;
    let request: CreateChatCompletionRequestBody = serde_json::from_str(raw).unwrap();
    let provider = builtin_registry()
        .create(channel(ChannelKind::OpenAI, &server.uri()), ctx(raw))
        .unwrap();
    let err = provider
        .as_chat()
        .unwrap()
        .chat_completion(&request, false)
        .await
        .unwrap_err();
    assert_eq!(err.status, 429);
    assert_eq!(err.error.message, "Rate limit reached");
    assert_eq!(err.error.error_type, "requests");
}

#[test]
fn channels_without_a_base_url_are_rejected_at_creation() {
    let registry = builtin_registry();
    for kind in [ChannelKind::Custom, ChannelKind::Azure] {
        let err = match registry.create(Channel::new(9, kind, "k"), ctx("")) {
            Ok(_) => panic!("{kind:?} accepted a channel without base url"),
            Err(err) => CanonicalError::from(err),
        };
        assert_eq!(err.status, 500);
        assert_eq!(err.code_str(), Some("invalid_channel_config"));
    }
    assert!(registry.create(Channel::new(9, ChannelKind::OpenAI, "k"), ctx("")).is_ok());
}

#[test]
fn xunfei_key_must_be_a_full_triple() {
    let registry = builtin_registry();
    let create = |key: &str| registry.create(Channel::new(5, ChannelKind::Xunfei, key), ctx(""));
    assert!(matches!(
        create("app|secret"),
        Err(ProviderError::MissingCredentialField("api_key"))
    ));
    assert!(matches!(
        create("app||key"),
        Err(ProviderError::MissingCredentialField("api_secret"))
    ));
    assert!(matches!(create("a|b|c|d"), Err(ProviderError::InvalidConfig(_))));
    assert!(create("app|secret|key").is_ok());
}

#[tokio::test]
async fn api2d_balance_reads_credit_grants() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dashboard/billing/credit_grants"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "credit_summary",
            "total_granted": 10.0,
            "total_used": 2.5,
            "total_available": 7.5
        })))
        .mount(&server)
        .await;

    let provider = builtin_registry()
        .create(channel(ChannelKind::Api2d, &server.uri()), ctx(""))
        .unwrap();
    let balance = provider.as_balance().unwrap().query_balance().await.unwrap();
    assert_eq!(balance, 7.5);
}

#[tokio::test]
async fn openai_balance_subtracts_usage_cents() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/dashboard/billing/subscription"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "billing_subscription",
            "has_payment_method": true,
            "hard_limit_usd": 120.0
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/dashboard/billing/usage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "total_usage": 2050.0
        })))
        .mount(&server)
        .await;

    let provider = builtin_registry()
        .create(channel(ChannelKind::OpenAI, &server.uri()), ctx(""))
        .unwrap();
    let balance = provider.as_balance().unwrap().query_balance().await.unwrap();
    assert!((balance - 99.5).abs() < 1e-9);
}

#[test]
fn azure_and_custom_have_no_balance_capability() {
    let registry = builtin_registry();
    for kind in [ChannelKind::Azure, ChannelKind::Custom] {
        let provider = registry.create(channel(kind, "https://x"), ctx("")).unwrap();
        assert!(provider.as_balance().is_none(), "{kind:?}");
    }
    let mut spark = channel(ChannelKind::Xunfei, "wss://x");
    spark.key = "app|secret|key".to_string();
    let xunfei = registry.create(spark, ctx("")).unwrap();
    assert!(xunfei.as_balance().is_none());
    assert!(xunfei.as_completion().is_none());
    assert!(xunfei.as_image_generation().is_none());
    assert!(xunfei.as_chat().is_some());
}
