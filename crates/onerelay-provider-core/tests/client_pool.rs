use bytes::Bytes;
use onerelay_protocol::openai::CanonicalError;
use onerelay_provider_core::{
    ClientPoolConfig, HttpClientPool, JsonStreamHandler, PendingStream, UpstreamBody,
    UpstreamFailure, UpstreamHttpRequest,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn unsupported_proxy_still_reaches_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
        .mount(&server)
        .await;

    let pool = HttpClientPool::new(ClientPoolConfig::default());
    let req = UpstreamHttpRequest::post(
        format!("{}/v1/completions", server.uri()),
        vec![("Authorization".to_string(), "Bearer sk-test".to_string())],
        Bytes::from_static(b"{}"),
        false,
    );
    let resp = pool
        .send(Some("gopher://nowhere:70"), req, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.into_bytes(), Bytes::from_static(b"{\"ok\":true}"));
}

#[tokio::test]
async fn error_status_is_normalized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("{\"msg\":\"bad key\"}"))
        .mount(&server)
        .await;

    let pool = HttpClientPool::new(ClientPoolConfig::default());
    let req = UpstreamHttpRequest::post(server.uri(), Vec::new(), Bytes::new(), true);
    let failure = pool
        .send(None, req, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(failure, UpstreamFailure::Http { status: 401, .. }));

    let err = CanonicalError::from(failure);
    assert_eq!(err.status, 401);
    assert_eq!(err.error.message, "bad key");
}

#[tokio::test]
async fn streamed_body_flows_through_relay() {
    #[derive(Deserialize)]
    struct Piece {
        text: String,
    }

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string("data: {\"text\":\"he\"}\n\ndata: {\"text\":\"llo\"}\n\ndata: [DONE]\n\n"),
        )
        .mount(&server)
        .await;

    let pool = HttpClientPool::new(ClientPoolConfig::default());
    let cancel = CancellationToken::new();
    let req = UpstreamHttpRequest::post(server.uri(), Vec::new(), Bytes::new(), true);
    let resp = pool.send(None, req, &cancel).await.unwrap();
    let UpstreamBody::Stream(upstream) = resp.body else {
        panic!("expected a streamed body");
    };

    let handler = JsonStreamHandler::<Piece>::new(|piece| piece.text.clone());
    let pending = PendingStream::new(upstream, Box::new(handler), "trace", cancel);
    let (tx, mut rx) = mpsc::channel(8);
    let outcome = pending.relay(tx).await;
    assert_eq!(outcome.text, "hello");
    assert_eq!(outcome.forwarded, 3);

    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    assert_eq!(frames.last(), Some(&Bytes::from("data: [DONE]\n\n")));
}

#[tokio::test]
async fn connection_failure_is_transport_error() {
    let pool = HttpClientPool::new(ClientPoolConfig::default());
    let req = UpstreamHttpRequest::get("http://127.0.0.1:9/unreachable", Vec::new());
    let failure = pool
        .send(None, req, &CancellationToken::new())
        .await
        .unwrap_err();
    let err = CanonicalError::from(failure);
    assert_eq!(err.status, 500);
    assert_eq!(err.code_str(), Some("http_connect_failed"));
}
