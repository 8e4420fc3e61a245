//! Xunfei Spark over a signed WebSocket.
//!
//! The channel key is `app_id|api_secret|api_key`. The handshake URL carries
//! an HMAC-SHA256 signature over `host`, `date` and the request line, so it is
//! rebuilt for every request.

pub mod spark;

use std::time::SystemTime;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures_util::{SinkExt, Stream, StreamExt};
use hmac::{Hmac, Mac};
use onerelay_protocol::openai::CanonicalError;
use onerelay_protocol::openai::create_chat_completions::{
    CreateChatCompletionRequestBody, CreateChatCompletionStreamResponse,
};
use onerelay_protocol::sse::{DONE_FRAME, data_line};
use onerelay_provider_core::{
    Channel, ChatCapable, Headers, JsonStreamHandler, PendingStream, Provider, ProviderError,
    ProviderResult, RelayCtx, RelayOutput,
};
use sha2::Sha256;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use self::spark::{ResponseMeta, SparkFrame};

const PROVIDER_NAME: &str = "xunfei";
pub const DEFAULT_BASE_URL: &str = "wss://spark-api.xf-yun.com";
pub const DEFAULT_API_VERSION: &str = "v1.1";
const CHUNK_BUFFER: usize = 16;

/// Rejects keys that are not a complete `app_id|api_secret|api_key` triple.
pub fn create(channel: Channel, ctx: RelayCtx) -> ProviderResult<Box<dyn Provider>> {
    credential_fields(&channel.key)?;
    Ok(Box::new(XunfeiProvider::new(channel, ctx)))
}

/// Splits the channel key into `[app_id, api_secret, api_key]`.
pub fn credential_fields(key: &str) -> ProviderResult<[&str; 3]> {
    const FIELDS: [&str; 3] = ["app_id", "api_secret", "api_key"];
    let mut parts = key.split('|');
    let mut fields = [""; 3];
    for (slot, name) in fields.iter_mut().zip(FIELDS) {
        match parts.next().map(str::trim).filter(|part| !part.is_empty()) {
            Some(part) => *slot = part,
            None => return Err(ProviderError::MissingCredentialField(name)),
        }
    }
    if parts.next().is_some() {
        return Err(ProviderError::InvalidConfig(
            "xunfei key must be app_id|api_secret|api_key".to_string(),
        ));
    }
    Ok(fields)
}

/// Handshake target derived from the channel key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTarget {
    pub url: String,
    pub domain: String,
    pub app_id: String,
}

pub struct XunfeiProvider {
    channel: Channel,
    ctx: RelayCtx,
    base_url: String,
}

impl XunfeiProvider {
    pub fn new(channel: Channel, ctx: RelayCtx) -> Self {
        let base_url = channel.base_url_or(DEFAULT_BASE_URL);
        Self {
            channel,
            ctx,
            base_url,
        }
    }

    /// `api-version` query parameter, then the channel's `other`, then `v1.1`.
    pub fn api_version(&self) -> String {
        let from_query = self
            .ctx
            .query
            .as_deref()
            .and_then(|query| serde_urlencoded::from_str::<Vec<(String, String)>>(query).ok())
            .and_then(|pairs| {
                pairs
                    .into_iter()
                    .find(|(name, value)| name == "api-version" && !value.is_empty())
                    .map(|(_, value)| value)
            });
        if let Some(version) = from_query {
            return version;
        }
        let other = self.channel.other.trim();
        if !other.is_empty() {
            return other.to_string();
        }
        info!(
            event = "xunfei_default_api_version",
            trace_id = %self.ctx.trace_id,
            api_version = DEFAULT_API_VERSION
        );
        DEFAULT_API_VERSION.to_string()
    }

    /// `None` when the key is not a `|`-separated triple or the base URL does
    /// not parse. Same inputs always give the same result.
    pub fn signed_target(&self, date: &str) -> Option<SignedTarget> {
        let [app_id, api_secret, api_key] = credential_fields(&self.channel.key).ok()?;
        let version = self.api_version();
        let host_url = format!("{}/{}/chat", self.base_url, version);
        let url = sign_url(&host_url, api_key, api_secret, date)?;
        Some(SignedTarget {
            url,
            domain: domain_for(&version),
            app_id: app_id.to_string(),
        })
    }

    async fn chat(
        &self,
        request: &CreateChatCompletionRequestBody,
    ) -> Result<RelayOutput, CanonicalError> {
        let target = self.signed_target(&http_date_now()).ok_or_else(|| {
            ProviderError::InvalidConfig(format!(
                "channel {} key must be app_id|api_secret|api_key",
                self.channel.id
            ))
        })?;
        if self.channel.proxy.is_some() {
            warn!(
                event = "proxy_ignored",
                trace_id = %self.ctx.trace_id,
                channel_id = self.channel.id,
                "websocket upstreams connect directly"
            );
        }

        let envelope = spark::build_request(request, &target.app_id, &target.domain);
        let payload = serde_json::to_string(&envelope).map_err(|err| {
            CanonicalError::wrap(err.to_string(), "marshal_request_body_failed", 500)
        })?;

        info!(
            event = "upstream_request",
            trace_id = %self.ctx.trace_id,
            provider = PROVIDER_NAME,
            channel_id = self.channel.id,
            domain = %target.domain,
            is_stream = request.is_stream()
        );
        let cancel = self.ctx.cancel.clone();
        let (socket, _) = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            connected = connect_async(target.url.as_str()) => connected.map_err(ws_failure)?,
        };
        let (mut write, mut read) = socket.split();
        write
            .send(Message::Text(payload.into()))
            .await
            .map_err(ws_failure)?;

        let first = next_frame(&mut read, &cancel).await?;
        if let Some(err) = first.error() {
            return Err(err);
        }

        let meta = ResponseMeta {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: OffsetDateTime::now_utc().unix_timestamp(),
            model: request.model.clone(),
        };

        if !request.is_stream() {
            let mut text = first.text();
            let mut last = first;
            while !last.is_last() {
                last = next_frame(&mut read, &cancel).await?;
                if let Some(err) = last.error() {
                    return Err(err);
                }
                text.push_str(&last.text());
            }
            let _ = write.close().await;
            let usage = last.usage();
            let response = spark::to_response(text.clone(), usage, &meta);
            let body = serde_json::to_vec(&response).map_err(|err| {
                CanonicalError::wrap(err.to_string(), "marshal_response_body_failed", 500)
            })?;
            return Ok(RelayOutput::Json {
                body: Bytes::from(body),
                usage,
                text,
            });
        }

        let (tx, rx) = mpsc::channel::<Bytes>(CHUNK_BUFFER);
        let trace_id = self.ctx.trace_id.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut frame = first;
            loop {
                let chunk = spark::to_stream_chunk(&frame, &meta);
                if !emit(&tx, &chunk).await {
                    break;
                }
                if frame.is_last() {
                    let _ = tx.send(Bytes::from(format!("{DONE_FRAME}\n"))).await;
                    break;
                }
                frame = match next_frame(&mut read, &task_cancel).await {
                    Ok(next) => match next.error() {
                        Some(err) => {
                            warn!(event = "xunfei_stream_error", trace_id = %trace_id, error = %err);
                            break;
                        }
                        None => next,
                    },
                    Err(err) => {
                        warn!(event = "xunfei_stream_error", trace_id = %trace_id, error = %err);
                        break;
                    }
                };
            }
            let _ = write.close().await;
        });

        let handler = JsonStreamHandler::<CreateChatCompletionStreamResponse>::new(
            CreateChatCompletionStreamResponse::text,
        )
        .with_usage(|chunk| chunk.usage);
        Ok(RelayOutput::Stream(PendingStream::new(
            rx,
            Box::new(handler),
            self.ctx.trace_id.clone(),
            cancel,
        )))
    }
}

impl Provider for XunfeiProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Signed handshake URL, or an empty string for a malformed key.
    fn build_url(&self, _path: &str, _model: &str) -> String {
        self.signed_target(&http_date_now())
            .map(|target| target.url)
            .unwrap_or_default()
    }

    fn build_headers(&self) -> Headers {
        Headers::new()
    }

    fn as_chat(&self) -> Option<&dyn ChatCapable> {
        Some(self)
    }
}

#[async_trait]
impl ChatCapable for XunfeiProvider {
    async fn chat_completion(
        &self,
        request: &CreateChatCompletionRequestBody,
        _model_mapped: bool,
    ) -> Result<RelayOutput, CanonicalError> {
        self.chat(request).await
    }
}

/// `general` for v1.1, otherwise `general` + the major part of the version
/// (`v3.1` -> `generalv3`).
pub fn domain_for(version: &str) -> String {
    if version == DEFAULT_API_VERSION {
        return "general".to_string();
    }
    let major = version.split('.').next().unwrap_or_default();
    format!("general{major}")
}

/// Appends `authorization`, `date` and `host` query parameters signed with
/// `api_secret` to `host_url`.
pub fn sign_url(host_url: &str, api_key: &str, api_secret: &str, date: &str) -> Option<String> {
    let uri = host_url.parse::<http::Uri>().ok()?;
    let host = uri.authority()?.as_str().to_string();
    let request_line = format!("GET {} HTTP/1.1", uri.path());
    let canonical = format!("host: {host}\ndate: {date}\n{request_line}");

    let mut mac = Hmac::<Sha256>::new_from_slice(api_secret.as_bytes()).ok()?;
    mac.update(canonical.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let authorization = format!(
        "hmac username=\"{api_key}\", algorithm=\"hmac-sha256\", headers=\"host date request-line\", signature=\"{signature}\""
    );
    let query = serde_urlencoded::to_string(vec![
        ("authorization", STANDARD.encode(authorization)),
        ("date", date.to_string()),
        ("host", host),
    ])
    .ok()?;
    Some(format!("{host_url}?{query}"))
}

fn http_date_now() -> String {
    httpdate::fmt_http_date(SystemTime::now())
}

async fn next_frame<S>(read: &mut S, cancel: &CancellationToken) -> Result<SparkFrame, CanonicalError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            message = read.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str()).map_err(|err| {
                    CanonicalError::wrap(err.to_string(), "unmarshal_response_body_failed", 500)
                });
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(CanonicalError::wrap(
                    "xunfei closed the connection before the final frame",
                    "http_request_failed",
                    500,
                ));
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(ws_failure(err)),
        }
    }
}

async fn emit(tx: &mpsc::Sender<Bytes>, chunk: &CreateChatCompletionStreamResponse) -> bool {
    let Ok(json) = serde_json::to_string(chunk) else {
        return true;
    };
    tx.send(Bytes::from(format!("{}\n", data_line(&json))))
        .await
        .is_ok()
}

fn ws_failure(err: WsError) -> CanonicalError {
    CanonicalError::wrap(err.to_string(), "http_request_failed", 500)
}

fn cancelled() -> CanonicalError {
    CanonicalError::wrap("request cancelled", "http_request_failed", 500)
}
