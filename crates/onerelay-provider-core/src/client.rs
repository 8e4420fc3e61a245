use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use http::Method;
use onerelay_protocol::openai::CanonicalError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use wreq::{Client, Proxy};

use crate::error_normalizer::normalize_error;
use crate::headers::Headers;

pub type ByteStream = mpsc::Receiver<Bytes>;

const STREAM_BUFFER: usize = 16;

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

impl UpstreamHttpRequest {
    pub fn post(url: impl Into<String>, headers: Headers, body: Bytes, is_stream: bool) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers,
            body: Some(body),
            is_stream,
        }
    }

    pub fn get(url: impl Into<String>, headers: Headers) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers,
            body: None,
            is_stream: false,
        }
    }
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

impl UpstreamHttpResponse {
    /// Buffered body; empty for streamed responses.
    pub fn into_bytes(self) -> Bytes {
        match self.body {
            UpstreamBody::Bytes(bytes) => bytes,
            UpstreamBody::Stream(_) => Bytes::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Other,
}

impl TransportErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            TransportErrorKind::Timeout => "http_request_timeout",
            TransportErrorKind::Connect => "http_connect_failed",
            TransportErrorKind::Other => "http_request_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    /// No HTTP response (connect, timeout, body read).
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    /// Non-2xx response, body already buffered.
    Http { status: u16, body: Bytes },
}

impl From<UpstreamFailure> for CanonicalError {
    fn from(failure: UpstreamFailure) -> Self {
        match failure {
            UpstreamFailure::Transport { kind, message } => {
                CanonicalError::wrap(message, kind.code(), 500)
            }
            UpstreamFailure::Http { status, body } => normalize_error(status, &body),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientPoolConfig {
    /// Used when a channel has no proxy of its own.
    pub default_proxy: Option<String>,
    pub connect_timeout: Duration,
    /// Overall request timeout; `None` disables it.
    pub request_timeout: Option<Duration>,
    /// Longest gap tolerated between two streamed chunks.
    pub stream_idle_timeout: Duration,
}

impl Default for ClientPoolConfig {
    fn default() -> Self {
        Self {
            default_proxy: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
            stream_idle_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    proxy: Option<String>,
    timeout: Option<Duration>,
}

/// Immutable transport handles keyed by `(proxy, timeout)`.
///
/// A handle is never reconfigured after it is built, so two in-flight
/// requests sharing one can never observe each other's settings. Dropping the
/// returned clone is the release.
pub struct HttpClientPool {
    config: ClientPoolConfig,
    clients: Mutex<HashMap<ClientKey, Client>>,
}

impl HttpClientPool {
    pub fn new(config: ClientPoolConfig) -> Self {
        Self {
            config: ClientPoolConfig {
                default_proxy: normalize_proxy(config.default_proxy.clone()),
                ..config
            },
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ClientPoolConfig {
        &self.config
    }

    /// Returns a client for `proxy` (falling back to the pool default).
    ///
    /// A proxy that is malformed or uses an unsupported scheme is logged and
    /// ignored; the caller still gets a working direct client.
    pub fn acquire(&self, proxy: Option<&str>) -> Result<Client, UpstreamFailure> {
        let requested = normalize_proxy(proxy.map(str::to_string))
            .or_else(|| self.config.default_proxy.clone());
        let key = ClientKey {
            proxy: requested.and_then(|value| checked_proxy(&value)),
            timeout: self.config.request_timeout,
        };

        let mut guard = self.clients.lock().map_err(|_| UpstreamFailure::Transport {
            kind: TransportErrorKind::Other,
            message: "http client pool lock failed".to_string(),
        })?;
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, key.proxy.as_deref()).map_err(map_wreq_error)?;
        guard.insert(key, client.clone());
        Ok(client)
    }

    pub fn cached_len(&self) -> usize {
        self.clients.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    /// Sends `req` through the client for `proxy`.
    ///
    /// Non-2xx responses come back as [`UpstreamFailure::Http`]. Streamed
    /// bodies are forwarded chunk by chunk until the upstream closes, the idle
    /// timeout elapses, or `cancel` fires.
    pub async fn send(
        &self,
        proxy: Option<&str>,
        req: UpstreamHttpRequest,
        cancel: &CancellationToken,
    ) -> Result<UpstreamHttpResponse, UpstreamFailure> {
        let client = self.acquire(proxy)?;
        let mut builder = client.request(req.method, &req.url);
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let resp = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(UpstreamFailure::Transport {
                    kind: TransportErrorKind::Other,
                    message: "request cancelled".to_string(),
                });
            }
            resp = builder.send() => resp.map_err(map_wreq_error)?,
        };
        convert_response(
            resp,
            req.is_stream,
            self.config.stream_idle_timeout,
            cancel.clone(),
        )
        .await
    }
}

fn normalize_proxy(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn checked_proxy(raw: &str) -> Option<String> {
    let uri = match raw.parse::<http::Uri>() {
        Ok(uri) => uri,
        Err(err) => {
            warn!(event = "proxy_ignored", proxy = %raw, error = %err, "malformed proxy url");
            return None;
        }
    };
    match uri.scheme_str() {
        Some("http" | "https" | "socks5" | "socks5h") if uri.host().is_some() => {
            Some(raw.to_string())
        }
        scheme => {
            warn!(
                event = "proxy_ignored",
                proxy = %raw,
                scheme = scheme.unwrap_or(""),
                "unsupported proxy scheme"
            );
            None
        }
    }
}

fn build_client(config: &ClientPoolConfig, proxy: Option<&str>) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder().connect_timeout(config.connect_timeout);
    if let Some(timeout) = config.request_timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(proxy_url) = proxy {
        match Proxy::all(proxy_url) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(err) => {
                warn!(event = "proxy_ignored", proxy = %proxy_url, error = %err);
            }
        }
    }
    builder.build()
}

async fn convert_response(
    resp: wreq::Response,
    want_stream: bool,
    stream_idle_timeout: Duration,
    cancel: CancellationToken,
) -> Result<UpstreamHttpResponse, UpstreamFailure> {
    let status = resp.status().as_u16();
    let headers = headers_from_wreq(resp.headers());

    if !(200..300).contains(&status) {
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        return Err(UpstreamFailure::Http { status, body });
    }
    if !want_stream {
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        return Ok(UpstreamHttpResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_BUFFER);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = tokio::time::timeout(stream_idle_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(err))) => {
                    warn!(event = "upstream_stream_error", error = %err);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(event = "upstream_stream_idle_timeout");
                    break;
                }
            };
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });

    Ok(UpstreamHttpResponse {
        status,
        headers,
        body: UpstreamBody::Stream(rx),
    })
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    map.iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|value| (k.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn map_wreq_error(err: wreq::Error) -> UpstreamFailure {
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else {
        TransportErrorKind::Other
    };
    UpstreamFailure::Transport {
        kind,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_schemes() {
        assert_eq!(
            checked_proxy("socks5://127.0.0.1:1080").as_deref(),
            Some("socks5://127.0.0.1:1080")
        );
        assert_eq!(
            checked_proxy("http://proxy.local:8080").as_deref(),
            Some("http://proxy.local:8080")
        );
        assert_eq!(checked_proxy("ftp://proxy.local:21"), None);
        assert_eq!(checked_proxy("not a url"), None);
    }

    #[test]
    fn clients_are_shared_per_key() {
        let pool = HttpClientPool::new(ClientPoolConfig::default());
        pool.acquire(None).unwrap();
        pool.acquire(Some("  ")).unwrap();
        // Unsupported schemes collapse onto the direct client.
        pool.acquire(Some("ftp://proxy.local:21")).unwrap();
        assert_eq!(pool.cached_len(), 1);
        pool.acquire(Some("http://proxy.local:8080")).unwrap();
        assert_eq!(pool.cached_len(), 2);
    }

    #[test]
    fn transport_failure_is_internal_error() {
        let err: CanonicalError = UpstreamFailure::Transport {
            kind: TransportErrorKind::Connect,
            message: "connection refused".to_string(),
        }
        .into();
        assert_eq!(err.status, 500);
        assert_eq!(err.code_str(), Some("http_connect_failed"));

        let err: CanonicalError = UpstreamFailure::Transport {
            kind: TransportErrorKind::Timeout,
            message: "deadline elapsed".to_string(),
        }
        .into();
        assert_eq!(err.status, 500);
        assert_eq!(err.code_str(), Some("http_request_timeout"));
    }
}
