use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::Response;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use onerelay_protocol::openai::CanonicalError;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::{CoreState, hash_admin_key};
use crate::relay::{InboundRequest, RelayBody, RelayMode};

pub const REQUEST_ID_HEADER: &str = "x-onerelay-request-id";

pub async fn completions_handler(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    relay_handler(state, RelayMode::Completions, headers, uri, body).await
}

pub async fn chat_completions_handler(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    relay_handler(state, RelayMode::ChatCompletions, headers, uri, body).await
}

pub async fn images_handler(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    relay_handler(state, RelayMode::ImagesGenerations, headers, uri, body).await
}

async fn relay_handler(
    state: Arc<CoreState>,
    mode: RelayMode,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let trace_id = Uuid::now_v7().to_string();
    let caller = match state.auth.authenticate(&headers) {
        Ok(caller) => caller,
        Err(err) => return error_response(&err, &trace_id),
    };
    let started_at = Instant::now();
    info!(
        event = "downstream_received",
        trace_id = %trace_id,
        op = mode.as_str(),
        user_id = caller.user_id,
        token_id = caller.token_id,
        group = %caller.group
    );

    // Dropping this future (caller hung up) cancels the relay and any quota
    // reservation refunds itself. Once a response exists the stream task owns
    // the lifetime instead.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let inbound = InboundRequest {
        trace_id: trace_id.clone(),
        query: uri.query().map(str::to_string),
        body,
        caller,
        cancel,
    };
    let result = state.engine.relay(mode, inbound).await;
    guard.disarm();

    match result {
        Ok(relayed) => {
            info!(
                event = "downstream_responded",
                trace_id = %trace_id,
                op = mode.as_str(),
                status = 200,
                elapsed_ms = started_at.elapsed().as_millis(),
                is_stream = matches!(relayed.body, RelayBody::Stream(_))
            );
            relay_response(relayed.body, &trace_id)
        }
        Err(err) => {
            warn!(
                event = "downstream_responded",
                trace_id = %trace_id,
                op = mode.as_str(),
                status = err.status,
                message = %err.error.message,
                elapsed_ms = started_at.elapsed().as_millis()
            );
            error_response(&err, &trace_id)
        }
    }
}

pub async fn balance_handler(
    State(state): State<Arc<CoreState>>,
    Path(channel_id): Path<i64>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let trace_id = Uuid::now_v7().to_string();
    if let Err(err) = check_admin(&state, &headers, &uri) {
        return error_response(&err, &trace_id);
    }
    match state.engine.refresh_balance(channel_id, &trace_id).await {
        Ok(balance) => {
            let body = serde_json::json!({
                "success": true,
                "message": "",
                "balance": balance,
            });
            let mut resp = Response::new(Body::from(body.to_string()));
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            with_request_id(resp, &trace_id)
        }
        Err(err) => {
            warn!(
                event = "balance_refresh_failed",
                trace_id = %trace_id,
                channel_id,
                status = err.status,
                message = %err.error.message
            );
            error_response(&err, &trace_id)
        }
    }
}

fn check_admin(state: &CoreState, headers: &HeaderMap, uri: &Uri) -> Result<(), CanonicalError> {
    let Some(expected) = state.admin_key_hash.as_deref() else {
        return Err(CanonicalError::abort(403, "admin api disabled"));
    };
    let key = extract_admin_key(headers, uri)
        .ok_or_else(|| CanonicalError::abort(401, "missing admin key"))?;
    if hash_admin_key(&key) != expected {
        return Err(CanonicalError::abort(401, "invalid admin key"));
    }
    Ok(())
}

fn extract_admin_key(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    if let Some(value) = headers.get("x-admin-key")
        && let Ok(s) = value.to_str()
    {
        let s = s.trim();
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }

    if let Some(value) = headers.get(AUTHORIZATION)
        && let Ok(auth) = value.to_str()
    {
        let auth = auth.trim();
        let prefix = "Bearer ";
        if auth.len() > prefix.len() && auth[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = auth[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    let query = uri.query()?;
    let parsed: std::collections::HashMap<String, String> =
        serde_urlencoded::from_str(query).ok()?;
    let key = parsed.get("admin_key")?.trim();
    if key.is_empty() {
        return None;
    }
    Some(key.to_string())
}

fn relay_response(body: RelayBody, trace_id: &str) -> Response {
    let resp = match body {
        RelayBody::Json(bytes) => {
            let mut resp = Response::new(Body::from(bytes));
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        RelayBody::Stream(frames) => {
            let stream = ReceiverStream::new(frames).map(Ok::<Bytes, Infallible>);
            let mut resp = Response::new(Body::from_stream(stream));
            let headers = resp.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
            headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
            resp
        }
    };
    with_request_id(resp, trace_id)
}

fn error_response(err: &CanonicalError, trace_id: &str) -> Response {
    let mut resp = Response::new(Body::from(err.to_body()));
    *resp.status_mut() =
        StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    with_request_id(resp, trace_id)
}

fn with_request_id(mut resp: Response, trace_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    resp
}
