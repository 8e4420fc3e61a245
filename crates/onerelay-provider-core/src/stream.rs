//! Event-stream relay: one reader task decoding upstream frames, one writer
//! loop forwarding them to the caller.

use std::marker::PhantomData;

use bytes::Bytes;
use onerelay_protocol::openai::Usage;
use onerelay_protocol::sse::{Frame, LineScanner, classify_line, encode_line};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::client::ByteStream;

/// Decodes one event payload into an incremental text fragment.
pub trait StreamHandler: Send {
    fn handle(&mut self, payload: &str) -> Result<String, serde_json::Error>;

    /// Usage reported inside the stream, if the upstream sends one.
    fn usage(&self) -> Option<Usage> {
        None
    }
}

/// Handler that decodes every payload as `T`.
pub struct JsonStreamHandler<T> {
    text_of: fn(&T) -> String,
    usage_of: fn(&T) -> Option<Usage>,
    usage: Option<Usage>,
    _event: PhantomData<fn() -> T>,
}

impl<T> JsonStreamHandler<T> {
    pub fn new(text_of: fn(&T) -> String) -> Self {
        Self {
            text_of,
            usage_of: |_| None,
            usage: None,
            _event: PhantomData,
        }
    }

    pub fn with_usage(mut self, usage_of: fn(&T) -> Option<Usage>) -> Self {
        self.usage_of = usage_of;
        self
    }
}

impl<T: DeserializeOwned> StreamHandler for JsonStreamHandler<T> {
    fn handle(&mut self, payload: &str) -> Result<String, serde_json::Error> {
        let event: T = serde_json::from_str(payload)?;
        if let Some(usage) = (self.usage_of)(&event) {
            self.usage = Some(usage);
        }
        Ok((self.text_of)(&event))
    }

    fn usage(&self) -> Option<Usage> {
        self.usage
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOutcome {
    /// Concatenated text fragments of every decoded event.
    pub text: String,
    pub usage: Option<Usage>,
    /// Frames written to the caller.
    pub forwarded: usize,
    /// The caller stopped reading before the upstream finished.
    pub client_gone: bool,
}

/// An upstream stream that passed the status check and has not been relayed
/// yet.
pub struct PendingStream {
    upstream: ByteStream,
    handler: Box<dyn StreamHandler>,
    trace_id: String,
    cancel: CancellationToken,
}

impl PendingStream {
    /// `cancel` should be scoped to this relay: the writer cancels it when the
    /// caller goes away.
    pub fn new(
        upstream: ByteStream,
        handler: Box<dyn StreamHandler>,
        trace_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            upstream,
            handler,
            trace_id: trace_id.into(),
            cancel,
        }
    }

    /// Runs the reader and writer until the upstream ends, the caller goes
    /// away, or the relay token is cancelled.
    pub async fn relay(self, downstream: mpsc::Sender<Bytes>) -> StreamOutcome {
        let PendingStream {
            mut upstream,
            mut handler,
            trace_id,
            cancel,
        } = self;

        // Capacity 1 keeps the reader at most one frame ahead. Dropping the
        // sender is the end-of-stream signal.
        let (events_tx, mut events_rx) = mpsc::channel::<String>(1);
        let reader_cancel = cancel.clone();
        let reader_trace = trace_id.clone();
        let reader = tokio::spawn(async move {
            let mut scanner = LineScanner::new();
            let mut text = String::new();
            'read: loop {
                let chunk = tokio::select! {
                    _ = reader_cancel.cancelled() => break 'read,
                    chunk = upstream.recv() => chunk,
                };
                let ended = chunk.is_none();
                let lines = match chunk {
                    Some(chunk) => scanner.push_bytes(&chunk),
                    None => scanner.finish().into_iter().collect(),
                };
                for line in lines {
                    let forwarded = forward_line(
                        line,
                        &events_tx,
                        &reader_cancel,
                        handler.as_mut(),
                        &mut text,
                        &reader_trace,
                    )
                    .await;
                    if !forwarded {
                        break 'read;
                    }
                }
                if ended {
                    break;
                }
            }
            (text, handler)
        });

        let mut outcome = StreamOutcome::default();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = events_rx.recv() => line,
            };
            let Some(line) = line else {
                break;
            };
            let sent = tokio::select! {
                _ = cancel.cancelled() => false,
                res = downstream.send(encode_line(&line)) => res.is_ok(),
            };
            if !sent {
                outcome.client_gone = !cancel.is_cancelled();
                cancel.cancel();
                break;
            }
            outcome.forwarded += 1;
        }
        drop(events_rx);

        match reader.await {
            Ok((text, handler)) => {
                outcome.text = text;
                outcome.usage = handler.usage();
            }
            Err(err) => {
                warn!(event = "stream_reader_failed", trace_id = %trace_id, error = %err);
            }
        }
        outcome
    }
}

async fn forward_line(
    line: String,
    events: &mpsc::Sender<String>,
    cancel: &CancellationToken,
    handler: &mut dyn StreamHandler,
    text: &mut String,
    trace_id: &str,
) -> bool {
    let payload = match classify_line(&line) {
        None => return true,
        Some(Frame::Done) => None,
        Some(Frame::Data(payload)) => Some(payload.to_string()),
    };
    let sent = tokio::select! {
        _ = cancel.cancelled() => false,
        res = events.send(line) => res.is_ok(),
    };
    if !sent {
        return false;
    }
    if let Some(payload) = payload {
        match handler.handle(&payload) {
            Ok(fragment) => text.push_str(&fragment),
            Err(err) => {
                warn!(event = "stream_decode_failed", trace_id = %trace_id, error = %err);
            }
        }
    }
    true
}
