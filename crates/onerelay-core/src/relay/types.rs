use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::CallerCtx;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayMode {
    Completions,
    ChatCompletions,
    ImagesGenerations,
}

impl RelayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayMode::Completions => "completions",
            RelayMode::ChatCompletions => "chat_completions",
            RelayMode::ImagesGenerations => "images_generations",
        }
    }
}

/// One authenticated call as it reaches the orchestrator.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub trace_id: String,
    pub query: Option<String>,
    pub body: Bytes,
    pub caller: CallerCtx,
    /// Cancelled when the caller's request goes away.
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub enum RelayBody {
    Json(Bytes),
    /// Encoded event-stream frames, ready to write.
    Stream(mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct Relayed {
    pub body: RelayBody,
    /// Finishes once usage is settled. For streams this covers the whole relay.
    pub accounting: JoinHandle<()>,
}
