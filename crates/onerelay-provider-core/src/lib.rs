//! Provider abstractions for the relay.
//!
//! Adapters implement [`Provider`] plus whichever capability traits they
//! support; the orchestrator in `onerelay-core` checks capabilities before any
//! network call. Transport, error normalization and the event-stream pipeline
//! live here so every adapter shares them.

pub mod channel;
pub mod client;
pub mod error_normalizer;
pub mod errors;
pub mod headers;
pub mod provider;
pub mod registry;
pub mod stream;

pub use channel::{Channel, ChannelKind};
pub use client::{
    ByteStream, ClientPoolConfig, HttpClientPool, TransportErrorKind, UpstreamBody, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse,
};
pub use error_normalizer::normalize_error;
pub use errors::{ProviderError, ProviderResult};
pub use headers::{Headers, header_get, header_set};
pub use provider::{
    BalanceCapable, ChatCapable, CompletionCapable, ImageGenerationCapable, Provider, RelayCtx,
    RelayOutput, build_body,
};
pub use registry::{ProviderFactory, ProviderRegistry};
pub use stream::{JsonStreamHandler, PendingStream, StreamHandler, StreamOutcome};
