//! Built-in upstream adapters.
//!
//! Every adapter is created per request from a [`Channel`] and a [`RelayCtx`];
//! [`register_builtin_providers`] wires them into a
//! [`ProviderRegistry`](onerelay_provider_core::ProviderRegistry) by channel kind.
//!
//! [`Channel`]: onerelay_provider_core::Channel
//! [`RelayCtx`]: onerelay_provider_core::RelayCtx

mod auth_extractor;
pub mod providers;
mod registry;

pub use providers::openai::OpenAIProvider;
pub use providers::xunfei::XunfeiProvider;
pub use registry::{builtin_registry, register_builtin_providers};
