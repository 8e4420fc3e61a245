use std::error::Error;
use std::fmt;

use onerelay_protocol::openai::CanonicalError;

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Failures raised while an adapter builds its upstream request.
#[derive(Debug, Clone)]
pub enum ProviderError {
    Unsupported(&'static str),
    InvalidConfig(String),
    MissingCredentialField(&'static str),
    Other(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Unsupported(what) => write!(f, "unsupported: {what}"),
            ProviderError::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            ProviderError::MissingCredentialField(field) => {
                write!(f, "missing credential field: {field}")
            }
            ProviderError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl Error for ProviderError {}

impl From<ProviderError> for CanonicalError {
    fn from(err: ProviderError) -> Self {
        match &err {
            ProviderError::Unsupported(_) => {
                CanonicalError::wrap(err.to_string(), "channel_not_implemented", 501)
            }
            ProviderError::InvalidConfig(_) | ProviderError::MissingCredentialField(_) => {
                CanonicalError::wrap(err.to_string(), "invalid_channel_config", 500)
            }
            ProviderError::Other(_) => {
                CanonicalError::wrap(err.to_string(), "provider_error", 500)
            }
        }
    }
}
