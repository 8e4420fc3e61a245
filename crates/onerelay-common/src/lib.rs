use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("invalid global config field {field}: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > seed file > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Stored as a hash (not plaintext). `None` disables admin endpoints.
    pub admin_key_hash: Option<String>,
    /// Default outbound proxy, used when a channel has none of its own.
    pub proxy: Option<String>,
    /// Overall upstream request timeout in seconds. `0` means no timeout.
    pub relay_timeout_secs: u64,
}

impl GlobalConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_key_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_timeout_secs: Option<u64>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.admin_key_hash.is_some() {
            self.admin_key_hash = other.admin_key_hash;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.relay_timeout_secs.is_some() {
            self.relay_timeout_secs = other.relay_timeout_secs;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let host = self.host.unwrap_or_else(|| "0.0.0.0".to_string());
        if host.trim().is_empty() {
            return Err(GlobalConfigError::MissingField("host"));
        }
        let proxy = self
            .proxy
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Ok(GlobalConfig {
            host,
            port: self.port.unwrap_or(3000),
            admin_key_hash: self.admin_key_hash,
            proxy,
            relay_timeout_secs: self.relay_timeout_secs.unwrap_or(0),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_key_hash: value.admin_key_hash,
            proxy: value.proxy,
            relay_timeout_secs: Some(value.relay_timeout_secs),
        }
    }
}
