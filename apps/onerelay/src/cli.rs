use std::path::PathBuf;

use clap::Parser;
use onerelay_common::GlobalConfigPatch;
use onerelay_core::hash_admin_key;

#[derive(Debug, Clone, Parser)]
#[command(name = "onerelay", version, about = "OpenAI-compatible relay gateway")]
pub(crate) struct Cli {
    /// Bind host.
    #[arg(long, env = "ONERELAY_HOST")]
    pub(crate) host: Option<String>,

    /// Bind port.
    #[arg(long, env = "ONERELAY_PORT")]
    pub(crate) port: Option<u16>,

    /// Default outbound proxy for channels without one (http, https, socks5).
    #[arg(long, env = "ONERELAY_PROXY")]
    pub(crate) proxy: Option<String>,

    /// Overall upstream timeout in seconds; 0 disables it.
    #[arg(long, env = "ONERELAY_RELAY_TIMEOUT")]
    pub(crate) relay_timeout: Option<u64>,

    /// Admin key (plaintext). Only its hash is kept.
    #[arg(long, env = "ONERELAY_ADMIN_KEY")]
    pub(crate) admin_key: Option<String>,

    /// JSON seed file with channels, users, tokens, pricing and config.
    #[arg(long, env = "ONERELAY_SEED")]
    pub(crate) seed: Option<PathBuf>,
}

impl Cli {
    pub(crate) fn patch(&self) -> GlobalConfigPatch {
        GlobalConfigPatch {
            host: sanitize(self.host.clone()),
            port: self.port,
            admin_key_hash: sanitize(self.admin_key.clone()).map(|key| hash_admin_key(&key)),
            proxy: sanitize(self.proxy.clone()),
            relay_timeout_secs: self.relay_timeout,
        }
    }
}

fn sanitize(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_become_a_patch_with_hashed_key() {
        let cli = Cli::parse_from([
            "onerelay",
            "--port",
            "8080",
            "--admin-key",
            "root",
            "--proxy",
            " ",
        ]);
        let patch = cli.patch();
        assert_eq!(patch.port, Some(8080));
        assert_eq!(patch.proxy, None);
        assert_eq!(patch.admin_key_hash, Some(hash_admin_key("root")));
        assert_eq!(patch.host, None);
    }
}
