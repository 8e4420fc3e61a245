use std::path::Path;

use anyhow::Context;
use onerelay_common::GlobalConfigPatch;
use onerelay_core::{
    AuthSnapshot, MemoryQuotaLedger, Pricing, TokenAccount, TokenEntry, UserAccount, UserEntry,
    hash_admin_key,
};
use onerelay_provider_core::Channel;
use serde::Deserialize;

/// Initial in-memory state read from a JSON file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Seed {
    pub(crate) config: GlobalConfigPatch,
    /// Plaintext admin key; hashed before it reaches the config.
    pub(crate) admin_key: Option<String>,
    pub(crate) channels: Vec<Channel>,
    pub(crate) users: Vec<SeedUser>,
    pub(crate) tokens: Vec<SeedToken>,
    pub(crate) pricing: Pricing,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SeedUser {
    pub(crate) id: i64,
    #[serde(default = "default_group")]
    pub(crate) group: String,
    #[serde(default = "default_true")]
    pub(crate) enabled: bool,
    #[serde(default)]
    pub(crate) quota: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SeedToken {
    pub(crate) id: i64,
    pub(crate) user_id: i64,
    pub(crate) key: String,
    #[serde(default)]
    pub(crate) name: String,
    #[serde(default = "default_true")]
    pub(crate) enabled: bool,
    #[serde(default)]
    pub(crate) specific_channel_id: Option<i64>,
    #[serde(default)]
    pub(crate) remain_quota: i64,
    #[serde(default)]
    pub(crate) unlimited_quota: bool,
}

fn default_group() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

impl Seed {
    pub(crate) fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read seed file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parse seed file {}", path.display()))
    }

    pub(crate) fn parse(text: &str) -> anyhow::Result<Self> {
        let seed: Seed = serde_json::from_str(text)?;
        for channel in &seed.channels {
            channel
                .model_mapping()
                .with_context(|| format!("channel {} has an invalid model mapping", channel.id))?;
        }
        Ok(seed)
    }

    /// Seed layer of the config merge.
    pub(crate) fn config_patch(&self) -> GlobalConfigPatch {
        let mut patch = self.config.clone();
        if let Some(key) = self.admin_key.as_deref().map(str::trim)
            && !key.is_empty()
        {
            patch.admin_key_hash = Some(hash_admin_key(key));
        }
        patch
    }

    pub(crate) fn auth_snapshot(&self) -> AuthSnapshot {
        let users = self
            .users
            .iter()
            .map(|user| UserEntry {
                id: user.id,
                group: user.group.clone(),
                enabled: user.enabled,
            })
            .collect();
        let tokens = self
            .tokens
            .iter()
            .map(|token| TokenEntry {
                id: token.id,
                user_id: token.user_id,
                key: token.key.trim_start_matches("sk-").to_string(),
                name: token.name.clone(),
                enabled: token.enabled,
                specific_channel_id: token.specific_channel_id,
            })
            .collect();
        AuthSnapshot::from_entries(users, tokens)
    }

    pub(crate) fn ledger(&self) -> MemoryQuotaLedger {
        let users = self
            .users
            .iter()
            .map(|user| UserAccount {
                id: user.id,
                quota: user.quota,
                used_quota: 0,
                request_count: 0,
            })
            .collect();
        let tokens = self
            .tokens
            .iter()
            .map(|token| TokenAccount {
                id: token.id,
                user_id: token.user_id,
                remain_quota: token.remain_quota,
                unlimited_quota: token.unlimited_quota,
                used_quota: 0,
            })
            .collect();
        MemoryQuotaLedger::new(users, tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onerelay_provider_core::ChannelKind;

    const SEED: &str = r#"{
        "config": {"port": 4000},
        "admin_key": "root",
        "channels": [
            {"id": 1, "type": "azure", "key": "k", "base_url": "https://x.openai.azure.com",
             "other": "2024-02-01", "models": ["gpt-35-turbo"],
             "model_mapping": "{\"gpt-3.5-turbo\":\"gpt-35-turbo\"}"}
        ],
        "users": [{"id": 1, "quota": 5000}],
        "tokens": [{"id": 1, "user_id": 1, "key": "sk-abc", "unlimited_quota": true}],
        "pricing": {"model_ratio": {"gpt-35-turbo": 0.75}}
    }"#;

    #[test]
    fn parses_every_section() {
        let seed = Seed::parse(SEED).unwrap();
        assert_eq!(seed.channels[0].kind, ChannelKind::Azure);
        assert_eq!(seed.channels[0].groups, vec!["default".to_string()]);
        assert_eq!(seed.pricing.model_ratio("gpt-35-turbo"), 0.75);
        assert_eq!(seed.pricing.pre_consumed_tokens, 500);

        let patch = seed.config_patch();
        assert_eq!(patch.port, Some(4000));
        assert_eq!(patch.admin_key_hash, Some(hash_admin_key("root")));

        let snapshot = seed.auth_snapshot();
        assert!(snapshot.tokens_by_key.contains_key("abc"));
        assert_eq!(seed.ledger().user(1).unwrap().quota, 5000);
    }

    #[test]
    fn broken_mapping_fails_early() {
        let text = r#"{"channels":[{"id":1,"type":"openai","model_mapping":"{oops"}]}"#;
        assert!(Seed::parse(text).is_err());
    }
}
