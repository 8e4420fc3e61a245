use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::HeaderMap;
use onerelay_protocol::openai::CanonicalError;
use serde::{Deserialize, Serialize};

/// Who is calling: resolved from the bearer token before any relay work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerCtx {
    pub user_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub group: String,
    /// Pins every request of this token to one channel.
    pub specific_channel_id: Option<i64>,
}

pub trait AuthProvider: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Result<CallerCtx, CanonicalError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_channel_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub id: i64,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_group() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Default)]
pub struct AuthSnapshot {
    pub tokens_by_key: HashMap<String, TokenEntry>,
    pub users_by_id: HashMap<i64, UserEntry>,
}

impl AuthSnapshot {
    pub fn from_entries(users: Vec<UserEntry>, tokens: Vec<TokenEntry>) -> Self {
        Self {
            tokens_by_key: tokens
                .into_iter()
                .map(|token| (token.key.clone(), token))
                .collect(),
            users_by_id: users.into_iter().map(|user| (user.id, user)).collect(),
        }
    }
}

#[derive(Debug)]
pub struct MemoryAuth {
    snapshot: ArcSwap<AuthSnapshot>,
}

impl MemoryAuth {
    pub fn new(snapshot: AuthSnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn replace_snapshot(&self, snapshot: AuthSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }
}

impl AuthProvider for MemoryAuth {
    fn authenticate(&self, headers: &HeaderMap) -> Result<CallerCtx, CanonicalError> {
        let api_key = extract_api_key(headers)
            .ok_or_else(|| CanonicalError::abort(401, "missing api key"))?;

        let snapshot = self.snapshot.load();
        let token = snapshot
            .tokens_by_key
            .get(api_key.as_str())
            .ok_or_else(|| CanonicalError::abort(401, "invalid api key"))?;
        if !token.enabled {
            return Err(CanonicalError::abort(403, "api key disabled"));
        }
        let user = snapshot
            .users_by_id
            .get(&token.user_id)
            .ok_or_else(|| CanonicalError::abort(401, "invalid api key"))?;
        if !user.enabled {
            return Err(CanonicalError::abort(403, "user disabled"));
        }

        Ok(CallerCtx {
            user_id: user.id,
            token_id: token.id,
            token_name: token.name.clone(),
            group: user.group.clone(),
            specific_channel_id: token.specific_channel_id,
        })
    }
}

/// `x-api-key`, else `Authorization: Bearer <key>`. A `sk-` prefix is
/// accepted and stripped.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    let raw = match header_value(headers, "x-api-key") {
        Some(value) => value,
        None => {
            let auth = header_value(headers, "authorization")?;
            let auth = auth.trim();
            auth.strip_prefix("Bearer ")
                .or_else(|| auth.strip_prefix("bearer "))?
                .to_string()
        }
    };
    let key = raw.trim();
    let key = key.strip_prefix("sk-").unwrap_or(key);
    if key.is_empty() {
        return None;
    }
    Some(key.to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}
