use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    OpenAI,
    Azure,
    Api2d,
    Custom,
    Xunfei,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::OpenAI => "openai",
            ChannelKind::Azure => "azure",
            ChannelKind::Api2d => "api2d",
            ChannelKind::Custom => "custom",
            ChannelKind::Xunfei => "xunfei",
        }
    }
}

/// An upstream credential/endpoint record.
///
/// The relay only reads channels; the one write-back is the observed balance,
/// which goes through the channel store rather than this value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub name: String,
    /// Secret key. Some vendors pack several values joined by `|`.
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    /// Vendor specific extra value, e.g. the Azure API version.
    #[serde(default)]
    pub other: String,
    /// JSON object text mapping external model names to upstream names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_mapping: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub used_quota: i64,
}

fn default_groups() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_enabled() -> bool {
    true
}

impl Channel {
    pub fn new(id: i64, kind: ChannelKind, key: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            name: String::new(),
            key: key.into(),
            base_url: None,
            proxy: None,
            other: String::new(),
            model_mapping: None,
            models: Vec::new(),
            groups: default_groups(),
            priority: 0,
            enabled: true,
            balance: 0.0,
            used_quota: 0,
        }
    }

    /// Configured base URL without a trailing `/`, or `default` when unset.
    pub fn base_url_or(&self, default: &str) -> String {
        let base = self
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(default);
        base.trim_end_matches('/').to_string()
    }

    /// Parsed mapping table. Empty text and `{}` both mean "no mapping".
    pub fn model_mapping(&self) -> Result<Option<HashMap<String, String>>, serde_json::Error> {
        let text = match self.model_mapping.as_deref().map(str::trim) {
            None | Some("") | Some("{}") => return Ok(None),
            Some(text) => text,
        };
        let table: HashMap<String, String> = serde_json::from_str(text)?;
        if table.is_empty() {
            return Ok(None);
        }
        Ok(Some(table))
    }

    pub fn serves(&self, group: &str, model: &str) -> bool {
        self.groups.iter().any(|g| g == group) && self.models.iter().any(|m| m == model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mapping_texts_mean_none() {
        let mut channel = Channel::new(1, ChannelKind::OpenAI, "sk");
        assert!(channel.model_mapping().unwrap().is_none());
        channel.model_mapping = Some(" {} ".to_string());
        assert!(channel.model_mapping().unwrap().is_none());
        channel.model_mapping = Some(r#"{"gpt-4":"gpt-4-turbo"}"#.to_string());
        let table = channel.model_mapping().unwrap().unwrap();
        assert_eq!(table.get("gpt-4").map(String::as_str), Some("gpt-4-turbo"));
        channel.model_mapping = Some("not json".to_string());
        assert!(channel.model_mapping().is_err());
    }

    #[test]
    fn channel_decodes_with_defaults() {
        let channel: Channel =
            serde_json::from_str(r#"{"id":7,"type":"azure","key":"k","base_url":"https://x/"}"#)
                .unwrap();
        assert_eq!(channel.kind, ChannelKind::Azure);
        assert!(channel.enabled);
        assert_eq!(channel.groups, vec!["default"]);
        assert_eq!(channel.base_url_or("https://unused"), "https://x");
    }
}
