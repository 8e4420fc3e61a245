use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Ratio charged for models missing from the table.
pub const UNKNOWN_MODEL_RATIO: f64 = 30.0;
pub const DEFAULT_PRE_CONSUMED_TOKENS: i64 = 500;

/// Price multipliers. Quota units are `tokens * model_ratio * group_ratio`,
/// with completion tokens additionally scaled by the completion ratio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    pub model_ratio: HashMap<String, f64>,
    pub completion_ratio: HashMap<String, f64>,
    pub group_ratio: HashMap<String, f64>,
    /// Completion allowance added to the prompt when pre-consuming.
    pub pre_consumed_tokens: i64,
}

impl Default for Pricing {
    fn default() -> Self {
        let model_ratio = [
            ("gpt-3.5-turbo", 0.75),
            ("gpt-3.5-turbo-instruct", 0.75),
            ("gpt-4", 15.0),
            ("gpt-4-turbo", 5.0),
            ("gpt-4o", 2.5),
            ("gpt-4o-mini", 0.075),
            ("text-davinci-003", 10.0),
            ("dall-e-2", 8.0),
            ("dall-e-3", 20.0),
            ("SparkDesk", 1.2858),
        ];
        let completion_ratio = [
            ("gpt-3.5-turbo", 1.333),
            ("gpt-3.5-turbo-instruct", 1.333),
            ("gpt-4", 2.0),
            ("gpt-4-turbo", 3.0),
            ("gpt-4o", 4.0),
            ("gpt-4o-mini", 4.0),
        ];
        Self {
            model_ratio: to_table(&model_ratio),
            completion_ratio: to_table(&completion_ratio),
            group_ratio: to_table(&[("default", 1.0), ("vip", 1.0), ("svip", 1.0)]),
            pre_consumed_tokens: DEFAULT_PRE_CONSUMED_TOKENS,
        }
    }
}

fn to_table(entries: &[(&str, f64)]) -> HashMap<String, f64> {
    entries
        .iter()
        .map(|(name, ratio)| (name.to_string(), *ratio))
        .collect()
}

impl Pricing {
    pub fn model_ratio(&self, model: &str) -> f64 {
        match self.model_ratio.get(model) {
            Some(ratio) => *ratio,
            None => {
                warn!(event = "model_ratio_missing", model = %model, fallback = UNKNOWN_MODEL_RATIO);
                UNKNOWN_MODEL_RATIO
            }
        }
    }

    pub fn completion_ratio(&self, model: &str) -> f64 {
        self.completion_ratio.get(model).copied().unwrap_or(1.0)
    }

    pub fn group_ratio(&self, group: &str) -> f64 {
        self.group_ratio.get(group).copied().unwrap_or(1.0)
    }

    /// Combined ratio applied to every token of a request.
    pub fn ratio(&self, model: &str, group: &str) -> f64 {
        self.model_ratio(model) * self.group_ratio(group)
    }

    /// Amount reserved before the upstream call.
    pub fn pre_consumed_quota(&self, prompt_tokens: i64, ratio: f64) -> i64 {
        ((prompt_tokens + self.pre_consumed_tokens) as f64 * ratio) as i64
    }

    /// Final charge for a finished request.
    pub fn final_quota(&self, model: &str, ratio: f64, prompt: i64, completion: i64) -> i64 {
        if prompt + completion == 0 {
            return 0;
        }
        let weighted = prompt as f64 + completion as f64 * self.completion_ratio(model);
        let quota = (weighted * ratio).ceil() as i64;
        if ratio != 0.0 && quota <= 0 { 1 } else { quota }
    }
}
