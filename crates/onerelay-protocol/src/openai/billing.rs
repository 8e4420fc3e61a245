//! Account endpoints used to refresh channel balances.

use serde::{Deserialize, Serialize};

/// `GET /dashboard/billing/credit_grants`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreditGrantsResponse {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub total_granted: f64,
    #[serde(default)]
    pub total_used: f64,
    #[serde(default)]
    pub total_available: f64,
}

/// `GET /v1/dashboard/billing/subscription`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub has_payment_method: bool,
    #[serde(default)]
    pub soft_limit_usd: f64,
    #[serde(default)]
    pub hard_limit_usd: f64,
    #[serde(default)]
    pub system_hard_limit_usd: f64,
    #[serde(default)]
    pub access_until: i64,
}

/// `GET /v1/dashboard/billing/usage`; `total_usage` is in cents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageResponse {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub total_usage: f64,
}
