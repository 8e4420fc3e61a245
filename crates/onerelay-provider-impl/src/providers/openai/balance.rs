use onerelay_protocol::openai::CanonicalError;
use onerelay_protocol::openai::billing::{
    CreditGrantsResponse, SubscriptionResponse, UsageResponse,
};
use onerelay_provider_core::{Provider, ProviderError, UpstreamHttpRequest};
use serde::de::DeserializeOwned;
use time::{Date, Duration, OffsetDateTime};
use tracing::info;

use super::OpenAIProvider;
use crate::auth_extractor;

const USAGE_WINDOW_DAYS: i64 = 100;

/// Billing API used to read a channel's remaining credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceEndpoint {
    None,
    /// `/v1/dashboard/billing/subscription` minus `/v1/dashboard/billing/usage`.
    Subscription,
    /// `/dashboard/billing/credit_grants`.
    CreditGrants,
}

pub(super) async fn query(provider: &OpenAIProvider) -> Result<f64, CanonicalError> {
    let balance = match provider.balance {
        BalanceEndpoint::None => return Err(ProviderError::Unsupported("balance query").into()),
        BalanceEndpoint::Subscription => subscription_balance(provider).await?,
        BalanceEndpoint::CreditGrants => {
            let grants: CreditGrantsResponse =
                get_json(provider, "/dashboard/billing/credit_grants".to_string()).await?;
            grants.total_available
        }
    };
    info!(
        event = "channel_balance",
        trace_id = %provider.ctx.trace_id,
        channel_id = provider.channel.id,
        balance = balance
    );
    Ok(balance)
}

async fn subscription_balance(provider: &OpenAIProvider) -> Result<f64, CanonicalError> {
    let subscription: SubscriptionResponse =
        get_json(provider, "/v1/dashboard/billing/subscription".to_string()).await?;
    let (start_date, end_date) = usage_window(OffsetDateTime::now_utc());
    let usage: UsageResponse = get_json(
        provider,
        format!("/v1/dashboard/billing/usage?start_date={start_date}&end_date={end_date}"),
    )
    .await?;
    // total_usage is reported in cents.
    Ok(subscription.hard_limit_usd - usage.total_usage / 100.0)
}

fn usage_window(now: OffsetDateTime) -> (String, String) {
    let start = now - Duration::days(USAGE_WINDOW_DAYS);
    (format_date(start.date()), format_date(now.date()))
}

fn format_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

async fn get_json<T: DeserializeOwned>(
    provider: &OpenAIProvider,
    path: String,
) -> Result<T, CanonicalError> {
    let url = format!("{}{}", provider.base_url, path);
    let mut headers = provider.build_headers();
    auth_extractor::set_accept(&mut headers, false);
    let resp = provider
        .ctx
        .clients
        .send(
            provider.channel.proxy.as_deref(),
            UpstreamHttpRequest::get(url, headers),
            &provider.ctx.cancel,
        )
        .await?;
    serde_json::from_slice(&resp.into_bytes())
        .map_err(|err| CanonicalError::wrap(err.to_string(), "unmarshal_response_body_failed", 500))
}
