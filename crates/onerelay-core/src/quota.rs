use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use onerelay_protocol::openai::{CanonicalError, Usage};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::auth::CallerCtx;
use crate::channels::ChannelStore;
use crate::pricing::Pricing;

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("user {0} not found")]
    UserNotFound(i64),
    #[error("token {0} not found")]
    TokenNotFound(i64),
    #[error("token {token_id} quota is not enough: remaining {remaining}, need {need}")]
    InsufficientTokenQuota {
        token_id: i64,
        remaining: i64,
        need: i64,
    },
    #[error("quota ledger unavailable: {0}")]
    Unavailable(String),
}

/// One finished, billed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub user_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub channel_id: i64,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    pub trace_id: String,
}

/// Account store. Every mutation is an atomic increment or decrement on the
/// store side.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    async fn user_quota(&self, user_id: i64) -> Result<i64, QuotaError>;

    /// Reserves `quota` on the token and its user.
    async fn pre_consume_token_quota(&self, token_id: i64, quota: i64) -> Result<(), QuotaError>;

    /// Applies `delta` to the token and its user. Negative deltas give quota
    /// back.
    async fn post_consume_token_quota(&self, token_id: i64, delta: i64) -> Result<(), QuotaError>;

    /// Bumps used quota and request count of the user and stores the record.
    async fn record_consumption(&self, record: ConsumptionRecord) -> Result<(), QuotaError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: i64,
    pub quota: i64,
    #[serde(default)]
    pub used_quota: i64,
    #[serde(default)]
    pub request_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAccount {
    pub id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub remain_quota: i64,
    #[serde(default)]
    pub unlimited_quota: bool,
    #[serde(default)]
    pub used_quota: i64,
}

#[derive(Debug, Default)]
struct LedgerState {
    users: HashMap<i64, UserAccount>,
    tokens: HashMap<i64, TokenAccount>,
    records: Vec<ConsumptionRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryQuotaLedger {
    state: Mutex<LedgerState>,
}

impl MemoryQuotaLedger {
    pub fn new(users: Vec<UserAccount>, tokens: Vec<TokenAccount>) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                users: users.into_iter().map(|user| (user.id, user)).collect(),
                tokens: tokens.into_iter().map(|token| (token.id, token)).collect(),
                records: Vec::new(),
            }),
        }
    }

    pub fn user(&self, id: i64) -> Option<UserAccount> {
        self.lock().ok()?.users.get(&id).cloned()
    }

    pub fn token(&self, id: i64) -> Option<TokenAccount> {
        self.lock().ok()?.tokens.get(&id).cloned()
    }

    pub fn records(&self) -> Vec<ConsumptionRecord> {
        self.lock()
            .map(|state| state.records.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>, QuotaError> {
        self.state
            .lock()
            .map_err(|_| QuotaError::Unavailable("ledger lock poisoned".to_string()))
    }

    fn apply(&self, token_id: i64, amount: i64, check_remaining: bool) -> Result<(), QuotaError> {
        let mut state = self.lock()?;
        let state = &mut *state;
        let token = state
            .tokens
            .get_mut(&token_id)
            .ok_or(QuotaError::TokenNotFound(token_id))?;
        if check_remaining && !token.unlimited_quota && token.remain_quota < amount {
            return Err(QuotaError::InsufficientTokenQuota {
                token_id,
                remaining: token.remain_quota,
                need: amount,
            });
        }
        let user = state
            .users
            .get_mut(&token.user_id)
            .ok_or(QuotaError::UserNotFound(token.user_id))?;
        token.remain_quota -= amount;
        token.used_quota += amount;
        user.quota -= amount;
        Ok(())
    }
}

#[async_trait]
impl QuotaLedger for MemoryQuotaLedger {
    async fn user_quota(&self, user_id: i64) -> Result<i64, QuotaError> {
        let state = self.lock()?;
        state
            .users
            .get(&user_id)
            .map(|user| user.quota)
            .ok_or(QuotaError::UserNotFound(user_id))
    }

    async fn pre_consume_token_quota(&self, token_id: i64, quota: i64) -> Result<(), QuotaError> {
        self.apply(token_id, quota, true)
    }

    async fn post_consume_token_quota(&self, token_id: i64, delta: i64) -> Result<(), QuotaError> {
        self.apply(token_id, delta, false)
    }

    async fn record_consumption(&self, record: ConsumptionRecord) -> Result<(), QuotaError> {
        let mut state = self.lock()?;
        let user = state
            .users
            .get_mut(&record.user_id)
            .ok_or(QuotaError::UserNotFound(record.user_id))?;
        user.used_quota += record.quota;
        user.request_count += 1;
        state.records.push(record);
        Ok(())
    }
}

/// Reserves quota before a relay and hands out the matching [`QuotaInfo`].
#[derive(Clone)]
pub struct QuotaSettlement {
    ledger: Arc<dyn QuotaLedger>,
    channels: Arc<dyn ChannelStore>,
    pricing: Arc<Pricing>,
}

impl QuotaSettlement {
    pub fn new(
        ledger: Arc<dyn QuotaLedger>,
        channels: Arc<dyn ChannelStore>,
        pricing: Arc<Pricing>,
    ) -> Self {
        Self {
            ledger,
            channels,
            pricing,
        }
    }

    pub fn pricing(&self) -> &Pricing {
        &self.pricing
    }

    /// Pre-consumption step. Users holding more than 100x the estimate are
    /// not charged up front.
    pub async fn reserve(
        &self,
        caller: &CallerCtx,
        channel_id: i64,
        model: &str,
        prompt_tokens: i64,
        trace_id: &str,
    ) -> Result<QuotaInfo, CanonicalError> {
        let ratio = self.pricing.ratio(model, &caller.group);
        let mut pre_consumed_quota = self.pricing.pre_consumed_quota(prompt_tokens, ratio);

        let user_quota = self
            .ledger
            .user_quota(caller.user_id)
            .await
            .map_err(|err| CanonicalError::wrap(err.to_string(), "get_user_quota_failed", 500))?;
        if user_quota < pre_consumed_quota {
            return Err(CanonicalError::wrap(
                "user quota is not enough",
                "insufficient_user_quota",
                403,
            ));
        }
        if user_quota > 100 * pre_consumed_quota {
            pre_consumed_quota = 0;
        }

        let pre_consumed = pre_consumed_quota > 0;
        if pre_consumed {
            self.ledger
                .pre_consume_token_quota(caller.token_id, pre_consumed_quota)
                .await
                .map_err(|err| {
                    CanonicalError::wrap(err.to_string(), "pre_consume_token_quota_failed", 403)
                })?;
        }
        info!(
            event = "quota_reserved",
            trace_id = %trace_id,
            token_id = caller.token_id,
            model = %model,
            prompt_tokens,
            pre_consumed_quota,
            pre_consumed
        );

        Ok(QuotaInfo {
            prompt_tokens,
            pre_consumed_quota,
            pre_consumed,
            reservation: Some(Reservation {
                settlement: self.clone(),
                caller: caller.clone(),
                channel_id,
                model: model.to_string(),
                ratio,
                prompt_tokens,
                pre_consumed_quota,
                pre_consumed,
                trace_id: trace_id.to_string(),
            }),
        })
    }
}

/// Per-request reservation. Consumed by exactly one of [`QuotaInfo::refund`]
/// or [`QuotaInfo::settle`]; both run in the background and only log their
/// failures. Dropping it unconsumed (the relay future was cancelled) refunds.
pub struct QuotaInfo {
    prompt_tokens: i64,
    pre_consumed_quota: i64,
    pre_consumed: bool,
    reservation: Option<Reservation>,
}

impl QuotaInfo {
    pub fn prompt_tokens(&self) -> i64 {
        self.prompt_tokens
    }

    pub fn pre_consumed_quota(&self) -> i64 {
        self.pre_consumed_quota
    }

    pub fn pre_consumed(&self) -> bool {
        self.pre_consumed
    }

    /// Gives the reserved amount back. Nothing to do when pre-consumption was
    /// skipped.
    pub fn refund(mut self) -> JoinHandle<()> {
        let reservation = self.reservation.take();
        tokio::spawn(async move {
            if let Some(reservation) = reservation {
                reservation.refund().await;
            }
        })
    }

    /// Charges the real price for `usage` and posts the difference to the
    /// reservation.
    pub fn settle(mut self, usage: Usage) -> JoinHandle<()> {
        let reservation = self.reservation.take();
        tokio::spawn(async move {
            let Some(reservation) = reservation else {
                return;
            };
            if let Err(err) = reservation.finalize(usage).await {
                error!(
                    event = "quota_settle_failed",
                    trace_id = %reservation.trace_id,
                    token_id = reservation.caller.token_id,
                    error = %err
                );
            }
        })
    }
}

impl Drop for QuotaInfo {
    fn drop(&mut self) {
        let Some(reservation) = self.reservation.take() else {
            return;
        };
        warn!(
            event = "quota_reservation_dropped",
            trace_id = %reservation.trace_id,
            token_id = reservation.caller.token_id,
            quota = reservation.pre_consumed_quota
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(reservation.refund());
            }
            Err(_) => error!(
                event = "quota_refund_failed",
                trace_id = %reservation.trace_id,
                token_id = reservation.caller.token_id,
                error = "no runtime to refund a dropped reservation"
            ),
        }
    }
}

struct Reservation {
    settlement: QuotaSettlement,
    caller: CallerCtx,
    channel_id: i64,
    model: String,
    ratio: f64,
    prompt_tokens: i64,
    pre_consumed_quota: i64,
    pre_consumed: bool,
    trace_id: String,
}

impl Reservation {
    async fn refund(self) {
        if !self.pre_consumed {
            return;
        }
        let ledger = &self.settlement.ledger;
        match ledger
            .post_consume_token_quota(self.caller.token_id, -self.pre_consumed_quota)
            .await
        {
            Ok(()) => info!(
                event = "quota_refunded",
                trace_id = %self.trace_id,
                token_id = self.caller.token_id,
                quota = self.pre_consumed_quota
            ),
            Err(err) => error!(
                event = "quota_refund_failed",
                trace_id = %self.trace_id,
                token_id = self.caller.token_id,
                error = %err
            ),
        }
    }

    async fn finalize(&self, usage: Usage) -> Result<(), QuotaError> {
        let pricing = &self.settlement.pricing;
        let quota = pricing.final_quota(
            &self.model,
            self.ratio,
            usage.prompt_tokens,
            usage.completion_tokens,
        );
        let delta = quota - self.pre_consumed_quota;
        self.settlement
            .ledger
            .post_consume_token_quota(self.caller.token_id, delta)
            .await?;
        info!(
            event = "quota_settled",
            trace_id = %self.trace_id,
            token_id = self.caller.token_id,
            channel_id = self.channel_id,
            model = %self.model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            quota,
            delta
        );
        if quota == 0 {
            return Ok(());
        }

        self.settlement
            .ledger
            .record_consumption(ConsumptionRecord {
                user_id: self.caller.user_id,
                token_id: self.caller.token_id,
                token_name: self.caller.token_name.clone(),
                channel_id: self.channel_id,
                model: self.model.clone(),
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                quota,
                trace_id: self.trace_id.clone(),
            })
            .await?;
        if let Err(err) = self
            .settlement
            .channels
            .add_used_quota(self.channel_id, quota)
            .await
        {
            warn!(
                event = "channel_used_quota_failed",
                trace_id = %self.trace_id,
                channel_id = self.channel_id,
                error = %err
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MemoryChannelStore;
    use onerelay_provider_core::{Channel, ChannelKind};

    fn caller() -> CallerCtx {
        CallerCtx {
            user_id: 1,
            token_id: 10,
            token_name: "t".to_string(),
            group: "default".to_string(),
            specific_channel_id: None,
        }
    }

    fn setup(user_quota: i64, token_quota: i64) -> (Arc<MemoryQuotaLedger>, Arc<MemoryChannelStore>, QuotaSettlement) {
        let ledger = Arc::new(MemoryQuotaLedger::new(
            vec![UserAccount {
                id: 1,
                quota: user_quota,
                used_quota: 0,
                request_count: 0,
            }],
            vec![TokenAccount {
                id: 10,
                user_id: 1,
                remain_quota: token_quota,
                unlimited_quota: false,
                used_quota: 0,
            }],
        ));
        let channels = Arc::new(MemoryChannelStore::new([Channel::new(5, ChannelKind::OpenAI, "sk")]));
        let settlement = QuotaSettlement::new(ledger.clone(), channels.clone(), Arc::new(Pricing::default()));
        (ledger, channels, settlement)
    }

    #[tokio::test]
    async fn reserve_then_refund_restores_balances() {
        let (ledger, _, settlement) = setup(10_000, 10_000);
        // (100 + 500) * 15
        let info = settlement.reserve(&caller(), 5, "gpt-4", 100, "t1").await.unwrap();
        assert!(info.pre_consumed());
        assert_eq!(info.pre_consumed_quota(), 9_000);
        assert_eq!(ledger.user(1).unwrap().quota, 1_000);

        info.refund().await.unwrap();
        assert_eq!(ledger.user(1).unwrap().quota, 10_000);
        assert_eq!(ledger.token(10).unwrap().remain_quota, 10_000);
        assert!(ledger.records().is_empty());
    }

    #[tokio::test]
    async fn settle_posts_the_difference_and_records() {
        let (ledger, channels, settlement) = setup(10_000, 10_000);
        let info = settlement.reserve(&caller(), 5, "gpt-4", 100, "t2").await.unwrap();
        // (100 + 20 * 2) * 15 = 2100
        info.settle(Usage::new(100, 20)).await.unwrap();

        assert_eq!(ledger.user(1).unwrap().quota, 10_000 - 2_100);
        assert_eq!(ledger.user(1).unwrap().used_quota, 2_100);
        assert_eq!(ledger.token(10).unwrap().remain_quota, 10_000 - 2_100);
        assert_eq!(ledger.records().len(), 1);
        assert_eq!(channels.get(5).await.unwrap().unwrap().used_quota, 2_100);
    }

    #[tokio::test]
    async fn unconsumed_reservation_refunds_on_drop() {
        let (ledger, _, settlement) = setup(10_000, 10_000);
        let info = settlement.reserve(&caller(), 5, "gpt-4", 100, "t6").await.unwrap();
        assert_eq!(ledger.token(10).unwrap().remain_quota, 1_000);
        drop(info);

        let restored = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while ledger.token(10).unwrap().remain_quota != 10_000 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(restored.is_ok());
        assert_eq!(ledger.user(1).unwrap().quota, 10_000);
        assert!(ledger.records().is_empty());
    }

    #[tokio::test]
    async fn rich_users_skip_pre_consumption() {
        let (ledger, _, settlement) = setup(100_000_000, 0);
        let info = settlement.reserve(&caller(), 5, "gpt-4", 10, "t3").await.unwrap();
        assert!(!info.pre_consumed());
        assert_eq!(ledger.user(1).unwrap().quota, 100_000_000);
        info.refund().await.unwrap();
        assert_eq!(ledger.user(1).unwrap().quota, 100_000_000);
    }

    #[tokio::test]
    async fn short_quota_is_rejected() {
        let (_, _, settlement) = setup(100, 100);
        let err = settlement.reserve(&caller(), 5, "gpt-4", 10, "t4").await.err().unwrap();
        assert_eq!(err.status, 403);
        assert_eq!(err.code_str(), Some("insufficient_user_quota"));

        let (_, _, settlement) = setup(10_000, 10);
        let err = settlement.reserve(&caller(), 5, "gpt-4", 10, "t5").await.err().unwrap();
        assert_eq!(err.status, 403);
        assert_eq!(err.code_str(), Some("pre_consume_token_quota_failed"));
    }
}
