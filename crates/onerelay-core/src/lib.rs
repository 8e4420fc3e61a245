pub mod auth;
pub mod channels;
pub mod core;
pub mod handler;
pub mod pricing;
pub mod quota;
pub mod relay;
pub mod tokens;

pub use auth::{AuthProvider, AuthSnapshot, CallerCtx, MemoryAuth, TokenEntry, UserEntry};
pub use channels::{ChannelStore, ChannelStoreError, MemoryChannelStore};
pub use core::{Core, CoreState, hash_admin_key};
pub use pricing::Pricing;
pub use quota::{
    ConsumptionRecord, MemoryQuotaLedger, QuotaError, QuotaInfo, QuotaLedger, QuotaSettlement,
    TokenAccount, UserAccount,
};
pub use relay::{InboundRequest, RelayBody, RelayEngine, RelayMode, Relayed};
pub use tokens::{TiktokenCounter, TokenCounter};
