pub mod account;
pub mod cache;
pub mod charge;
pub mod config;
mod error;
pub mod event;
pub mod flush;
pub mod money;
pub mod notify;
pub mod pricing;
pub mod shard;
pub mod store;
pub mod stream;
pub mod worker;

pub use account::{AccountRef, AccountType, BillingAccount};
pub use cache::{
    BalanceCache, ChargeReceipt, DbPriceSource, PriceSource, PricingCache, ResolutionCache,
};
pub use charge::{ChargeOutcome, ChargePipeline};
pub use config::BillingConfig;
pub use error::{BillingError, Result};
pub use event::{DeductionEvent, TokenUsage};
pub use flush::{BalanceFlusher, FlushReport};
pub use money::{MICROS_PER_USD, UsdMicros, decimal_to_micros, micros_to_decimal};
pub use pricing::{ModelPricing, PriceTable};
pub use store::{BatchReport, Database, DurableWriter};
pub use stream::{DeductionStream, ShardConsumer, StreamCleaner};
pub use worker::BillingWorker;
