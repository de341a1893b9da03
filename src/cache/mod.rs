//! Cache-backed resolution and accounting layers. All cross-process
//! coordination here is either an atomically executed script or a single
//! redis command; nothing does read-then-write.

mod balance;
mod pricing;
mod resolve;

pub use balance::{BalanceCache, ChargeReceipt};
pub use pricing::{DbPriceSource, PriceSource, PricingCache};
pub use resolve::ResolutionCache;
