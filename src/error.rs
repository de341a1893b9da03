use thiserror::Error;

use crate::money::MoneyError;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("money error: {0}")]
    Money(#[from] MoneyError),
    #[error(
        "insufficient balance: available={available_usd_micros} attempted={attempted_usd_micros}"
    )]
    InsufficientBalance {
        available_usd_micros: i64,
        attempted_usd_micros: i64,
    },
    #[error("no cached or durable balance for account {account}")]
    BalanceNotFound { account: String },
    #[error("no billing account resolves for the virtual key")]
    AccountNotFound,
    #[error("no price entry for model {model}")]
    ModelNotPriced { model: String },
    #[error("charge amount must be positive, got {usd_micros}")]
    NonPositiveCharge { usd_micros: i64 },
    #[error("corrupt durable row: {0}")]
    CorruptRow(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("worker channel closed: {0}")]
    ChannelClosed(&'static str),
}

pub type Result<T> = std::result::Result<T, BillingError>;
