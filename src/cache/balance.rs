use redis::AsyncCommands;

use crate::account::AccountRef;
use crate::error::{BillingError, Result};
use crate::money::{self, UsdMicros};
use crate::store::Database;

/// Cache-resident spendable balances with atomic conditional decrement.
///
/// Balance keys carry no TTL; the flusher owns their lifecycle. An expiring
/// balance key would silently drop unflushed spend.
#[derive(Clone, Debug)]
pub struct BalanceCache {
    client: redis::Client,
    prefix: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub balance_before_usd_micros: UsdMicros,
    pub balance_after_usd_micros: UsdMicros,
}

impl BalanceCache {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn balance_key(&self, account: &AccountRef) -> String {
        self.member_key(&account.cache_member())
    }

    /// Balance key for an already-encoded `"{type}:{id}"` member. The
    /// flusher walks the dirty set and rebuilds keys through this.
    pub fn member_key(&self, member: &str) -> String {
        format!("{}:balance:{member}", self.prefix)
    }

    /// Set of accounts with cache-resident spend not yet flushed.
    pub fn dirty_key(&self) -> String {
        format!("{}:balance:dirty", self.prefix)
    }

    /// Cached balance if present. Unparseable values are treated as absent.
    pub async fn cached_balance(&self, account: &AccountRef) -> Result<Option<UsdMicros>> {
        let mut conn = self.connection().await?;
        read_micros(&mut conn, &self.balance_key(account)).await
    }

    /// Seed the cache from durable truth if absent, returning the balance
    /// a charge would start from.
    pub async fn ensure(&self, db: &Database, account: &AccountRef) -> Result<UsdMicros> {
        let mut conn = self.connection().await?;
        let key = self.balance_key(account);
        if let Some(micros) = read_micros(&mut conn, &key).await? {
            return Ok(micros);
        }
        let durable = db
            .fetch_balance(account)
            .await?
            .ok_or_else(|| BillingError::BalanceNotFound {
                account: account.to_string(),
            })?;
        let micros = money::decimal_to_micros(durable)?;
        // SET NX: losing the seed race means a concurrent process already
        // seeded the same durable truth, possibly with charges applied.
        let _: bool = conn.set_nx(&key, micros).await?;
        match read_micros(&mut conn, &key).await? {
            Some(current) => Ok(current),
            None => Ok(micros),
        }
    }

    /// Atomic conditional decrement. Compare and decrement execute as one
    /// indivisible script; concurrent charges against the same account
    /// serialize inside redis and can never overdraw.
    pub async fn charge(&self, account: &AccountRef, amount: UsdMicros) -> Result<ChargeReceipt> {
        if amount <= 0 {
            return Err(BillingError::NonPositiveCharge { usd_micros: amount });
        }
        let mut conn = self.connection().await?;
        let script = redis::Script::new(
            r#"
local balance_key = KEYS[1]
local dirty_key = KEYS[2]
local amount = tonumber(ARGV[1]) or 0
local member = ARGV[2]

local balance = redis.call("GET", balance_key)
if not balance then
  return { "ERR", "not_found" }
end
balance = tonumber(balance)
if balance < amount then
  return { "ERR", "insufficient", tostring(balance) }
end
local after = redis.call("DECRBY", balance_key, amount)
redis.call("SADD", dirty_key, member)
return { "OK", tostring(balance), tostring(after) }
"#,
        );

        let result: Vec<String> = script
            .key(self.balance_key(account))
            .key(self.dirty_key())
            .arg(amount)
            .arg(account.cache_member())
            .invoke_async(&mut conn)
            .await?;

        match result.first().map(String::as_str) {
            Some("OK") => {
                let before = parse_script_int(result.get(1))?;
                let after = parse_script_int(result.get(2))?;
                Ok(ChargeReceipt {
                    balance_before_usd_micros: before,
                    balance_after_usd_micros: after,
                })
            }
            Some("ERR") if result.get(1).map(String::as_str) == Some("not_found") => {
                Err(BillingError::BalanceNotFound {
                    account: account.to_string(),
                })
            }
            Some("ERR") if result.get(1).map(String::as_str) == Some("insufficient") => {
                let available = result
                    .get(2)
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .unwrap_or(0);
                Err(BillingError::InsufficientBalance {
                    available_usd_micros: available,
                    attempted_usd_micros: amount,
                })
            }
            _ => Err(unexpected_script_response()),
        }
    }

    /// Drop the cached balance so the next access reseeds from durable
    /// truth. Driven by `account_balance_updated` notifications.
    pub async fn invalidate(&self, account: &AccountRef) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(self.balance_key(account)).await?;
        Ok(())
    }
}

async fn read_micros(
    conn: &mut redis::aio::MultiplexedConnection,
    key: &str,
) -> Result<Option<UsdMicros>> {
    let raw: Option<String> = conn.get(key).await?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw.parse::<i64>() {
        Ok(micros) => Ok(Some(micros)),
        Err(_) => {
            tracing::warn!(key, value = %raw, "unparseable cached balance, treating as absent");
            Ok(None)
        }
    }
}

fn parse_script_int(raw: Option<&String>) -> Result<i64> {
    raw.and_then(|value| value.parse().ok())
        .ok_or_else(unexpected_script_response)
}

fn unexpected_script_response() -> BillingError {
    BillingError::Redis(redis::RedisError::from((
        redis::ErrorKind::ResponseError,
        "unexpected redis script response",
    )))
}
