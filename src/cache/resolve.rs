use redis::AsyncCommands;

use crate::account::{AccountRef, BillingAccount};
use crate::error::{BillingError, Result};
use crate::store::Database;

/// TTL'd virtual-key → billing-account resolution cache.
///
/// A per-account reverse set records which cached keys resolve to each
/// account, so balance-update invalidation fans out without key scans.
#[derive(Clone, Debug)]
pub struct ResolutionCache {
    client: redis::Client,
    prefix: String,
    ttl_secs: u64,
}

impl ResolutionCache {
    pub fn new(client: redis::Client, prefix: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            ttl_secs,
        }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn vk_key(&self, virtual_key: &str) -> String {
        format!("{}:vk:{virtual_key}", self.prefix)
    }

    fn reverse_key(&self, account: &AccountRef) -> String {
        format!("{}:vk_by_account:{}", self.prefix, account.cache_member())
    }

    pub async fn resolve(&self, db: &Database, virtual_key: &str) -> Result<BillingAccount> {
        let mut conn = self.connection().await?;
        let cached: Option<String> = conn.get(self.vk_key(virtual_key)).await?;
        if let Some(raw) = cached {
            match serde_json::from_str::<BillingAccount>(&raw) {
                Ok(billing) => return Ok(billing),
                Err(err) => {
                    tracing::warn!(virtual_key, %err, "corrupt resolution cache entry, refetching");
                }
            }
        }

        let billing = db
            .fetch_billing_account(virtual_key)
            .await?
            .ok_or(BillingError::AccountNotFound)?;
        let json = serde_json::to_string(&billing)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set_ex(self.vk_key(virtual_key), json, self.ttl_secs)
            .ignore()
            .sadd(self.reverse_key(&billing.account), virtual_key)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(billing)
    }

    /// Delete every cached resolution that points at the account, plus the
    /// reverse set itself. Returns how many key entries were dropped.
    pub async fn invalidate_account(&self, account: &AccountRef) -> Result<usize> {
        let mut conn = self.connection().await?;
        let reverse_key = self.reverse_key(account);
        let members: Vec<String> = conn.smembers(&reverse_key).await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for virtual_key in &members {
            pipe.del(self.vk_key(virtual_key)).ignore();
        }
        pipe.del(&reverse_key).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(members.len())
    }

    pub async fn invalidate_virtual_key(&self, virtual_key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(self.vk_key(virtual_key)).await?;
        Ok(())
    }
}
