use std::collections::HashMap;

use redis::AsyncCommands;
use redis::{ExistenceCheck, SetExpiry, SetOptions};

use crate::account::{AccountRef, AccountType};
use crate::cache::BalanceCache;
use crate::error::Result;
use crate::money;
use crate::store::Database;

/// Reconciles cache-resident balances back into durable storage.
///
/// Cluster-wide mutual exclusion comes from a short-TTL lock key, so a
/// crashed flusher never blocks future cycles for longer than the TTL.
#[derive(Clone, Debug)]
pub struct BalanceFlusher {
    client: redis::Client,
    db: Database,
    balances: BalanceCache,
    lock_key: String,
    lock_ttl_secs: u64,
    identity: String,
}

#[derive(Clone, Debug, Default)]
pub struct FlushReport {
    /// Accounts whose balance was copied to durable storage and whose
    /// cache key was retired.
    pub flushed_accounts: usize,
    /// Accounts that took new charges mid-flush; their keys stay for the
    /// next cycle.
    pub retained_accounts: usize,
    /// Dirty-set members with no backing key (invalidated since charge).
    pub stale_members: usize,
    /// Another instance held the lock.
    pub skipped: bool,
}

impl BalanceFlusher {
    pub fn new(
        client: redis::Client,
        db: Database,
        balances: BalanceCache,
        prefix: impl Into<String>,
        lock_ttl_secs: u64,
    ) -> Self {
        let identity = format!(
            "flusher-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        );
        Self {
            client,
            db,
            balances,
            lock_key: format!("{}:flush:lock", prefix.into()),
            lock_ttl_secs,
            identity,
        }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    pub async fn run_once(&self) -> Result<FlushReport> {
        let mut conn = self.connection().await?;
        if !self.acquire_lock(&mut conn).await? {
            tracing::debug!("flush lock held elsewhere, skipping cycle");
            return Ok(FlushReport {
                skipped: true,
                ..FlushReport::default()
            });
        }
        let result = self.flush_locked(&mut conn).await;
        // Released in a final step regardless of outcome; on a lost
        // connection the TTL frees it.
        if let Err(err) = self.release_lock(&mut conn).await {
            tracing::warn!(%err, "failed to release flush lock, relying on expiry");
        }
        result
    }

    async fn acquire_lock(&self, conn: &mut redis::aio::MultiplexedConnection) -> Result<bool> {
        let options = SetOptions::default()
            .conditional_set(ExistenceCheck::NX)
            .with_expiration(SetExpiry::EX(self.lock_ttl_secs));
        let acquired: Option<String> = conn
            .set_options(&self.lock_key, &self.identity, options)
            .await?;
        Ok(acquired.is_some())
    }

    /// Compare-and-delete on the identity value so one flusher cannot
    /// release a lock a later one re-acquired after expiry.
    async fn release_lock(&self, conn: &mut redis::aio::MultiplexedConnection) -> Result<()> {
        let script = redis::Script::new(
            r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
end
return 0
"#,
        );
        let _: i64 = script
            .key(&self.lock_key)
            .arg(&self.identity)
            .invoke_async(conn)
            .await?;
        Ok(())
    }

    async fn flush_locked(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<FlushReport> {
        let mut report = FlushReport::default();
        let dirty_key = self.balances.dirty_key();
        let members: Vec<String> = conn.smembers(&dirty_key).await?;
        if members.is_empty() {
            return Ok(report);
        }

        let keys: Vec<String> = members
            .iter()
            .map(|member| self.balances.member_key(member))
            .collect();
        let values: Vec<Option<String>> = conn.mget(&keys).await?;

        let mut groups: HashMap<AccountType, Vec<(i64, rust_decimal::Decimal)>> = HashMap::new();
        // (member, expected raw value) for the compare-and-delete pass.
        let mut snapshots: Vec<(String, String)> = Vec::new();
        let mut stale: Vec<String> = Vec::new();

        for (member, value) in members.iter().zip(values) {
            let parsed = AccountRef::parse_cache_member(member)
                .zip(value.as_ref().and_then(|raw| raw.parse::<i64>().ok()));
            match (parsed, value) {
                (Some((account, micros)), Some(raw)) => {
                    groups
                        .entry(account.account_type)
                        .or_default()
                        .push((account.account_id, money::micros_to_decimal(micros)));
                    snapshots.push((member.clone(), raw));
                }
                _ => {
                    tracing::debug!(member, "dirty member without usable balance key");
                    stale.push(member.clone());
                }
            }
        }

        if !groups.is_empty() {
            let groups: Vec<(AccountType, Vec<(i64, rust_decimal::Decimal)>)> =
                groups.into_iter().collect();
            // One transaction for all types; a failure here leaves the
            // cache untouched and the next cycle re-flushes.
            let updated = self.db.flush_balances(&groups).await?;
            tracing::info!(rows = updated, "flushed cached balances to durable storage");
        }

        // Cache keys are consumed only after the durable commit. Delete is
        // conditional on the value we flushed: an account charged mid-flush
        // keeps its key (and dirty membership) for the next cycle.
        let consume = redis::Script::new(
            r#"
local balance_key = KEYS[1]
local dirty_key = KEYS[2]
local expected = ARGV[1]
local member = ARGV[2]
if redis.call("GET", balance_key) == expected then
  redis.call("DEL", balance_key)
  redis.call("SREM", dirty_key, member)
  return 1
end
return 0
"#,
        );
        for (member, expected) in &snapshots {
            let consumed: i64 = consume
                .key(self.balances.member_key(member))
                .key(&dirty_key)
                .arg(expected)
                .arg(member)
                .invoke_async(conn)
                .await?;
            if consumed == 1 {
                report.flushed_accounts += 1;
            } else {
                report.retained_accounts += 1;
            }
        }

        if !stale.is_empty() {
            let _: i64 = conn.srem(&dirty_key, &stale).await?;
            report.stale_members = stale.len();
        }

        Ok(report)
    }
}
