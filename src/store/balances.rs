use rust_decimal::Decimal;
use sqlx::Row;

use crate::account::{AccountRef, AccountType, BillingAccount};
use crate::error::{BillingError, Result};

use super::Database;

impl Database {
    /// Authoritative balance, or None when the account was never funded.
    pub async fn fetch_balance(&self, account: &AccountRef) -> Result<Option<Decimal>> {
        let row = sqlx::query(
            "SELECT balance FROM account_balance WHERE owner_id = $1 AND owner_type = $2",
        )
        .bind(account.account_id)
        .bind(account.account_type.as_str())
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|r| r.get("balance")))
    }

    /// Top-up / refund path. Creates the account row on first fund and
    /// notifies listeners so cached state reseeds.
    pub async fn fund_account(&self, account: &AccountRef, amount: Decimal) -> Result<Decimal> {
        let mut tx = self.pool().begin().await?;
        let row = sqlx::query(
            r#"INSERT INTO account_balance (owner_id, owner_type, balance)
               VALUES ($1, $2, $3)
               ON CONFLICT (owner_id, owner_type)
               DO UPDATE SET balance = account_balance.balance + EXCLUDED.balance,
                             updated_at = now()
               RETURNING balance"#,
        )
        .bind(account.account_id)
        .bind(account.account_type.as_str())
        .bind(amount)
        .fetch_one(&mut *tx)
        .await?;
        let payload = serde_json::json!({
            "account_id": account.account_id,
            "account_type": account.account_type.as_str(),
        });
        sqlx::query("SELECT pg_notify('account_balance_updated', $1)")
            .bind(payload.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(row.get("balance"))
    }

    /// Bulk conditional flush: one UPDATE per account type, all in one
    /// transaction. Returns the number of rows updated.
    pub async fn flush_balances(
        &self,
        groups: &[(AccountType, Vec<(i64, Decimal)>)],
    ) -> Result<u64> {
        let mut tx = self.pool().begin().await?;
        let mut updated = 0u64;
        for (account_type, rows) in groups {
            if rows.is_empty() {
                continue;
            }
            let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
            let balances: Vec<Decimal> = rows.iter().map(|(_, balance)| *balance).collect();
            let result = sqlx::query(
                r#"UPDATE account_balance AS ab
                   SET balance = v.balance, updated_at = now()
                   FROM (SELECT unnest($1::bigint[]) AS owner_id,
                                unnest($2::numeric[]) AS balance) AS v
                   WHERE ab.owner_id = v.owner_id AND ab.owner_type = $3"#,
            )
            .bind(&ids)
            .bind(&balances)
            .bind(account_type.as_str())
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    /// Durable half of virtual-key resolution.
    pub async fn fetch_billing_account(&self, virtual_key: &str) -> Result<Option<BillingAccount>> {
        let row = sqlx::query(
            r#"SELECT account_id, account_type, customer_type_id
               FROM virtual_key WHERE token = $1 AND enabled"#,
        )
        .bind(virtual_key)
        .fetch_optional(self.pool())
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let type_raw: String = row.get("account_type");
        let account_type: AccountType = type_raw.parse().map_err(|_| {
            BillingError::CorruptRow(format!("virtual_key: bad account_type {type_raw:?}"))
        })?;
        Ok(Some(BillingAccount {
            account: AccountRef::new(account_type, row.get("account_id")),
            customer_type_id: row.get("customer_type_id"),
        }))
    }

    /// Reverse lookup backing the pricing cascade invalidation: every
    /// virtual key billing through the given customer type.
    pub async fn virtual_keys_for_customer_type(
        &self,
        customer_type_id: i64,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT token FROM virtual_key WHERE customer_type_id = $1")
            .bind(customer_type_id)
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(|r| r.get("token")).collect())
    }

    pub async fn price_table_json(&self, customer_type_id: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT prices FROM price_table WHERE customer_type_id = $1")
            .bind(customer_type_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| r.get("prices")))
    }

    pub async fn price_override_json(&self, virtual_key: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT price_override FROM virtual_key WHERE token = $1 AND enabled",
        )
        .bind(virtual_key)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>("price_override")))
    }
}
