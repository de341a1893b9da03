use std::collections::HashMap;

use sqlx::{Postgres, QueryBuilder, Row};

use crate::error::Result;
use crate::event::DeductionEvent;
use crate::money;

use super::Database;

/// Drains validated deduction events into the usage ledger and the
/// balance-audit ledger, one transaction per batch, idempotent on
/// `deduction_id`. The whole batch commits or none of it does.
#[derive(Clone, Debug)]
pub struct DurableWriter {
    db: Database,
}

#[derive(Clone, Debug)]
pub struct InvalidEvent {
    pub deduction_id: String,
    pub reason: String,
}

#[derive(Clone, Debug, Default)]
pub struct BatchReport {
    /// Newly inserted this batch, in batch order.
    pub committed: Vec<String>,
    /// Already durable from an earlier delivery.
    pub duplicates: Vec<String>,
    /// Rejected by validation, excluded from the batch.
    pub invalid: Vec<InvalidEvent>,
}

impl BatchReport {
    /// Deduction ids safe to acknowledge: durably present (new or
    /// duplicate) or permanently invalid. Redelivering an invalid event
    /// can never make it valid.
    pub fn ackable(&self) -> Vec<&str> {
        self.committed
            .iter()
            .chain(self.duplicates.iter())
            .map(String::as_str)
            .chain(self.invalid.iter().map(|e| e.deduction_id.as_str()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty() && self.duplicates.is_empty() && self.invalid.is_empty()
    }
}

impl DurableWriter {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn write_batch(&self, events: &[DeductionEvent]) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        let mut valid: Vec<&DeductionEvent> = Vec::with_capacity(events.len());
        for event in events {
            match event.validate() {
                Ok(()) => valid.push(event),
                Err(reason) => {
                    tracing::warn!(
                        deduction_id = %event.deduction_id,
                        %reason,
                        "excluding invalid deduction event from batch"
                    );
                    report.invalid.push(InvalidEvent {
                        deduction_id: event.deduction_id.clone(),
                        reason: reason.to_string(),
                    });
                }
            }
        }
        if valid.is_empty() {
            return Ok(report);
        }

        let mut tx = self.db.pool().begin().await?;

        let mut usage: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO usage_log (deduction_id, account_id, account_type, virtual_key, \
             provider, model, cost, currency, input_tokens, output_tokens, created_at) ",
        );
        usage.push_values(valid.iter(), |mut b, event| {
            b.push_bind(&event.deduction_id)
                .push_bind(event.account_id)
                .push_bind(event.account_type.as_str())
                .push_bind(&event.virtual_key)
                .push_bind(&event.provider)
                .push_bind(&event.model)
                .push_bind(money::micros_to_decimal(event.cost_usd_micros))
                .push_bind(&event.currency)
                .push_bind(i64::from(event.usage.input_tokens))
                .push_bind(i64::from(event.usage.output_tokens))
                .push_bind(event.created_at);
        });
        usage.push(" ON CONFLICT (deduction_id) DO NOTHING RETURNING id, deduction_id");
        let rows = usage.build().fetch_all(&mut *tx).await?;

        // Only rows inserted by this statement come back; duplicates do not
        // get a second audit row.
        let inserted: HashMap<String, i64> = rows
            .into_iter()
            .map(|row| (row.get("deduction_id"), row.get("id")))
            .collect();

        if !inserted.is_empty() {
            let mut audit: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO account_balance_audit \
                 (deduction_id, account_id, account_type, amount, usage_log_id, created_at) ",
            );
            audit.push_values(
                valid
                    .iter()
                    .filter(|event| inserted.contains_key(&event.deduction_id)),
                |mut b, event| {
                    b.push_bind(&event.deduction_id)
                        .push_bind(event.account_id)
                        .push_bind(event.account_type.as_str())
                        .push_bind(-money::micros_to_decimal(event.cost_usd_micros))
                        .push_bind(inserted[&event.deduction_id])
                        .push_bind(event.created_at);
                },
            );
            audit.push(" ON CONFLICT (deduction_id) DO NOTHING");
            audit.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        for event in &valid {
            if inserted.contains_key(&event.deduction_id) {
                report.committed.push(event.deduction_id.clone());
            } else {
                report.duplicates.push(event.deduction_id.clone());
            }
        }
        tracing::debug!(
            committed = report.committed.len(),
            duplicates = report.duplicates.len(),
            invalid = report.invalid.len(),
            "durable batch committed"
        );
        Ok(report)
    }

    /// Advisory reconciliation probe: usage rows with no audit row. A
    /// non-empty result means the audit trail has a hole worth chasing.
    pub async fn audit_orphans(&self, limit: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"SELECT u.deduction_id
               FROM usage_log u
               LEFT JOIN account_balance_audit a ON a.usage_log_id = u.id
               WHERE a.id IS NULL
               ORDER BY u.id
               LIMIT $1"#,
        )
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows.into_iter().map(|r| r.get("deduction_id")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ackable_covers_committed_duplicate_and_invalid() {
        let report = BatchReport {
            committed: vec!["a".to_string()],
            duplicates: vec!["b".to_string()],
            invalid: vec![InvalidEvent {
                deduction_id: "c".to_string(),
                reason: "non-positive cost".to_string(),
            }],
        };
        assert_eq!(report.ackable(), vec!["a", "b", "c"]);
        assert!(!report.is_empty());
        assert!(BatchReport::default().is_empty());
    }
}
