use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::account::BillingAccount;
use crate::cache::{BalanceCache, PriceSource, PricingCache, ResolutionCache};
use crate::error::{BillingError, Result};
use crate::event::{DeductionEvent, TokenUsage};
use crate::money;
use crate::pricing::PriceTable;
use crate::store::Database;
use crate::stream::DeductionStream;

/// Producer-side entry point used by the gateway request layer: resolve
/// the billing account, price the usage, charge the cache atomically, and
/// append the deduction event to the stream.
///
/// Charge-then-call ordering: an unpayable request must never reach the
/// upstream provider, so the decrement happens before the expensive call
/// and the event append happens after.
#[derive(Clone)]
pub struct ChargePipeline {
    db: Database,
    balances: BalanceCache,
    resolution: ResolutionCache,
    pricing: PricingCache,
    price_source: Arc<dyn PriceSource>,
    stream: DeductionStream,
    currency: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChargeOutcome {
    pub deduction_id: String,
    pub cost: Decimal,
    pub currency: String,
    pub new_balance: Decimal,
}

impl ChargePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        balances: BalanceCache,
        resolution: ResolutionCache,
        pricing: PricingCache,
        price_source: Arc<dyn PriceSource>,
        stream: DeductionStream,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            db,
            balances,
            resolution,
            pricing,
            price_source,
            stream,
            currency: currency.into(),
        }
    }

    pub async fn charge_for_usage(
        &self,
        virtual_key: &str,
        provider: &str,
        model: &str,
        usage: TokenUsage,
        trace_id: Option<String>,
    ) -> Result<ChargeOutcome> {
        let billing = self.resolution.resolve(&self.db, virtual_key).await?;
        let table = self.price_table_for(virtual_key, &billing).await?;
        let cost = table
            .as_ref()
            .and_then(|table| table.cost_for_usage(model, &usage))
            .filter(|cost| *cost > 0)
            .ok_or_else(|| BillingError::ModelNotPriced {
                model: model.to_string(),
            })?;

        // First attempt may race a flusher or an invalidation deleting the
        // key between ensure and charge; one reseed retry covers it.
        self.balances.ensure(&self.db, &billing.account).await?;
        let receipt = match self.balances.charge(&billing.account, cost).await {
            Err(BillingError::BalanceNotFound { .. }) => {
                self.balances.ensure(&self.db, &billing.account).await?;
                self.balances.charge(&billing.account, cost).await?
            }
            other => other?,
        };

        let event = DeductionEvent {
            deduction_id: uuid::Uuid::new_v4().to_string(),
            account_id: billing.account.account_id,
            account_type: billing.account.account_type,
            virtual_key: virtual_key.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            cost_usd_micros: cost,
            currency: self.currency.clone(),
            usage,
            balance_before_usd_micros: receipt.balance_before_usd_micros,
            balance_after_usd_micros: receipt.balance_after_usd_micros,
            created_at: Utc::now(),
            trace_id: trace_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        };

        if let Err(err) = self.stream.write(&event).await {
            // The charge is already applied and stays applied. The caller
            // may retry the append; a permanently lost event shows up in
            // audit-ledger reconciliation.
            tracing::warn!(
                deduction_id = %event.deduction_id,
                account = %billing.account,
                cost_usd_micros = cost,
                %err,
                "deduction stream append failed after charge"
            );
            return Err(err);
        }

        Ok(ChargeOutcome {
            deduction_id: event.deduction_id,
            cost: money::micros_to_decimal(cost),
            currency: self.currency.clone(),
            new_balance: money::micros_to_decimal(receipt.balance_after_usd_micros),
        })
    }

    /// Per-key override wins; otherwise the customer type's table.
    async fn price_table_for(
        &self,
        virtual_key: &str,
        billing: &BillingAccount,
    ) -> Result<Option<PriceTable>> {
        if let Some(table) = self
            .pricing
            .virtual_key(self.price_source.as_ref(), virtual_key)
            .await?
        {
            return Ok(Some(table));
        }
        match billing.customer_type_id {
            Some(customer_type_id) => {
                self.pricing
                    .customer_type(self.price_source.as_ref(), customer_type_id)
                    .await
            }
            None => Ok(None),
        }
    }
}
