use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::account::AccountType;
use crate::money::UsdMicros;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
        }
    }
}

/// One charge attempt, immutable once produced.
///
/// The `balance_before`/`balance_after` snapshot is captured at charge time
/// so the audit trail reconstructs without re-reading balances later.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeductionEvent {
    pub deduction_id: String,
    pub account_id: i64,
    pub account_type: AccountType,
    pub virtual_key: String,
    pub provider: String,
    pub model: String,
    pub cost_usd_micros: UsdMicros,
    pub currency: String,
    pub usage: TokenUsage,
    pub balance_before_usd_micros: UsdMicros,
    pub balance_after_usd_micros: UsdMicros,
    pub created_at: DateTime<Utc>,
    pub trace_id: String,
}

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("invalid value for field {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventValidationError {
    #[error("empty deduction_id")]
    MissingDeductionId,
    #[error("empty virtual_key")]
    MissingVirtualKey,
    #[error("empty provider")]
    MissingProvider,
    #[error("empty model")]
    MissingModel,
    #[error("empty currency")]
    MissingCurrency,
    #[error("non-positive cost {cost_usd_micros}")]
    NonPositiveCost { cost_usd_micros: i64 },
}

impl DeductionEvent {
    /// Flat string/string field map, the wire shape of one stream entry.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("deduction_id", self.deduction_id.clone()),
            ("account_id", self.account_id.to_string()),
            ("account_type", self.account_type.as_str().to_string()),
            ("virtual_key", self.virtual_key.clone()),
            ("provider", self.provider.clone()),
            ("model", self.model.clone()),
            ("cost", self.cost_usd_micros.to_string()),
            ("currency", self.currency.clone()),
            ("input_tokens", self.usage.input_tokens.to_string()),
            ("output_tokens", self.usage.output_tokens.to_string()),
            ("total_tokens", self.usage.total_tokens.to_string()),
            ("balance_before", self.balance_before_usd_micros.to_string()),
            ("balance_after", self.balance_after_usd_micros.to_string()),
            ("timestamp", self.created_at.timestamp_millis().to_string()),
            ("trace_id", self.trace_id.clone()),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, EventDecodeError> {
        let text = |field: &'static str| -> Result<String, EventDecodeError> {
            fields
                .get(field)
                .cloned()
                .ok_or(EventDecodeError::MissingField(field))
        };
        fn parsed<T: std::str::FromStr>(
            field: &'static str,
            raw: &str,
        ) -> Result<T, EventDecodeError> {
            raw.parse().map_err(|_| EventDecodeError::InvalidField {
                field,
                value: raw.to_string(),
            })
        }

        let account_type_raw = text("account_type")?;
        let timestamp_ms: i64 = parsed("timestamp", &text("timestamp")?)?;
        let created_at = DateTime::<Utc>::from_timestamp_millis(timestamp_ms).ok_or(
            EventDecodeError::InvalidField {
                field: "timestamp",
                value: timestamp_ms.to_string(),
            },
        )?;
        let input_tokens: u32 = parsed("input_tokens", &text("input_tokens")?)?;
        let output_tokens: u32 = parsed("output_tokens", &text("output_tokens")?)?;
        let total_tokens: u32 = parsed("total_tokens", &text("total_tokens")?)?;

        Ok(Self {
            deduction_id: text("deduction_id")?,
            account_id: parsed("account_id", &text("account_id")?)?,
            account_type: account_type_raw.parse().map_err(|_| {
                EventDecodeError::InvalidField {
                    field: "account_type",
                    value: account_type_raw.clone(),
                }
            })?,
            virtual_key: text("virtual_key")?,
            provider: text("provider")?,
            model: text("model")?,
            cost_usd_micros: parsed("cost", &text("cost")?)?,
            currency: text("currency")?,
            usage: TokenUsage {
                input_tokens,
                output_tokens,
                total_tokens,
            },
            balance_before_usd_micros: parsed("balance_before", &text("balance_before")?)?,
            balance_after_usd_micros: parsed("balance_after", &text("balance_after")?)?,
            created_at,
            trace_id: text("trace_id")?,
        })
    }

    /// Validation the durable writer runs before accepting an event into a
    /// batch. Rejection is a value, not an abort.
    pub fn validate(&self) -> Result<(), EventValidationError> {
        if self.deduction_id.trim().is_empty() {
            return Err(EventValidationError::MissingDeductionId);
        }
        if self.virtual_key.trim().is_empty() {
            return Err(EventValidationError::MissingVirtualKey);
        }
        if self.provider.trim().is_empty() {
            return Err(EventValidationError::MissingProvider);
        }
        if self.model.trim().is_empty() {
            return Err(EventValidationError::MissingModel);
        }
        if self.currency.trim().is_empty() {
            return Err(EventValidationError::MissingCurrency);
        }
        if self.cost_usd_micros <= 0 {
            return Err(EventValidationError::NonPositiveCost {
                cost_usd_micros: self.cost_usd_micros,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn sample_event(deduction_id: &str) -> DeductionEvent {
        DeductionEvent {
            deduction_id: deduction_id.to_string(),
            account_id: 7001,
            account_type: AccountType::User,
            virtual_key: "vk-test".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            cost_usd_micros: 400_000,
            currency: "USD".to_string(),
            usage: TokenUsage::new(120, 80),
            balance_before_usd_micros: 100_000_000,
            balance_after_usd_micros: 99_600_000,
            created_at: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            trace_id: "trace-1".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::sample_event;
    use super::*;

    #[test]
    fn wire_fields_round_trip() {
        let event = sample_event("ded-1");
        let fields: HashMap<String, String> = event
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(fields["cost"], "400000");
        assert_eq!(fields["account_type"], "user");
        let decoded = DeductionEvent::from_fields(&fields).expect("decode");
        assert_eq!(decoded, event);
    }

    #[test]
    fn decode_reports_the_offending_field() {
        let mut fields: HashMap<String, String> = sample_event("ded-1")
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        fields.remove("cost");
        assert!(matches!(
            DeductionEvent::from_fields(&fields),
            Err(EventDecodeError::MissingField("cost"))
        ));

        fields.insert("cost".to_string(), "forty".to_string());
        assert!(matches!(
            DeductionEvent::from_fields(&fields),
            Err(EventDecodeError::InvalidField { field: "cost", .. })
        ));
    }

    #[test]
    fn validation_rejects_bad_events() {
        let mut event = sample_event("ded-1");
        event.cost_usd_micros = 0;
        assert_eq!(
            event.validate(),
            Err(EventValidationError::NonPositiveCost {
                cost_usd_micros: 0
            })
        );

        let mut event = sample_event("  ");
        event.deduction_id = "  ".to_string();
        assert_eq!(
            event.validate(),
            Err(EventValidationError::MissingDeductionId)
        );

        assert_eq!(sample_event("ded-1").validate(), Ok(()));
    }
}
