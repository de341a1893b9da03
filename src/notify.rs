use serde::Deserialize;
use sqlx::postgres::PgListener;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::account::{AccountRef, AccountType};
use crate::cache::{BalanceCache, PricingCache, ResolutionCache};
use crate::error::Result;
use crate::store::Database;

pub const CHANNEL_BALANCE_UPDATED: &str = "account_balance_updated";
pub const CHANNEL_RATE_UPDATE: &str = "customer_type_rate_update";
pub const CHANNEL_VK_CONFIG: &str = "virtual_key_config_changed";

pub const CHANNELS: [&str; 3] = [
    CHANNEL_BALANCE_UPDATED,
    CHANNEL_RATE_UPDATE,
    CHANNEL_VK_CONFIG,
];

/// Change notifications from the system of record, one tagged shape per
/// channel, validated once at this boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeNotification {
    AccountBalanceUpdated {
        account_id: i64,
        account_type: AccountType,
    },
    CustomerTypeRateUpdate {
        customer_type_id: i64,
    },
    VirtualKeyConfigChanged {
        virtual_key: String,
    },
}

#[derive(Debug, Error)]
pub enum NotifyParseError {
    #[error("unknown notification channel: {0}")]
    UnknownChannel(String),
    #[error("bad payload on {channel}: {err}")]
    BadPayload {
        channel: &'static str,
        err: serde_json::Error,
    },
}

pub fn parse(channel: &str, payload: &str) -> std::result::Result<ChangeNotification, NotifyParseError> {
    #[derive(Deserialize)]
    struct BalancePayload {
        account_id: i64,
        account_type: AccountType,
    }
    #[derive(Deserialize)]
    struct RatePayload {
        customer_type_id: i64,
    }
    #[derive(Deserialize)]
    struct VkPayload {
        virtual_key: String,
    }

    match channel {
        CHANNEL_BALANCE_UPDATED => {
            let parsed: BalancePayload =
                serde_json::from_str(payload).map_err(|err| NotifyParseError::BadPayload {
                    channel: CHANNEL_BALANCE_UPDATED,
                    err,
                })?;
            Ok(ChangeNotification::AccountBalanceUpdated {
                account_id: parsed.account_id,
                account_type: parsed.account_type,
            })
        }
        CHANNEL_RATE_UPDATE => {
            let parsed: RatePayload =
                serde_json::from_str(payload).map_err(|err| NotifyParseError::BadPayload {
                    channel: CHANNEL_RATE_UPDATE,
                    err,
                })?;
            Ok(ChangeNotification::CustomerTypeRateUpdate {
                customer_type_id: parsed.customer_type_id,
            })
        }
        CHANNEL_VK_CONFIG => {
            let parsed: VkPayload =
                serde_json::from_str(payload).map_err(|err| NotifyParseError::BadPayload {
                    channel: CHANNEL_VK_CONFIG,
                    err,
                })?;
            Ok(ChangeNotification::VirtualKeyConfigChanged {
                virtual_key: parsed.virtual_key,
            })
        }
        other => Err(NotifyParseError::UnknownChannel(other.to_string())),
    }
}

/// LISTEN/NOTIFY bridge: each notification triggers the matching cache
/// invalidation. Malformed payloads are logged and skipped; the loop only
/// exits on cancellation.
pub struct NotificationListener {
    db: Database,
    balances: BalanceCache,
    resolution: ResolutionCache,
    pricing: PricingCache,
}

impl NotificationListener {
    pub fn new(
        db: Database,
        balances: BalanceCache,
        resolution: ResolutionCache,
        pricing: PricingCache,
    ) -> Self {
        Self {
            db,
            balances,
            resolution,
            pricing,
        }
    }

    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let mut listener = PgListener::connect_with(self.db.pool()).await?;
        listener.listen_all(CHANNELS).await?;
        tracing::info!(channels = ?CHANNELS, "listening for change notifications");

        loop {
            let notification = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                received = listener.recv() => received,
            };
            let notification = match notification {
                Ok(notification) => notification,
                Err(err) => {
                    tracing::warn!(%err, "notification stream error, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };
            match parse(notification.channel(), notification.payload()) {
                Ok(change) => {
                    if let Err(err) = self.dispatch(&change).await {
                        tracing::warn!(?change, %err, "cache invalidation failed");
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "ignoring malformed notification");
                }
            }
        }
    }

    async fn dispatch(&self, change: &ChangeNotification) -> Result<()> {
        match change {
            ChangeNotification::AccountBalanceUpdated {
                account_id,
                account_type,
            } => {
                let account = AccountRef::new(*account_type, *account_id);
                self.balances.invalidate(&account).await?;
                let dropped = self.resolution.invalidate_account(&account).await?;
                tracing::debug!(%account, dropped, "balance and resolution caches invalidated");
            }
            ChangeNotification::CustomerTypeRateUpdate { customer_type_id } => {
                let dropped = self
                    .pricing
                    .invalidate_customer_type(&self.db, *customer_type_id)
                    .await?;
                tracing::debug!(customer_type_id, dropped, "pricing cascade invalidated");
            }
            ChangeNotification::VirtualKeyConfigChanged { virtual_key } => {
                self.resolution.invalidate_virtual_key(virtual_key).await?;
                self.pricing.invalidate_virtual_key(virtual_key).await?;
                tracing::debug!(virtual_key, "virtual key caches invalidated");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_channel() {
        assert_eq!(
            parse(
                CHANNEL_BALANCE_UPDATED,
                r#"{"account_id": 7, "account_type": "tenant"}"#
            )
            .unwrap(),
            ChangeNotification::AccountBalanceUpdated {
                account_id: 7,
                account_type: AccountType::Tenant,
            }
        );
        assert_eq!(
            parse(CHANNEL_RATE_UPDATE, r#"{"customer_type_id": 3}"#).unwrap(),
            ChangeNotification::CustomerTypeRateUpdate {
                customer_type_id: 3
            }
        );
        assert_eq!(
            parse(CHANNEL_VK_CONFIG, r#"{"virtual_key": "vk-9"}"#).unwrap(),
            ChangeNotification::VirtualKeyConfigChanged {
                virtual_key: "vk-9".to_string()
            }
        );
    }

    #[test]
    fn rejects_unknown_channels_and_bad_payloads() {
        assert!(matches!(
            parse("other_channel", "{}"),
            Err(NotifyParseError::UnknownChannel(_))
        ));
        assert!(matches!(
            parse(CHANNEL_RATE_UPDATE, r#"{"customer_type_id": "three"}"#),
            Err(NotifyParseError::BadPayload { .. })
        ));
    }
}
