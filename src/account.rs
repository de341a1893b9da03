use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    User,
    Tenant,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Tenant => "tenant",
        }
    }

    pub const ALL: [AccountType; 2] = [AccountType::User, AccountType::Tenant];
}

#[derive(Debug, Error)]
#[error("unknown account type: {0}")]
pub struct AccountTypeParseError(String);

impl FromStr for AccountType {
    type Err = AccountTypeParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "user" => Ok(Self::User),
            "tenant" => Ok(Self::Tenant),
            other => Err(AccountTypeParseError(other.to_string())),
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a billing account: `(type, id)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountRef {
    pub account_type: AccountType,
    pub account_id: i64,
}

impl AccountRef {
    pub fn new(account_type: AccountType, account_id: i64) -> Self {
        Self {
            account_type,
            account_id,
        }
    }

    /// Canonical `"{type}:{id}"` encoding used for cache keys, set members
    /// and shard hashing. Must stay stable across releases: the shard hash
    /// of in-flight stream data depends on it.
    pub fn cache_member(&self) -> String {
        format!("{}:{}", self.account_type.as_str(), self.account_id)
    }

    pub fn parse_cache_member(raw: &str) -> Option<Self> {
        let (type_raw, id_raw) = raw.split_once(':')?;
        let account_type = type_raw.parse().ok()?;
        let account_id = id_raw.parse().ok()?;
        Some(Self {
            account_type,
            account_id,
        })
    }
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account_type.as_str(), self.account_id)
    }
}

/// What a virtual key resolves to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BillingAccount {
    pub account: AccountRef,
    pub customer_type_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_member_round_trips() {
        let account = AccountRef::new(AccountType::Tenant, 42);
        assert_eq!(account.cache_member(), "tenant:42");
        assert_eq!(
            AccountRef::parse_cache_member("tenant:42"),
            Some(account)
        );
        assert_eq!(AccountRef::parse_cache_member("tenant"), None);
        assert_eq!(AccountRef::parse_cache_member("group:1"), None);
    }
}
