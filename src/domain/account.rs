//! Account: one row per balance holder.

use crate::domain::{AccountId, OwnerId, TimeMs, Tokens};
use serde::{Deserialize, Serialize};

/// Kind of balance holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    /// A regular user or creator balance.
    User,
    /// The platform's own account (fees, withdrawal escrow).
    Platform,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::User => "user",
            AccountKind::Platform => "platform",
        }
    }
}

impl std::str::FromStr for AccountKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(AccountKind::User),
            "platform" => Ok(AccountKind::Platform),
            other => Err(format!("unknown account kind: {}", other)),
        }
    }
}

/// A balance holder.
///
/// `balance` is the only spendable figure and is mutated exclusively by the
/// settlement engine; it must always equal the signed sum of the account's
/// ledger entries (the auditor enforces this).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner_id: OwnerId,
    pub kind: AccountKind,
    pub balance: Tokens,
    pub total_earned: Tokens,
    pub total_spent: Tokens,
    /// Set when the auditor detects a balance/journal mismatch. A frozen
    /// account cannot be debited until an operator intervenes.
    pub frozen: bool,
    /// Soft-closure flag; accounts are never hard-deleted.
    pub disabled: bool,
    pub created_at: TimeMs,
    pub updated_at: TimeMs,
}

impl Account {
    /// Whether this account may be debited.
    pub fn can_spend(&self) -> bool {
        !self.frozen && !self.disabled
    }
}
