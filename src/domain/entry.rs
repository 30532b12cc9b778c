//! Ledger journal entries.
//!
//! One immutable row per side of a transaction: an internal transfer is a
//! debit row plus a credit row whose signed amounts sum to zero; an external
//! credit or debit is a single row tied to a provider event id. Rows are
//! never updated or deleted; corrections are new reversing entries.

use crate::domain::{AccountId, TimeMs, Tokens};
use serde::{Deserialize, Serialize};

/// Classification of a balance-affecting event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Purchase,
    Tip,
    Gift,
    CallCharge,
    Refund,
    Withdrawal,
    WithdrawalReversal,
    PlatformFee,
    Transfer,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Purchase => "purchase",
            EntryType::Tip => "tip",
            EntryType::Gift => "gift",
            EntryType::CallCharge => "call_charge",
            EntryType::Refund => "refund",
            EntryType::Withdrawal => "withdrawal",
            EntryType::WithdrawalReversal => "withdrawal_reversal",
            EntryType::PlatformFee => "platform_fee",
            EntryType::Transfer => "transfer",
        }
    }
}

impl std::str::FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "purchase" => Ok(EntryType::Purchase),
            "tip" => Ok(EntryType::Tip),
            "gift" => Ok(EntryType::Gift),
            "call_charge" => Ok(EntryType::CallCharge),
            "refund" => Ok(EntryType::Refund),
            "withdrawal" => Ok(EntryType::Withdrawal),
            "withdrawal_reversal" => Ok(EntryType::WithdrawalReversal),
            "platform_fee" => Ok(EntryType::PlatformFee),
            "transfer" => Ok(EntryType::Transfer),
            other => Err(format!("unknown entry type: {}", other)),
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stored journal row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub account_id: AccountId,
    pub entry_type: EntryType,
    /// Negative for debits, positive for credits.
    pub signed_amount: i64,
    /// Account balance immediately after this row was applied.
    pub balance_after: Tokens,
    /// Links the sides of one transaction, or carries an external event id.
    pub reference_id: String,
    pub idempotency_key: Option<String>,
    pub created_at: TimeMs,
}

/// A journal row awaiting insertion, built by the settlement engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub account_id: AccountId,
    pub entry_type: EntryType,
    pub signed_amount: i64,
    pub balance_after: Tokens,
    pub reference_id: String,
    pub idempotency_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_entry_type_round_trip() {
        for ty in [
            EntryType::Purchase,
            EntryType::Tip,
            EntryType::Gift,
            EntryType::CallCharge,
            EntryType::Refund,
            EntryType::Withdrawal,
            EntryType::WithdrawalReversal,
            EntryType::PlatformFee,
            EntryType::Transfer,
        ] {
            assert_eq!(EntryType::from_str(ty.as_str()).unwrap(), ty);
        }
        assert!(EntryType::from_str("bribe").is_err());
    }
}
