//! Pending withdrawals: queued payouts holding a balance reservation.

use crate::domain::{AccountId, TimeMs, Tokens};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Approved => "approved",
            WithdrawalStatus::Rejected => "rejected",
            WithdrawalStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WithdrawalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WithdrawalStatus::Pending),
            "approved" => Ok(WithdrawalStatus::Approved),
            "rejected" => Ok(WithdrawalStatus::Rejected),
            "expired" => Ok(WithdrawalStatus::Expired),
            other => Err(format!("unknown withdrawal status: {}", other)),
        }
    }
}

/// A payout request awaiting external settlement.
///
/// The reserved amount is moved into the platform escrow account by a
/// `withdrawal` settlement when the request is created, so the journal —
/// not a shadow column — is what makes the balance unspendable. Rejection
/// or expiry releases it with a `withdrawal_reversal` settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWithdrawal {
    pub id: String,
    pub account_id: AccountId,
    pub amount: Tokens,
    pub status: WithdrawalStatus,
    /// Journal reference of the reserving settlement.
    pub reference_id: String,
    pub created_at: TimeMs,
    pub expires_at: TimeMs,
    pub resolved_at: Option<TimeMs>,
    /// Set once the reversal settlement for a rejected or expired
    /// withdrawal has committed. A resolved row without it still holds
    /// the reservation in escrow and is retried by the scheduler sweep.
    pub released_at: Option<TimeMs>,
}
