//! Metered sessions (live calls billed in discrete intervals).

use crate::domain::{AccountId, TimeMs, Tokens};
use serde::{Deserialize, Serialize};

/// Session lifecycle state.
///
/// `ringing → connected → ended` on the happy path; `ringing → declined`
/// when the callee refuses. There are no other transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Ringing,
    Connected,
    Ended,
    Declined,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Ringing => "ringing",
            SessionState::Connected => "connected",
            SessionState::Ended => "ended",
            SessionState::Declined => "declined",
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ringing" => Ok(SessionState::Ringing),
            "connected" => Ok(SessionState::Connected),
            "ended" => Ok(SessionState::Ended),
            "declined" => Ok(SessionState::Declined),
            other => Err(format!("unknown session state: {}", other)),
        }
    }
}

/// Why an ended session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Completed,
    OutOfFunds,
    Declined,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Completed => "completed",
            EndReason::OutOfFunds => "out_of_funds",
            EndReason::Declined => "declined",
        }
    }
}

impl std::str::FromStr for EndReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(EndReason::Completed),
            "out_of_funds" => Ok(EndReason::OutOfFunds),
            "declined" => Ok(EndReason::Declined),
            other => Err(format!("unknown end reason: {}", other)),
        }
    }
}

/// A billable live session.
///
/// `accumulated_cost` equals the sum of all `call_charge` journal rows
/// referencing this session, and `last_billed_at` only ever advances — both
/// are maintained by the settlement engine in the same transaction as the
/// charge itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeteredSession {
    pub id: String,
    pub payer_account_id: AccountId,
    pub payee_account_id: AccountId,
    pub rate_per_interval: Tokens,
    pub state: SessionState,
    pub end_reason: Option<EndReason>,
    pub created_at: TimeMs,
    pub connected_at: Option<TimeMs>,
    pub ended_at: Option<TimeMs>,
    pub last_billed_at: Option<TimeMs>,
    pub accumulated_cost: Tokens,
}

/// Whole billing intervals elapsed between `last_billed_at` and `now`.
///
/// Partial intervals are not billed; they stay pending until they complete
/// (or the session ends, at which point they are dropped — incremental
/// interval billing is the only billing model).
pub fn elapsed_intervals(last_billed_at: TimeMs, now: TimeMs, interval_ms: i64) -> i64 {
    if interval_ms <= 0 {
        return 0;
    }
    now.since(last_billed_at) / interval_ms
}
