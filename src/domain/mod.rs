//! Domain types for the token ledger core.
//!
//! This module provides:
//! - Integer token amounts with checked arithmetic
//! - Domain primitives: TimeMs, AccountId, OwnerId
//! - Account, LedgerEntry, MeteredSession, ProviderEvent, PendingWithdrawal
//! - The pure interval-elapsed helper used by call metering

pub mod account;
pub mod entry;
pub mod event;
pub mod primitives;
pub mod session;
pub mod withdrawal;

pub use account::{Account, AccountKind};
pub use entry::{EntryType, LedgerEntry, NewLedgerEntry};
pub use event::{EventStatus, ProcessedProviderEvent, ProviderEvent};
pub use primitives::{AccountId, OwnerId, TimeMs, Tokens};
pub use session::{elapsed_intervals, EndReason, MeteredSession, SessionState};
pub use withdrawal::{PendingWithdrawal, WithdrawalStatus};
