pub mod api;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod metering;
pub mod notify;
pub mod reconcile;
pub mod settlement;
pub mod withdrawals;

pub use config::Config;
pub use db::{init_db, Repository};
pub use domain::{
    Account, AccountId, AccountKind, EntryType, LedgerEntry, MeteredSession, OwnerId,
    PendingWithdrawal, ProviderEvent, SessionState, TimeMs, Tokens, WithdrawalStatus,
};
pub use error::AppError;
pub use notify::{HttpNotifier, NoopNotifier, Notifier};
pub use reconcile::Reconciler;
pub use settlement::{Auditor, SettlementEngine, TransferService};
