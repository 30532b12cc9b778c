//! External event reconciliation: signature verification, exactly-once
//! claiming, and translation of provider events into settlements.

pub mod reconciler;
pub mod signature;

pub use reconciler::{ReconcileError, ReconcileOutcome, Reconciler};
