//! Settlement: the atomic act of validating and applying a balance mutation
//! plus its journal entries.
//!
//! This module provides:
//! - The `settle()` primitive every spend path goes through
//! - Fee-split transfer orchestration for tips and gifts
//! - The journal-vs-balance auditor

pub mod audit;
pub mod engine;
pub mod transfer;

pub use audit::{AuditError, AuditReport, Auditor};
pub use engine::{
    ChargeOutcome, ClientKey, SettleOutcome, SettleRequest, SettlementEngine, SettlementError,
    TransferOutcome,
};
pub use transfer::{TransferService, PLATFORM_OWNER};
