//! The settlement engine: the single atomic debit/credit primitive.
//!
//! Every spend path in the system — tips, gifts, call charges, purchases,
//! refunds, withdrawal holds and releases — is a `settle` (or one of its two
//! specialized variants) with a different entry type and account pair. Each
//! call is one database transaction: lock the touched account rows in
//! ascending-id order, check the balance, apply the deltas with a
//! write-time-rechecked conditional update, append the matching journal
//! rows, commit. Side effects fire only after commit and can never fail the
//! settlement.

use crate::db::repo::ClientRequestClaim;
use crate::db::Repository;
use crate::domain::{
    Account, AccountId, EndReason, EntryType, MeteredSession, NewLedgerEntry, SessionState,
    TimeMs, Tokens,
};
use crate::notify::{Notification, Notifier};
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SettlementError {
    /// Expected and user-facing; callers must not retry.
    #[error("Insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: Tokens, requested: Tokens },
    /// The account was frozen by the auditor; debits are blocked.
    #[error("Account {0} is frozen")]
    AccountFrozen(AccountId),
    #[error("Account {0} is disabled")]
    AccountDisabled(AccountId),
    #[error("Account {0} not found")]
    AccountNotFound(AccountId),
    #[error("Invalid amount: {0}")]
    InvalidAmount(Tokens),
    #[error("Settlement must touch at least one account")]
    NoAccounts,
    #[error("Debit and credit account are the same")]
    SameAccount,
    /// Another request holds this idempotency key and has not completed.
    #[error("A request with this idempotency key is already in flight")]
    RequestInFlight,
    /// Transient infrastructure failure; safe to retry only with the same
    /// idempotency key.
    #[error("Settlement failed: {0}")]
    Failed(#[from] sqlx::Error),
}

/// Identity of a retryable client request: caller-supplied key, scoped by
/// operation and principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKey {
    pub key: String,
    pub principal: String,
}

/// One settlement to perform.
#[derive(Debug, Clone)]
pub struct SettleRequest {
    pub entry_type: EntryType,
    /// Debited account; `None` for an external credit (tokens entering the
    /// system), which produces a single journal row.
    pub from: Option<AccountId>,
    /// Credited account; `None` for an external debit (tokens leaving).
    pub to: Option<AccountId>,
    pub amount: Tokens,
    /// Links the journal rows of this settlement; an external event id or
    /// session id when the caller has one, otherwise generated.
    pub reference: Option<String>,
    pub idempotency_key: Option<ClientKey>,
}

/// Result of a committed settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleOutcome {
    pub journal_ref: String,
    pub amount: Tokens,
    pub from_balance: Option<Tokens>,
    pub to_balance: Option<Tokens>,
    /// True when this outcome was replayed from a stored idempotent result
    /// rather than executed.
    #[serde(default, skip_serializing)]
    pub duplicate: bool,
}

/// Result of a committed fee-split transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    pub journal_ref: String,
    pub net_amount: Tokens,
    pub fee_amount: Tokens,
    pub sender_balance: Tokens,
    pub recipient_balance: Tokens,
    #[serde(default, skip_serializing)]
    pub duplicate: bool,
}

/// Result of charging a metered session for due intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeOutcome {
    pub intervals_billed: i64,
    pub charged: Tokens,
    /// The session transitioned to `ended/out_of_funds` in this charge.
    pub session_ended: bool,
    /// An overlapping invocation advanced the session first; nothing was
    /// charged.
    pub skipped: bool,
}

/// The outcome stored under a client idempotency key. Insufficient funds is
/// a replayable outcome, not a transient failure.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
enum StoredOutcome<T> {
    Ok { outcome: T },
    InsufficientFunds { balance: Tokens, requested: Tokens },
}

pub struct SettlementEngine {
    repo: Arc<Repository>,
    notifier: Arc<dyn Notifier>,
    interval_ms: i64,
}

impl SettlementEngine {
    pub fn new(repo: Arc<Repository>, notifier: Arc<dyn Notifier>, interval_ms: i64) -> Self {
        Self {
            repo,
            notifier,
            interval_ms,
        }
    }

    pub fn repo(&self) -> &Arc<Repository> {
        &self.repo
    }

    /// Billing interval length in milliseconds.
    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    /// Perform one settlement, idempotently when a client key is supplied.
    pub async fn settle(&self, req: SettleRequest) -> Result<SettleOutcome, SettlementError> {
        if !req.amount.is_positive() {
            return Err(SettlementError::InvalidAmount(req.amount));
        }
        if req.from.is_none() && req.to.is_none() {
            return Err(SettlementError::NoAccounts);
        }
        if req.from.is_some() && req.from == req.to {
            return Err(SettlementError::SameAccount);
        }

        let operation = req.entry_type.as_str();
        if let Some(key) = &req.idempotency_key {
            match self
                .repo
                .claim_client_request(&key.key, operation, &key.principal)
                .await?
            {
                ClientRequestClaim::New => {}
                ClientRequestClaim::Completed(json) => {
                    return replay_stored::<SettleOutcome>(&json);
                }
                ClientRequestClaim::InFlight => return Err(SettlementError::RequestInFlight),
            }
        }

        let result = self.settle_inner(&req).await;
        if let Some(key) = &req.idempotency_key {
            self.store_or_release(key, operation, &result).await?;
        }
        result
    }

    async fn settle_inner(&self, req: &SettleRequest) -> Result<SettleOutcome, SettlementError> {
        let journal_ref = req
            .reference
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = TimeMs::now();

        let mut tx = self.repo.begin().await?;
        let accounts = lock_accounts(
            &mut tx,
            req.from.iter().chain(req.to.iter()).copied().collect(),
        )
        .await?;

        let mut entries = Vec::with_capacity(2);
        let mut from_balance = None;
        let mut to_balance = None;

        if let Some(from_id) = req.from {
            let account = &accounts[&from_id];
            check_debitable(account)?;
            let balance_after =
                apply_debit(&mut tx, account, req.amount, now).await?;
            from_balance = Some(balance_after);
            entries.push(NewLedgerEntry {
                account_id: from_id,
                entry_type: req.entry_type,
                signed_amount: -req.amount.as_i64(),
                balance_after,
                reference_id: journal_ref.clone(),
                idempotency_key: req.idempotency_key.as_ref().map(|k| k.key.clone()),
            });
        }

        if let Some(to_id) = req.to {
            let account = &accounts[&to_id];
            Repository::credit_account_tx(&mut tx, to_id, req.amount, now).await?;
            let balance_after = account
                .balance
                .checked_add(req.amount)
                .ok_or(SettlementError::InvalidAmount(req.amount))?;
            to_balance = Some(balance_after);
            entries.push(NewLedgerEntry {
                account_id: to_id,
                entry_type: req.entry_type,
                signed_amount: req.amount.as_i64(),
                balance_after,
                reference_id: journal_ref.clone(),
                idempotency_key: req.idempotency_key.as_ref().map(|k| k.key.clone()),
            });
        }

        Repository::append_entries_tx(&mut tx, &entries, now).await?;
        tx.commit().await?;

        info!(
            journal_ref = %journal_ref,
            entry_type = %req.entry_type,
            amount = %req.amount,
            "Settlement committed"
        );

        Ok(SettleOutcome {
            journal_ref,
            amount: req.amount,
            from_balance,
            to_balance,
            duplicate: false,
        })
    }

    /// Fee-split transfer: sender pays `gross`; the recipient receives the
    /// net and the platform account receives the fee, all in one
    /// transaction under one journal reference.
    ///
    /// The journal shape is two balanced pairs (sender→recipient net at the
    /// caller's entry type, sender→platform fee as `platform_fee`), so each
    /// logical transfer still conserves pairwise.
    pub async fn settle_transfer(
        &self,
        entry_type: EntryType,
        sender: AccountId,
        recipient: AccountId,
        platform: AccountId,
        gross: Tokens,
        fee: Tokens,
        idempotency_key: Option<ClientKey>,
    ) -> Result<TransferOutcome, SettlementError> {
        if !gross.is_positive() || fee > gross || fee < Tokens::ZERO {
            return Err(SettlementError::InvalidAmount(gross));
        }
        if sender == recipient {
            return Err(SettlementError::SameAccount);
        }

        let operation = entry_type.as_str();
        if let Some(key) = &idempotency_key {
            match self
                .repo
                .claim_client_request(&key.key, operation, &key.principal)
                .await?
            {
                ClientRequestClaim::New => {}
                ClientRequestClaim::Completed(json) => {
                    return replay_stored::<TransferOutcome>(&json);
                }
                ClientRequestClaim::InFlight => return Err(SettlementError::RequestInFlight),
            }
        }

        let result = self
            .transfer_inner(entry_type, sender, recipient, platform, gross, fee, &idempotency_key)
            .await;
        if let Some(key) = &idempotency_key {
            self.store_or_release(key, operation, &result).await?;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn transfer_inner(
        &self,
        entry_type: EntryType,
        sender: AccountId,
        recipient: AccountId,
        platform: AccountId,
        gross: Tokens,
        fee: Tokens,
        idempotency_key: &Option<ClientKey>,
    ) -> Result<TransferOutcome, SettlementError> {
        let net = gross
            .checked_sub(fee)
            .ok_or(SettlementError::InvalidAmount(gross))?;
        let journal_ref = uuid::Uuid::new_v4().to_string();
        let now = TimeMs::now();
        let key = idempotency_key.as_ref().map(|k| k.key.clone());

        let mut tx = self.repo.begin().await?;
        let accounts = lock_accounts(&mut tx, vec![sender, recipient, platform]).await?;

        let sender_account = &accounts[&sender];
        check_debitable(sender_account)?;
        let sender_balance = apply_debit(&mut tx, sender_account, gross, now).await?;

        Repository::credit_account_tx(&mut tx, recipient, net, now).await?;
        let recipient_balance = accounts[&recipient]
            .balance
            .checked_add(net)
            .ok_or(SettlementError::InvalidAmount(net))?;

        let mut entries = vec![
            NewLedgerEntry {
                account_id: sender,
                entry_type,
                signed_amount: -net.as_i64(),
                balance_after: sender_balance
                    .checked_add(fee)
                    .ok_or(SettlementError::InvalidAmount(fee))?,
                reference_id: journal_ref.clone(),
                idempotency_key: key.clone(),
            },
            NewLedgerEntry {
                account_id: recipient,
                entry_type,
                signed_amount: net.as_i64(),
                balance_after: recipient_balance,
                reference_id: journal_ref.clone(),
                idempotency_key: key.clone(),
            },
        ];

        if fee.is_positive() {
            Repository::credit_account_tx(&mut tx, platform, fee, now).await?;
            let platform_balance = accounts[&platform]
                .balance
                .checked_add(fee)
                .ok_or(SettlementError::InvalidAmount(fee))?;
            entries.push(NewLedgerEntry {
                account_id: sender,
                entry_type: EntryType::PlatformFee,
                signed_amount: -fee.as_i64(),
                balance_after: sender_balance,
                reference_id: journal_ref.clone(),
                idempotency_key: key.clone(),
            });
            entries.push(NewLedgerEntry {
                account_id: platform,
                entry_type: EntryType::PlatformFee,
                signed_amount: fee.as_i64(),
                balance_after: platform_balance,
                reference_id: journal_ref.clone(),
                idempotency_key: key,
            });
        }

        Repository::append_entries_tx(&mut tx, &entries, now).await?;
        tx.commit().await?;

        info!(
            journal_ref = %journal_ref,
            entry_type = %entry_type,
            gross = %gross,
            fee = %fee,
            "Transfer committed"
        );

        Ok(TransferOutcome {
            journal_ref,
            net_amount: net,
            fee_amount: fee,
            sender_balance,
            recipient_balance,
            duplicate: false,
        })
    }

    /// Charge a connected session for up to `intervals_due` whole intervals.
    ///
    /// Bills the affordable number of intervals (one debit/credit journal
    /// pair per interval), advances the billing watermark with a
    /// compare-and-swap, and — when fewer intervals than due were
    /// affordable — transitions the session to `ended/out_of_funds`; all in
    /// one transaction. A lost CAS rolls everything back, which is what
    /// makes a slow tick overlapping the next one safe.
    pub async fn charge_session(
        &self,
        session_id: &str,
        intervals_due: i64,
        now: TimeMs,
    ) -> Result<ChargeOutcome, SettlementError> {
        if intervals_due <= 0 {
            return Ok(ChargeOutcome {
                intervals_billed: 0,
                charged: Tokens::ZERO,
                session_ended: false,
                skipped: true,
            });
        }

        let mut tx = self.repo.begin().await?;

        // Re-read inside the transaction; the scheduler's scan snapshot may
        // be stale by the time this session is reached.
        let session = match Repository::get_session_tx(&mut tx, session_id).await? {
            Some(s) if s.state == SessionState::Connected => s,
            _ => {
                tx.rollback().await?;
                return Ok(ChargeOutcome {
                    intervals_billed: 0,
                    charged: Tokens::ZERO,
                    session_ended: false,
                    skipped: true,
                });
            }
        };

        let rate = session.rate_per_interval;
        if !rate.is_positive() {
            tx.rollback().await?;
            return Err(SettlementError::InvalidAmount(rate));
        }
        let last_billed_at = session
            .last_billed_at
            .unwrap_or(session.connected_at.unwrap_or(session.created_at));
        let due = crate::domain::elapsed_intervals(last_billed_at, now, self.interval_ms)
            .min(intervals_due);

        let accounts = lock_accounts(
            &mut tx,
            vec![session.payer_account_id, session.payee_account_id],
        )
        .await?;
        let payer = &accounts[&session.payer_account_id];
        let payee = &accounts[&session.payee_account_id];

        let affordable = if payer.can_spend() {
            payer.balance.as_i64() / rate.as_i64()
        } else {
            0
        };
        let billed = due.min(affordable);
        let charged = rate
            .checked_mul(billed)
            .ok_or(SettlementError::InvalidAmount(rate))?;

        if billed > 0 {
            if !Repository::debit_account_tx(&mut tx, payer.id, charged, now).await? {
                // Balance moved under us despite the lock-order discipline.
                tx.rollback().await?;
                return Err(SettlementError::InsufficientFunds {
                    balance: payer.balance,
                    requested: charged,
                });
            }
            Repository::credit_account_tx(&mut tx, payee.id, charged, now).await?;

            let mut entries = Vec::with_capacity((billed * 2) as usize);
            for i in 1..=billed {
                let step = rate
                    .checked_mul(i)
                    .ok_or(SettlementError::InvalidAmount(rate))?;
                entries.push(NewLedgerEntry {
                    account_id: payer.id,
                    entry_type: EntryType::CallCharge,
                    signed_amount: -rate.as_i64(),
                    balance_after: payer
                        .balance
                        .checked_sub(step)
                        .ok_or(SettlementError::InvalidAmount(step))?,
                    reference_id: session.id.clone(),
                    idempotency_key: None,
                });
                entries.push(NewLedgerEntry {
                    account_id: payee.id,
                    entry_type: EntryType::CallCharge,
                    signed_amount: rate.as_i64(),
                    balance_after: payee
                        .balance
                        .checked_add(step)
                        .ok_or(SettlementError::InvalidAmount(step))?,
                    reference_id: session.id.clone(),
                    idempotency_key: None,
                });
            }
            Repository::append_entries_tx(&mut tx, &entries, now).await?;

            let new_watermark = TimeMs::new(last_billed_at.as_ms() + billed * self.interval_ms);
            let advanced = Repository::advance_session_billing_tx(
                &mut tx,
                &session.id,
                last_billed_at,
                new_watermark,
                charged,
            )
            .await?;
            if !advanced {
                tx.rollback().await?;
                return Ok(ChargeOutcome {
                    intervals_billed: 0,
                    charged: Tokens::ZERO,
                    session_ended: false,
                    skipped: true,
                });
            }
        }

        let session_ended = if billed < due {
            Repository::end_session_tx(&mut tx, &session.id, EndReason::OutOfFunds, now).await?
        } else {
            false
        };

        tx.commit().await?;

        if billed > 0 {
            info!(
                session_id = %session.id,
                intervals = billed,
                charged = %charged,
                "Session intervals billed"
            );
        }
        if session_ended {
            warn!(session_id = %session.id, "Session ended: out of funds");
            self.notify_best_effort(Notification::SessionEnded {
                session_id: session.id.clone(),
                reason: EndReason::OutOfFunds.as_str().to_string(),
            });
        }

        Ok(ChargeOutcome {
            intervals_billed: billed,
            charged,
            session_ended,
            skipped: false,
        })
    }

    /// Bill any completed intervals, then end a session on explicit hangup.
    pub async fn end_session(
        &self,
        session: &MeteredSession,
        now: TimeMs,
    ) -> Result<ChargeOutcome, SettlementError> {
        let mut outcome = ChargeOutcome {
            intervals_billed: 0,
            charged: Tokens::ZERO,
            session_ended: false,
            skipped: false,
        };

        if session.state == SessionState::Connected {
            if let Some(last) = session.last_billed_at {
                let due = crate::domain::elapsed_intervals(last, now, self.interval_ms);
                if due > 0 {
                    outcome = self.charge_session(&session.id, due, now).await?;
                }
            }
            if !outcome.session_ended && self.repo.end_session(&session.id, EndReason::Completed, now).await? {
                outcome.session_ended = true;
                self.notify_best_effort(Notification::SessionEnded {
                    session_id: session.id.clone(),
                    reason: EndReason::Completed.as_str().to_string(),
                });
            }
        }

        Ok(outcome)
    }

    /// Fire a notification after commit. Failures are logged and swallowed;
    /// a settlement's result never depends on its side effects.
    pub fn notify_best_effort(&self, notification: Notification) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(notification).await {
                warn!(error = %e, "Notification delivery failed");
            }
        });
    }

    async fn store_or_release<T: Serialize>(
        &self,
        key: &ClientKey,
        operation: &str,
        result: &Result<T, SettlementError>,
    ) -> Result<(), SettlementError> {
        let stored = match result {
            Ok(outcome) => Some(StoredOutcome::Ok { outcome }),
            Err(SettlementError::InsufficientFunds { balance, requested }) => {
                Some(StoredOutcome::InsufficientFunds {
                    balance: *balance,
                    requested: *requested,
                })
            }
            Err(_) => None,
        };

        match stored {
            Some(outcome) => {
                let json = serde_json::to_string(&outcome)
                    .map_err(|e| SettlementError::Failed(sqlx::Error::Decode(Box::new(e))))?;
                self.repo
                    .complete_client_request(&key.key, operation, &key.principal, &json)
                    .await?;
            }
            None => {
                self.repo
                    .release_client_request(&key.key, operation, &key.principal)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Read all involved account rows in ascending-id order.
///
/// The ascending order is the global lock-ordering discipline that keeps
/// opposite-direction transfers from deadlocking.
async fn lock_accounts(
    tx: &mut Transaction<'static, Sqlite>,
    mut ids: Vec<AccountId>,
) -> Result<HashMap<AccountId, Account>, SettlementError> {
    ids.sort();
    ids.dedup();

    let mut accounts = HashMap::with_capacity(ids.len());
    for id in ids {
        let account = Repository::lock_account_tx(tx, id)
            .await?
            .ok_or(SettlementError::AccountNotFound(id))?;
        accounts.insert(id, account);
    }
    Ok(accounts)
}

fn check_debitable(account: &Account) -> Result<(), SettlementError> {
    if account.frozen {
        return Err(SettlementError::AccountFrozen(account.id));
    }
    if account.disabled {
        return Err(SettlementError::AccountDisabled(account.id));
    }
    Ok(())
}

/// Debit with the write-time balance recheck; returns the balance after.
async fn apply_debit(
    tx: &mut Transaction<'static, Sqlite>,
    account: &Account,
    amount: Tokens,
    now: TimeMs,
) -> Result<Tokens, SettlementError> {
    if account.balance < amount {
        return Err(SettlementError::InsufficientFunds {
            balance: account.balance,
            requested: amount,
        });
    }
    if !Repository::debit_account_tx(tx, account.id, amount, now).await? {
        return Err(SettlementError::InsufficientFunds {
            balance: account.balance,
            requested: amount,
        });
    }
    account
        .balance
        .checked_sub(amount)
        .ok_or(SettlementError::InvalidAmount(amount))
}

fn replay_stored<T>(json: &str) -> Result<T, SettlementError>
where
    T: for<'de> Deserialize<'de> + Replayable,
{
    let stored: StoredOutcome<T> = serde_json::from_str(json)
        .map_err(|e| SettlementError::Failed(sqlx::Error::Decode(Box::new(e))))?;
    match stored {
        StoredOutcome::Ok { outcome } => Ok(outcome.into_duplicate()),
        StoredOutcome::InsufficientFunds { balance, requested } => {
            Err(SettlementError::InsufficientFunds { balance, requested })
        }
    }
}

pub(crate) trait Replayable {
    fn into_duplicate(self) -> Self;
}

impl Replayable for SettleOutcome {
    fn into_duplicate(mut self) -> Self {
        self.duplicate = true;
        self
    }
}

impl Replayable for TransferOutcome {
    fn into_duplicate(mut self) -> Self {
        self.duplicate = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repo::test_support::setup_test_db;
    use crate::domain::AccountKind;
    use crate::domain::OwnerId;
    use crate::notify::NoopNotifier;
    use tempfile::TempDir;

    const INTERVAL_MS: i64 = 60_000;

    async fn setup_engine() -> (SettlementEngine, Arc<Repository>, TempDir) {
        let (repo, temp) = setup_test_db().await;
        let repo = Arc::new(repo);
        let engine =
            SettlementEngine::new(repo.clone(), Arc::new(NoopNotifier), INTERVAL_MS);
        (engine, repo, temp)
    }

    async fn funded_account(
        engine: &SettlementEngine,
        repo: &Repository,
        owner: &str,
        balance: i64,
    ) -> AccountId {
        let account = repo
            .get_or_create_account(&OwnerId::new(owner), AccountKind::User)
            .await
            .unwrap();
        if balance > 0 {
            engine
                .settle(SettleRequest {
                    entry_type: EntryType::Purchase,
                    from: None,
                    to: Some(account.id),
                    amount: Tokens::new(balance),
                    reference: None,
                    idempotency_key: None,
                })
                .await
                .unwrap();
        }
        account.id
    }

    #[tokio::test]
    async fn test_external_credit_single_row() {
        let (engine, repo, _temp) = setup_engine().await;
        let id = funded_account(&engine, &repo, "buyer", 0).await;

        let outcome = engine
            .settle(SettleRequest {
                entry_type: EntryType::Purchase,
                from: None,
                to: Some(id),
                amount: Tokens::new(500),
                reference: Some("evt-1".to_string()),
                idempotency_key: None,
            })
            .await
            .unwrap();

        assert_eq!(outcome.to_balance, Some(Tokens::new(500)));
        let rows = repo.entries_for_reference("evt-1").await.unwrap();
        assert_eq!(rows.len(), 1, "external credit is a single journal row");
        assert_eq!(rows[0].signed_amount, 500);
    }

    #[tokio::test]
    async fn test_transfer_conserves() {
        let (engine, repo, _temp) = setup_engine().await;
        let a = funded_account(&engine, &repo, "a", 100).await;
        let b = funded_account(&engine, &repo, "b", 0).await;

        let outcome = engine
            .settle(SettleRequest {
                entry_type: EntryType::Tip,
                from: Some(a),
                to: Some(b),
                amount: Tokens::new(30),
                reference: None,
                idempotency_key: None,
            })
            .await
            .unwrap();

        assert_eq!(outcome.from_balance, Some(Tokens::new(70)));
        assert_eq!(outcome.to_balance, Some(Tokens::new(30)));

        let rows = repo.entries_for_reference(&outcome.journal_ref).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().map(|e| e.signed_amount).sum::<i64>(), 0);
    }

    #[tokio::test]
    async fn test_insufficient_funds_rolls_back_everything() {
        let (engine, repo, _temp) = setup_engine().await;
        let a = funded_account(&engine, &repo, "a", 20).await;
        let b = funded_account(&engine, &repo, "b", 0).await;

        let result = engine
            .settle(SettleRequest {
                entry_type: EntryType::Tip,
                from: Some(a),
                to: Some(b),
                amount: Tokens::new(30),
                reference: None,
                idempotency_key: None,
            })
            .await;

        match result {
            Err(SettlementError::InsufficientFunds { balance, requested }) => {
                assert_eq!(balance, Tokens::new(20));
                assert_eq!(requested, Tokens::new(30));
            }
            other => panic!("expected InsufficientFunds, got {:?}", other),
        }

        assert_eq!(repo.reconstruct_balance(a).await.unwrap(), Tokens::new(20));
        assert_eq!(repo.reconstruct_balance(b).await.unwrap(), Tokens::ZERO);
    }

    #[tokio::test]
    async fn test_concurrent_debits_exactly_one_succeeds() {
        // Balance 50, two concurrent tips of 30 to the same
        // recipient. Exactly one lands; the journal holds exactly 2 rows.
        let (engine, repo, _temp) = setup_engine().await;
        let a = funded_account(&engine, &repo, "a", 50).await;
        let b = funded_account(&engine, &repo, "b", 0).await;
        let engine = Arc::new(engine);

        let mut handles = Vec::new();
        for _ in 0..2 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .settle(SettleRequest {
                        entry_type: EntryType::Tip,
                        from: Some(a),
                        to: Some(b),
                        amount: Tokens::new(30),
                        reference: None,
                        idempotency_key: None,
                    })
                    .await
            }));
        }

        let mut successes = 0;
        let mut insufficient = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(SettlementError::InsufficientFunds { .. }) => insufficient += 1,
                Err(e) => panic!("unexpected error: {:?}", e),
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(insufficient, 1);
        assert_eq!(repo.read_balance(&OwnerId::new("a")).await.unwrap(), Some(Tokens::new(20)));
        assert_eq!(repo.read_balance(&OwnerId::new("b")).await.unwrap(), Some(Tokens::new(30)));

        let history = repo.history(a, 100, None).await.unwrap();
        let tip_rows: Vec<_> = history
            .iter()
            .filter(|e| e.entry_type == EntryType::Tip)
            .collect();
        assert_eq!(tip_rows.len(), 1, "one debit row on the sender");
    }

    #[tokio::test]
    async fn test_many_concurrent_debits_never_overdraw() {
        let (engine, repo, _temp) = setup_engine().await;
        let a = funded_account(&engine, &repo, "a", 100).await;
        let b = funded_account(&engine, &repo, "b", 0).await;
        let engine = Arc::new(engine);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .settle(SettleRequest {
                        entry_type: EntryType::Tip,
                        from: Some(a),
                        to: Some(b),
                        amount: Tokens::new(60),
                        reference: None,
                        idempotency_key: None,
                    })
                    .await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                // Losers must see the expected error, not a lock failure.
                Err(SettlementError::InsufficientFunds { .. }) => {}
                Err(e) => panic!("unexpected error: {:?}", e),
            }
        }

        // 100 covers exactly one debit of 60.
        assert_eq!(successes, 1);
        let balance = repo.read_balance(&OwnerId::new("a")).await.unwrap().unwrap();
        assert_eq!(balance, Tokens::new(40));
        assert!(balance >= Tokens::ZERO);
    }

    #[tokio::test]
    async fn test_idempotent_retry_returns_stored_outcome() {
        let (engine, repo, _temp) = setup_engine().await;
        let id = funded_account(&engine, &repo, "buyer", 0).await;

        let key = ClientKey {
            key: "req-1".to_string(),
            principal: "buyer".to_string(),
        };
        let req = SettleRequest {
            entry_type: EntryType::Purchase,
            from: None,
            to: Some(id),
            amount: Tokens::new(100),
            reference: None,
            idempotency_key: Some(key),
        };

        let first = engine.settle(req.clone()).await.unwrap();
        assert!(!first.duplicate);

        let second = engine.settle(req).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(second.journal_ref, first.journal_ref);
        assert_eq!(second.to_balance, first.to_balance);

        // One balance change, not two.
        assert_eq!(
            repo.read_balance(&OwnerId::new("buyer")).await.unwrap(),
            Some(Tokens::new(100))
        );
    }

    #[tokio::test]
    async fn test_insufficient_funds_outcome_is_replayed() {
        let (engine, repo, _temp) = setup_engine().await;
        let a = funded_account(&engine, &repo, "a", 10).await;
        let b = funded_account(&engine, &repo, "b", 0).await;

        let req = SettleRequest {
            entry_type: EntryType::Tip,
            from: Some(a),
            to: Some(b),
            amount: Tokens::new(30),
            reference: None,
            idempotency_key: Some(ClientKey {
                key: "req-1".to_string(),
                principal: "a".to_string(),
            }),
        };

        for _ in 0..2 {
            match engine.settle(req.clone()).await {
                Err(SettlementError::InsufficientFunds { balance, .. }) => {
                    assert_eq!(balance, Tokens::new(10));
                }
                other => panic!("expected InsufficientFunds, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_frozen_account_cannot_spend_but_can_receive() {
        let (engine, repo, _temp) = setup_engine().await;
        let a = funded_account(&engine, &repo, "a", 100).await;
        let b = funded_account(&engine, &repo, "b", 0).await;
        repo.freeze_account(a).await.unwrap();

        let debit = engine
            .settle(SettleRequest {
                entry_type: EntryType::Tip,
                from: Some(a),
                to: Some(b),
                amount: Tokens::new(10),
                reference: None,
                idempotency_key: None,
            })
            .await;
        assert!(matches!(debit, Err(SettlementError::AccountFrozen(_))));

        let credit = engine
            .settle(SettleRequest {
                entry_type: EntryType::Purchase,
                from: None,
                to: Some(a),
                amount: Tokens::new(10),
                reference: None,
                idempotency_key: None,
            })
            .await;
        assert!(credit.is_ok());
    }

    #[tokio::test]
    async fn test_settle_rejects_bad_requests() {
        let (engine, repo, _temp) = setup_engine().await;
        let a = funded_account(&engine, &repo, "a", 100).await;

        let zero = engine
            .settle(SettleRequest {
                entry_type: EntryType::Tip,
                from: Some(a),
                to: None,
                amount: Tokens::ZERO,
                reference: None,
                idempotency_key: None,
            })
            .await;
        assert!(matches!(zero, Err(SettlementError::InvalidAmount(_))));

        let self_transfer = engine
            .settle(SettleRequest {
                entry_type: EntryType::Tip,
                from: Some(a),
                to: Some(a),
                amount: Tokens::new(10),
                reference: None,
                idempotency_key: None,
            })
            .await;
        assert!(matches!(self_transfer, Err(SettlementError::SameAccount)));

        // Neither side named: nothing to settle, not a silent no-op.
        let accountless = engine
            .settle(SettleRequest {
                entry_type: EntryType::Tip,
                from: None,
                to: None,
                amount: Tokens::new(10),
                reference: None,
                idempotency_key: None,
            })
            .await;
        assert!(matches!(accountless, Err(SettlementError::NoAccounts)));

        let missing = engine
            .settle(SettleRequest {
                entry_type: EntryType::Tip,
                from: Some(AccountId::new(9999)),
                to: Some(a),
                amount: Tokens::new(10),
                reference: None,
                idempotency_key: None,
            })
            .await;
        assert!(matches!(missing, Err(SettlementError::AccountNotFound(_))));
    }

    #[tokio::test]
    async fn test_fee_split_transfer_journal_shape() {
        let (engine, repo, _temp) = setup_engine().await;
        let sender = funded_account(&engine, &repo, "sender", 100).await;
        let recipient = funded_account(&engine, &repo, "recipient", 0).await;
        let platform = repo
            .get_or_create_account(&OwnerId::new("platform"), AccountKind::Platform)
            .await
            .unwrap()
            .id;

        let outcome = engine
            .settle_transfer(
                EntryType::Gift,
                sender,
                recipient,
                platform,
                Tokens::new(100),
                Tokens::new(20),
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.net_amount, Tokens::new(80));
        assert_eq!(outcome.fee_amount, Tokens::new(20));
        assert_eq!(outcome.sender_balance, Tokens::ZERO);
        assert_eq!(outcome.recipient_balance, Tokens::new(80));

        let rows = repo.entries_for_reference(&outcome.journal_ref).await.unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows.iter().map(|e| e.signed_amount).sum::<i64>(), 0);

        let gift_rows: Vec<_> = rows
            .iter()
            .filter(|e| e.entry_type == EntryType::Gift)
            .collect();
        assert_eq!(gift_rows.iter().map(|e| e.signed_amount).sum::<i64>(), 0);

        assert_eq!(repo.reconstruct_balance(platform).await.unwrap(), Tokens::new(20));
    }

    #[tokio::test]
    async fn test_fee_split_zero_fee_two_rows() {
        let (engine, repo, _temp) = setup_engine().await;
        let sender = funded_account(&engine, &repo, "sender", 50).await;
        let recipient = funded_account(&engine, &repo, "recipient", 0).await;
        let platform = repo
            .get_or_create_account(&OwnerId::new("platform"), AccountKind::Platform)
            .await
            .unwrap()
            .id;

        let outcome = engine
            .settle_transfer(
                EntryType::Tip,
                sender,
                recipient,
                platform,
                Tokens::new(50),
                Tokens::ZERO,
                None,
            )
            .await
            .unwrap();

        let rows = repo.entries_for_reference(&outcome.journal_ref).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_retried_transfer_does_not_double_charge() {
        let (engine, repo, _temp) = setup_engine().await;
        let sender = funded_account(&engine, &repo, "sender", 100).await;
        let recipient = funded_account(&engine, &repo, "recipient", 0).await;
        let platform = repo
            .get_or_create_account(&OwnerId::new("platform"), AccountKind::Platform)
            .await
            .unwrap()
            .id;

        let key = ClientKey {
            key: "gift-1".to_string(),
            principal: "sender".to_string(),
        };
        let first = engine
            .settle_transfer(
                EntryType::Gift,
                sender,
                recipient,
                platform,
                Tokens::new(40),
                Tokens::new(8),
                Some(key.clone()),
            )
            .await
            .unwrap();
        let second = engine
            .settle_transfer(
                EntryType::Gift,
                sender,
                recipient,
                platform,
                Tokens::new(40),
                Tokens::new(8),
                Some(key),
            )
            .await
            .unwrap();

        assert!(second.duplicate);
        assert_eq!(second.journal_ref, first.journal_ref);
        assert_eq!(
            repo.read_balance(&OwnerId::new("sender")).await.unwrap(),
            Some(Tokens::new(60))
        );
    }

    #[tokio::test]
    async fn test_charge_session_bills_due_intervals() {
        let (engine, repo, _temp) = setup_engine().await;
        let payer = funded_account(&engine, &repo, "payer", 100).await;
        let payee = funded_account(&engine, &repo, "payee", 0).await;

        let session = repo
            .create_session(payer, payee, Tokens::new(10))
            .await
            .unwrap();
        let t0 = TimeMs::new(0);
        repo.mark_session_connected(&session.id, t0).await.unwrap();

        let now = TimeMs::new(3 * INTERVAL_MS);
        let outcome = engine.charge_session(&session.id, 3, now).await.unwrap();

        assert_eq!(outcome.intervals_billed, 3);
        assert_eq!(outcome.charged, Tokens::new(30));
        assert!(!outcome.session_ended);

        let session = repo.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(session.accumulated_cost, Tokens::new(30));
        assert_eq!(session.last_billed_at, Some(TimeMs::new(3 * INTERVAL_MS)));

        // Per-interval journal granularity.
        let rows = repo.entries_for_reference(&session.id).await.unwrap();
        assert_eq!(rows.len(), 6);
        assert_eq!(rows.iter().map(|e| e.signed_amount).sum::<i64>(), 0);
    }

    #[tokio::test]
    async fn test_charge_session_partial_affordability_ends_session() {
        // Payer affords 2 of 5 due intervals: bill 2, end out_of_funds.
        let (engine, repo, _temp) = setup_engine().await;
        let payer = funded_account(&engine, &repo, "payer", 25).await;
        let payee = funded_account(&engine, &repo, "payee", 0).await;

        let session = repo
            .create_session(payer, payee, Tokens::new(10))
            .await
            .unwrap();
        repo.mark_session_connected(&session.id, TimeMs::new(0))
            .await
            .unwrap();

        let outcome = engine
            .charge_session(&session.id, 5, TimeMs::new(5 * INTERVAL_MS))
            .await
            .unwrap();

        assert_eq!(outcome.intervals_billed, 2);
        assert_eq!(outcome.charged, Tokens::new(20));
        assert!(outcome.session_ended);

        let session = repo.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Ended);
        assert_eq!(session.end_reason, Some(EndReason::OutOfFunds));
        assert_eq!(session.accumulated_cost, Tokens::new(20));
        assert_eq!(
            repo.read_balance(&OwnerId::new("payer")).await.unwrap(),
            Some(Tokens::new(5))
        );
    }

    #[tokio::test]
    async fn test_charge_session_skips_non_connected() {
        let (engine, repo, _temp) = setup_engine().await;
        let payer = funded_account(&engine, &repo, "payer", 100).await;
        let payee = funded_account(&engine, &repo, "payee", 0).await;

        let session = repo
            .create_session(payer, payee, Tokens::new(10))
            .await
            .unwrap();

        let outcome = engine
            .charge_session(&session.id, 1, TimeMs::new(INTERVAL_MS))
            .await
            .unwrap();
        assert!(outcome.skipped);
        assert_eq!(
            repo.read_balance(&OwnerId::new("payer")).await.unwrap(),
            Some(Tokens::new(100))
        );
    }

    #[tokio::test]
    async fn test_end_session_bills_completed_intervals_only() {
        let (engine, repo, _temp) = setup_engine().await;
        let payer = funded_account(&engine, &repo, "payer", 100).await;
        let payee = funded_account(&engine, &repo, "payee", 0).await;

        let session = repo
            .create_session(payer, payee, Tokens::new(10))
            .await
            .unwrap();
        repo.mark_session_connected(&session.id, TimeMs::new(0))
            .await
            .unwrap();
        let session = repo.get_session(&session.id).await.unwrap().unwrap();

        // 2.5 intervals elapsed: 2 billed, the partial one dropped.
        let outcome = engine
            .end_session(&session, TimeMs::new(INTERVAL_MS * 5 / 2))
            .await
            .unwrap();

        assert_eq!(outcome.intervals_billed, 2);
        assert!(outcome.session_ended);

        let session = repo.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Ended);
        assert_eq!(session.end_reason, Some(EndReason::Completed));
        assert_eq!(session.accumulated_cost, Tokens::new(20));
    }
}
