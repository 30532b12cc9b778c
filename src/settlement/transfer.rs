//! Tip and gift orchestration over the settlement engine.

use crate::db::Repository;
use crate::domain::{AccountKind, EntryType, OwnerId, Tokens};
use crate::notify::Notification;
use crate::settlement::engine::{ClientKey, SettlementEngine, SettlementError, TransferOutcome};
use std::sync::Arc;

/// Owner id under which the platform's own account lives.
pub const PLATFORM_OWNER: &str = "platform";

/// Thin orchestration for the two-account spend paths: resolve accounts,
/// compute the fee split, and hand one atomic fee-split settlement to the
/// engine under the caller's idempotency key.
pub struct TransferService {
    repo: Arc<Repository>,
    engine: Arc<SettlementEngine>,
    fee_bps: i64,
}

impl TransferService {
    pub fn new(repo: Arc<Repository>, engine: Arc<SettlementEngine>, fee_bps: i64) -> Self {
        Self {
            repo,
            engine,
            fee_bps,
        }
    }

    /// Send a tip or gift from `sender` to `recipient`.
    ///
    /// The platform fee (basis points of the gross amount, rounded down,
    /// possibly zero) is split out in the same settlement, so a retried
    /// request cannot double-charge the sender across the two legs.
    pub async fn send(
        &self,
        entry_type: EntryType,
        sender: &OwnerId,
        recipient: &OwnerId,
        amount: Tokens,
        idempotency_key: ClientKey,
    ) -> Result<TransferOutcome, SettlementError> {
        if sender == recipient {
            return Err(SettlementError::SameAccount);
        }

        let sender_account = self
            .repo
            .get_or_create_account(sender, AccountKind::User)
            .await?;
        let recipient_account = self
            .repo
            .get_or_create_account(recipient, AccountKind::User)
            .await?;
        let platform_account = self
            .repo
            .get_or_create_account(&OwnerId::new(PLATFORM_OWNER), AccountKind::Platform)
            .await?;

        let fee = amount.bps(self.fee_bps);
        let outcome = self
            .engine
            .settle_transfer(
                entry_type,
                sender_account.id,
                recipient_account.id,
                platform_account.id,
                amount,
                fee,
                Some(idempotency_key),
            )
            .await?;

        if !outcome.duplicate {
            let notification = match entry_type {
                EntryType::Gift => Notification::GiftReceived {
                    recipient_owner: recipient.as_str().to_string(),
                    amount: outcome.net_amount.as_i64(),
                    reference: outcome.journal_ref.clone(),
                },
                _ => Notification::TipReceived {
                    recipient_owner: recipient.as_str().to_string(),
                    amount: outcome.net_amount.as_i64(),
                    reference: outcome.journal_ref.clone(),
                },
            };
            self.engine.notify_best_effort(notification);
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repo::test_support::setup_test_db;
    use crate::notify::NoopNotifier;
    use crate::settlement::engine::SettleRequest;
    use tempfile::TempDir;

    async fn setup() -> (TransferService, Arc<Repository>, TempDir) {
        let (repo, temp) = setup_test_db().await;
        let repo = Arc::new(repo);
        let engine = Arc::new(SettlementEngine::new(
            repo.clone(),
            Arc::new(NoopNotifier),
            60_000,
        ));
        let service = TransferService::new(repo.clone(), engine, 2_000);
        (service, repo, temp)
    }

    async fn fund(repo: &Repository, service: &TransferService, owner: &str, amount: i64) {
        let account = repo
            .get_or_create_account(&OwnerId::new(owner), AccountKind::User)
            .await
            .unwrap();
        service
            .engine
            .settle(SettleRequest {
                entry_type: EntryType::Purchase,
                from: None,
                to: Some(account.id),
                amount: Tokens::new(amount),
                reference: None,
                idempotency_key: None,
            })
            .await
            .unwrap();
    }

    fn key(k: &str, principal: &str) -> ClientKey {
        ClientKey {
            key: k.to_string(),
            principal: principal.to_string(),
        }
    }

    #[tokio::test]
    async fn test_tip_with_default_fee() {
        let (service, repo, _temp) = setup().await;
        fund(&repo, &service, "sender", 100).await;

        let outcome = service
            .send(
                EntryType::Tip,
                &OwnerId::new("sender"),
                &OwnerId::new("creator"),
                Tokens::new(50),
                key("tip-1", "sender"),
            )
            .await
            .unwrap();

        // 20% platform fee on 50 tokens.
        assert_eq!(outcome.fee_amount, Tokens::new(10));
        assert_eq!(outcome.net_amount, Tokens::new(40));
        assert_eq!(
            repo.read_balance(&OwnerId::new("creator")).await.unwrap(),
            Some(Tokens::new(40))
        );
    }

    #[tokio::test]
    async fn test_self_tip_rejected() {
        let (service, repo, _temp) = setup().await;
        fund(&repo, &service, "sender", 100).await;

        let result = service
            .send(
                EntryType::Tip,
                &OwnerId::new("sender"),
                &OwnerId::new("sender"),
                Tokens::new(10),
                key("tip-1", "sender"),
            )
            .await;
        assert!(matches!(result, Err(SettlementError::SameAccount)));
    }

    #[tokio::test]
    async fn test_recipient_account_created_lazily() {
        let (service, repo, _temp) = setup().await;
        fund(&repo, &service, "sender", 100).await;

        assert!(repo
            .get_account(&OwnerId::new("newbie"), AccountKind::User)
            .await
            .unwrap()
            .is_none());

        service
            .send(
                EntryType::Gift,
                &OwnerId::new("sender"),
                &OwnerId::new("newbie"),
                Tokens::new(10),
                key("gift-1", "sender"),
            )
            .await
            .unwrap();

        assert!(repo
            .get_account(&OwnerId::new("newbie"), AccountKind::User)
            .await
            .unwrap()
            .is_some());
    }
}
