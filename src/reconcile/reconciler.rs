//! Translates verified provider events into settlements, exactly once.
//!
//! The flow per delivery: claim the event id, dispatch on event type,
//! record the outcome. The claim happens before any balance mutation, so a
//! repeat delivery of the same id short-circuits on the dedup row. Handler
//! failures are recorded (never thrown away) and keep the payload snapshot
//! for a manual replay; the settlements inside are keyed by the event id,
//! so even a replay of a half-processed event cannot credit twice.

use crate::db::repo::ProviderEventClaim;
use crate::db::Repository;
use crate::domain::{AccountKind, EntryType, EventStatus, OwnerId, ProviderEvent, Tokens};
use crate::settlement::{ClientKey, SettleRequest, SettlementEngine};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Event {0} not found")]
    EventNotFound(String),
    #[error("Event {id} is {status}; only failed events can be replayed")]
    NotReplayable { id: String, status: EventStatus },
    #[error("Stored payload for event {id} no longer parses: {detail}")]
    InvalidSnapshot { id: String, detail: String },
    #[error("Reconcile failed: {0}")]
    Db(#[from] sqlx::Error),
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Handled and settled in this call.
    Processed,
    /// The event id was claimed by an earlier delivery; nothing mutated.
    Duplicate {
        status: EventStatus,
        detail: Option<String>,
    },
    /// Claimed by this call, but handling failed; recorded for replay.
    Failed { detail: String },
}

pub struct Reconciler {
    repo: Arc<Repository>,
    engine: Arc<SettlementEngine>,
}

impl Reconciler {
    pub fn new(repo: Arc<Repository>, engine: Arc<SettlementEngine>) -> Self {
        Self { repo, engine }
    }

    /// Process one verified provider event.
    ///
    /// Returns `Ok` for every claimed event, including handler failures —
    /// the caller acknowledges the delivery once the outcome is durable,
    /// and only an infrastructure error (nothing recorded) bubbles up.
    pub async fn process(&self, event: &ProviderEvent) -> Result<ReconcileOutcome, ReconcileError> {
        let snapshot = serde_json::to_string(event).unwrap_or_default();

        match self
            .repo
            .claim_provider_event(&event.id, &event.event_type, &snapshot)
            .await?
        {
            ProviderEventClaim::AlreadyClaimed { status, detail } => {
                info!(event_id = %event.id, status = %status.as_str(), "Duplicate provider event");
                Ok(ReconcileOutcome::Duplicate { status, detail })
            }
            ProviderEventClaim::New => self.handle_claimed(event).await,
        }
    }

    /// Re-run a failed event from its stored payload snapshot.
    pub async fn replay(&self, event_id: &str) -> Result<ReconcileOutcome, ReconcileError> {
        let record = self
            .repo
            .get_provider_event(event_id)
            .await?
            .ok_or_else(|| ReconcileError::EventNotFound(event_id.to_string()))?;

        // Processed events must never re-run; `processing` is allowed so an
        // event orphaned by a crash mid-handling can be completed.
        if record.status == EventStatus::Processed {
            return Err(ReconcileError::NotReplayable {
                id: event_id.to_string(),
                status: record.status,
            });
        }

        let event: ProviderEvent = serde_json::from_str(&record.payload_snapshot).map_err(|e| {
            ReconcileError::InvalidSnapshot {
                id: event_id.to_string(),
                detail: e.to_string(),
            }
        })?;

        // A failed event's settlement never committed, but it may have
        // stored an insufficient-funds outcome under the event-scoped key;
        // clear it so the replay re-executes instead of replaying the
        // failure. A `processing` event keeps its key: if its settlement
        // did commit before the crash, the replay must observe it.
        if record.status == EventStatus::Failed {
            if let Ok((owner, _)) = extract_owner_and_amount(&event) {
                self.repo
                    .forget_client_request(&format!("evt:{}", event.id), owner.as_str())
                    .await?;
            }
        }

        self.handle_claimed(&event).await
    }

    async fn handle_claimed(
        &self,
        event: &ProviderEvent,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        match self.dispatch(event).await {
            Ok(()) => {
                self.repo
                    .record_event_outcome(&event.id, EventStatus::Processed, None)
                    .await?;
                info!(event_id = %event.id, event_type = %event.event_type, "Provider event processed");
                Ok(ReconcileOutcome::Processed)
            }
            Err(detail) => {
                warn!(event_id = %event.id, detail = %detail, "Provider event handling failed");
                self.repo
                    .record_event_outcome(&event.id, EventStatus::Failed, Some(&detail))
                    .await?;
                Ok(ReconcileOutcome::Failed { detail })
            }
        }
    }

    async fn dispatch(&self, event: &ProviderEvent) -> Result<(), String> {
        match event.event_type.as_str() {
            "purchase.completed" => self.handle_purchase_completed(event).await,
            "purchase.refunded" => self.handle_purchase_refunded(event).await,
            other => Err(format!("unhandled event type: {}", other)),
        }
    }

    /// A completed token purchase: mint the tokens onto the buyer's balance
    /// as a single external-credit journal row.
    async fn handle_purchase_completed(&self, event: &ProviderEvent) -> Result<(), String> {
        let (owner, amount) = extract_owner_and_amount(event)?;

        let account = self
            .repo
            .get_or_create_account(&owner, AccountKind::User)
            .await
            .map_err(|e| format!("account lookup failed: {}", e))?;

        self.engine
            .settle(SettleRequest {
                entry_type: EntryType::Purchase,
                from: None,
                to: Some(account.id),
                amount,
                reference: Some(event.id.clone()),
                idempotency_key: Some(event_key(event, &owner)),
            })
            .await
            .map_err(|e| format!("settle failed: {}", e))?;
        Ok(())
    }

    /// A provider-side refund: claw the tokens back off the buyer's balance
    /// as a single external-debit row. Fails (recorded, replayable) when the
    /// buyer has already spent them.
    async fn handle_purchase_refunded(&self, event: &ProviderEvent) -> Result<(), String> {
        let (owner, amount) = extract_owner_and_amount(event)?;

        let account = self
            .repo
            .get_account(&owner, AccountKind::User)
            .await
            .map_err(|e| format!("account lookup failed: {}", e))?
            .ok_or_else(|| format!("no account for owner {}", owner))?;

        self.engine
            .settle(SettleRequest {
                entry_type: EntryType::Refund,
                from: Some(account.id),
                to: None,
                amount,
                reference: Some(event.id.clone()),
                idempotency_key: Some(event_key(event, &owner)),
            })
            .await
            .map_err(|e| format!("settle failed: {}", e))?;
        Ok(())
    }
}

/// Settlement idempotency key scoped to the event id, so a replay of a
/// failed event whose settle actually committed replays the stored outcome
/// instead of mutating again.
fn event_key(event: &ProviderEvent, owner: &OwnerId) -> ClientKey {
    ClientKey {
        key: format!("evt:{}", event.id),
        principal: owner.as_str().to_string(),
    }
}

fn extract_owner_and_amount(event: &ProviderEvent) -> Result<(OwnerId, Tokens), String> {
    let owner = event
        .data
        .get("owner_id")
        .and_then(|v| v.as_str())
        .ok_or("payload missing owner_id")?;
    let tokens = event
        .data
        .get("tokens")
        .and_then(|v| v.as_i64())
        .ok_or("payload missing tokens")?;
    if tokens <= 0 {
        return Err(format!("non-positive token amount: {}", tokens));
    }
    Ok((OwnerId::new(owner), Tokens::new(tokens)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repo::test_support::setup_test_db;
    use crate::notify::NoopNotifier;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (Reconciler, Arc<Repository>, TempDir) {
        let (repo, temp) = setup_test_db().await;
        let repo = Arc::new(repo);
        let engine = Arc::new(SettlementEngine::new(
            repo.clone(),
            Arc::new(NoopNotifier),
            60_000,
        ));
        (Reconciler::new(repo.clone(), engine), repo, temp)
    }

    fn purchase_event(id: &str, owner: &str, tokens: i64) -> ProviderEvent {
        ProviderEvent {
            id: id.to_string(),
            event_type: "purchase.completed".to_string(),
            data: json!({ "owner_id": owner, "tokens": tokens }),
        }
    }

    #[tokio::test]
    async fn test_purchase_credits_exactly_once() {
        let (reconciler, repo, _temp) = setup().await;
        let event = purchase_event("evt-1", "buyer", 500);

        let first = reconciler.process(&event).await.unwrap();
        assert_eq!(first, ReconcileOutcome::Processed);

        for _ in 0..3 {
            let outcome = reconciler.process(&event).await.unwrap();
            assert!(matches!(
                outcome,
                ReconcileOutcome::Duplicate {
                    status: EventStatus::Processed,
                    ..
                }
            ));
        }

        assert_eq!(
            repo.read_balance(&OwnerId::new("buyer")).await.unwrap(),
            Some(Tokens::new(500))
        );
        let entries = repo.entries_for_reference("evt-1").await.unwrap();
        assert_eq!(entries.len(), 1, "one journal row per external credit");
    }

    #[tokio::test]
    async fn test_refund_debits_buyer() {
        let (reconciler, repo, _temp) = setup().await;
        reconciler
            .process(&purchase_event("evt-1", "buyer", 500))
            .await
            .unwrap();

        let refund = ProviderEvent {
            id: "evt-2".to_string(),
            event_type: "purchase.refunded".to_string(),
            data: json!({ "owner_id": "buyer", "tokens": 200 }),
        };
        let outcome = reconciler.process(&refund).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Processed);

        assert_eq!(
            repo.read_balance(&OwnerId::new("buyer")).await.unwrap(),
            Some(Tokens::new(300))
        );
    }

    #[tokio::test]
    async fn test_unknown_type_recorded_failed() {
        let (reconciler, repo, _temp) = setup().await;
        let event = ProviderEvent {
            id: "evt-1".to_string(),
            event_type: "subscription.renewed".to_string(),
            data: json!({}),
        };

        let outcome = reconciler.process(&event).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Failed { .. }));

        // The dedup row survives the failure.
        let record = repo.get_provider_event("evt-1").await.unwrap().unwrap();
        assert_eq!(record.status, EventStatus::Failed);
        assert!(record.detail.unwrap().contains("subscription.renewed"));
    }

    #[tokio::test]
    async fn test_failed_refund_is_replayable() {
        let (reconciler, repo, _temp) = setup().await;
        reconciler
            .process(&purchase_event("evt-1", "buyer", 100))
            .await
            .unwrap();

        // Refund exceeds the remaining balance: recorded failed, no mutation.
        let refund = ProviderEvent {
            id: "evt-2".to_string(),
            event_type: "purchase.refunded".to_string(),
            data: json!({ "owner_id": "buyer", "tokens": 400 }),
        };
        let outcome = reconciler.process(&refund).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Failed { .. }));
        assert_eq!(
            repo.read_balance(&OwnerId::new("buyer")).await.unwrap(),
            Some(Tokens::new(100))
        );

        // Top up, then replay from the stored snapshot.
        reconciler
            .process(&purchase_event("evt-3", "buyer", 400))
            .await
            .unwrap();
        let outcome = reconciler.replay("evt-2").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Processed);
        assert_eq!(
            repo.read_balance(&OwnerId::new("buyer")).await.unwrap(),
            Some(Tokens::new(100))
        );
    }

    #[tokio::test]
    async fn test_processed_event_cannot_replay() {
        let (reconciler, _repo, _temp) = setup().await;
        reconciler
            .process(&purchase_event("evt-1", "buyer", 100))
            .await
            .unwrap();

        let err = reconciler.replay("evt-1").await.unwrap_err();
        assert!(matches!(err, ReconcileError::NotReplayable { .. }));
        assert!(err.to_string().contains("processed"));
    }

    #[tokio::test]
    async fn test_replay_of_unknown_event() {
        let (reconciler, _repo, _temp) = setup().await;
        let result = reconciler.replay("evt-missing").await;
        assert!(matches!(result, Err(ReconcileError::EventNotFound(_))));
    }

    #[tokio::test]
    async fn test_malformed_payload_recorded_failed() {
        let (reconciler, repo, _temp) = setup().await;
        let event = ProviderEvent {
            id: "evt-1".to_string(),
            event_type: "purchase.completed".to_string(),
            data: json!({ "owner_id": "buyer" }),
        };

        let outcome = reconciler.process(&event).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Failed { .. }));
        assert_eq!(repo.read_balance(&OwnerId::new("buyer")).await.unwrap(), None);
    }
}
