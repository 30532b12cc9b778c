//! Idempotency guard: two independent dedup domains.
//!
//! Both domains use the insert-with-unique-constraint pattern: the insert
//! either lands (the caller proceeds) or conflicts (the caller treats the
//! work as a duplicate). A check-then-insert would race under concurrent
//! identical requests; `rows_affected` on the conflict-tolerant insert is
//! what makes the claim atomic.

use super::Repository;
use crate::domain::{EventStatus, ProcessedProviderEvent, TimeMs};
use sqlx::Row;
use std::str::FromStr;
use tracing::warn;

/// Result of claiming a provider event id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEventClaim {
    /// The claim landed; this delivery owns the event.
    New,
    /// Another delivery already claimed the id; its outcome is attached.
    AlreadyClaimed {
        status: EventStatus,
        detail: Option<String>,
    },
}

/// Result of claiming a client idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequestClaim {
    /// The claim landed; this request owns the key.
    New,
    /// A prior request completed under this key; its stored outcome must be
    /// returned instead of re-executing.
    Completed(String),
    /// A prior request holds the key but has not completed yet.
    InFlight,
}

impl Repository {
    // =========================================================================
    // Provider-event domain
    // =========================================================================

    /// Claim an external provider event id.
    ///
    /// Providers retry on timeout, so a duplicate delivery is expected, not
    /// exceptional. The first delivery inserts the row (status
    /// `processing`); repeats read the existing row back and short-circuit
    /// before any balance mutation.
    pub async fn claim_provider_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload_snapshot: &str,
    ) -> Result<ProviderEventClaim, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_provider_events
            (event_id, event_type, status, detail, payload_snapshot, processed_at)
            VALUES (?, ?, 'processing', NULL, ?, ?)
            ON CONFLICT(event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(payload_snapshot)
        .bind(TimeMs::now().as_ms())
        .execute(self.pool())
        .await?;

        if result.rows_affected() > 0 {
            return Ok(ProviderEventClaim::New);
        }

        let row = sqlx::query(
            "SELECT status, detail FROM processed_provider_events WHERE event_id = ?",
        )
        .bind(event_id)
        .fetch_one(self.pool())
        .await?;

        let status_str: String = row.get("status");
        let status = EventStatus::from_str(&status_str).unwrap_or_else(|e| {
            warn!(event_id = %event_id, status = %status_str, error = %e, "Unknown event status in row");
            EventStatus::Failed
        });

        Ok(ProviderEventClaim::AlreadyClaimed {
            status,
            detail: row.get("detail"),
        })
    }

    /// Record the final outcome of a claimed provider event.
    ///
    /// Failures keep the dedup row — the next identical retry must still
    /// short-circuit, and the payload snapshot stays available for replay.
    pub async fn record_event_outcome(
        &self,
        event_id: &str,
        status: EventStatus,
        detail: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE processed_provider_events SET status = ?, detail = ?, processed_at = ? WHERE event_id = ?",
        )
        .bind(status.as_str())
        .bind(detail)
        .bind(TimeMs::now().as_ms())
        .bind(event_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Fetch a processed-event record (replay and inspection).
    pub async fn get_provider_event(
        &self,
        event_id: &str,
    ) -> Result<Option<ProcessedProviderEvent>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT event_id, event_type, status, detail, payload_snapshot, processed_at \
             FROM processed_provider_events WHERE event_id = ?",
        )
        .bind(event_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|r| {
            let status_str: String = r.get("status");
            let status = EventStatus::from_str(&status_str).unwrap_or(EventStatus::Failed);
            ProcessedProviderEvent {
                event_id: r.get("event_id"),
                event_type: r.get("event_type"),
                status,
                detail: r.get("detail"),
                payload_snapshot: r.get("payload_snapshot"),
                processed_at: TimeMs::new(r.get("processed_at")),
            }
        }))
    }

    // =========================================================================
    // Client-request domain
    // =========================================================================

    /// Claim a client idempotency key for (key, operation, principal).
    ///
    /// Purchase and withdrawal style endpoints let a client retry a
    /// timed-out request; the second attempt must observe the first
    /// attempt's outcome rather than re-execute.
    pub async fn claim_client_request(
        &self,
        key: &str,
        operation: &str,
        principal: &str,
    ) -> Result<ClientRequestClaim, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO client_requests (request_key, operation, principal, status, created_at)
            VALUES (?, ?, ?, 'pending', ?)
            ON CONFLICT(request_key, operation, principal) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(operation)
        .bind(principal)
        .bind(TimeMs::now().as_ms())
        .execute(self.pool())
        .await?;

        if result.rows_affected() > 0 {
            return Ok(ClientRequestClaim::New);
        }

        let row = sqlx::query(
            "SELECT status, response_json FROM client_requests \
             WHERE request_key = ? AND operation = ? AND principal = ?",
        )
        .bind(key)
        .bind(operation)
        .bind(principal)
        .fetch_one(self.pool())
        .await?;

        let status: String = row.get("status");
        match (status.as_str(), row.get::<Option<String>, _>("response_json")) {
            ("completed", Some(json)) => Ok(ClientRequestClaim::Completed(json)),
            _ => Ok(ClientRequestClaim::InFlight),
        }
    }

    /// Store the outcome for a claimed client request.
    ///
    /// Both success and insufficient-funds outcomes are stored; a retry
    /// replays either verbatim.
    pub async fn complete_client_request(
        &self,
        key: &str,
        operation: &str,
        principal: &str,
        response_json: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE client_requests SET status = 'completed', response_json = ? \
             WHERE request_key = ? AND operation = ? AND principal = ?",
        )
        .bind(response_json)
        .bind(key)
        .bind(operation)
        .bind(principal)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Drop every stored outcome under a key for one principal, whatever its
    /// status.
    ///
    /// Only for operator-driven replay of a failed provider event: the
    /// event's settlement stored an insufficient-funds outcome under its
    /// event-scoped key, and the replay must re-execute rather than replay
    /// that failure.
    pub async fn forget_client_request(
        &self,
        key: &str,
        principal: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM client_requests WHERE request_key = ? AND principal = ?")
            .bind(key)
            .bind(principal)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Drop a claim after a transient failure so the same key can retry and
    /// re-execute.
    pub async fn release_client_request(
        &self,
        key: &str,
        operation: &str,
        principal: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "DELETE FROM client_requests \
             WHERE request_key = ? AND operation = ? AND principal = ? AND status = 'pending'",
        )
        .bind(key)
        .bind(operation)
        .bind(principal)
        .execute(self.pool())
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::setup_test_db;
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_provider_event_claim_once() {
        let (repo, _temp) = setup_test_db().await;

        let claim = repo
            .claim_provider_event("evt-1", "purchase.completed", "{}")
            .await
            .unwrap();
        assert_eq!(claim, ProviderEventClaim::New);

        repo.record_event_outcome("evt-1", EventStatus::Processed, None)
            .await
            .unwrap();

        let claim = repo
            .claim_provider_event("evt-1", "purchase.completed", "{}")
            .await
            .unwrap();
        assert_eq!(
            claim,
            ProviderEventClaim::AlreadyClaimed {
                status: EventStatus::Processed,
                detail: None
            }
        );
    }

    #[tokio::test]
    async fn test_provider_event_failure_keeps_dedup_row() {
        let (repo, _temp) = setup_test_db().await;

        repo.claim_provider_event("evt-1", "purchase.refunded", "{}")
            .await
            .unwrap();
        repo.record_event_outcome("evt-1", EventStatus::Failed, Some("no funds"))
            .await
            .unwrap();

        let claim = repo
            .claim_provider_event("evt-1", "purchase.refunded", "{}")
            .await
            .unwrap();
        assert_eq!(
            claim,
            ProviderEventClaim::AlreadyClaimed {
                status: EventStatus::Failed,
                detail: Some("no funds".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_concurrent_provider_claims_single_winner() {
        let (repo, _temp) = setup_test_db().await;
        let repo = Arc::new(repo);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.claim_provider_event("evt-race", "purchase.completed", "{}")
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() == ProviderEventClaim::New {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "exactly one delivery may own the event");
    }

    #[tokio::test]
    async fn test_client_request_lifecycle() {
        let (repo, _temp) = setup_test_db().await;

        let claim = repo
            .claim_client_request("key-1", "purchase", "user-1")
            .await
            .unwrap();
        assert_eq!(claim, ClientRequestClaim::New);

        // Duplicate while the first attempt is still running.
        let claim = repo
            .claim_client_request("key-1", "purchase", "user-1")
            .await
            .unwrap();
        assert_eq!(claim, ClientRequestClaim::InFlight);

        repo.complete_client_request("key-1", "purchase", "user-1", r#"{"ok":true}"#)
            .await
            .unwrap();

        let claim = repo
            .claim_client_request("key-1", "purchase", "user-1")
            .await
            .unwrap();
        assert_eq!(
            claim,
            ClientRequestClaim::Completed(r#"{"ok":true}"#.to_string())
        );
    }

    #[tokio::test]
    async fn test_client_request_release_allows_retry() {
        let (repo, _temp) = setup_test_db().await;

        repo.claim_client_request("key-1", "withdrawal", "user-1")
            .await
            .unwrap();
        repo.release_client_request("key-1", "withdrawal", "user-1")
            .await
            .unwrap();

        let claim = repo
            .claim_client_request("key-1", "withdrawal", "user-1")
            .await
            .unwrap();
        assert_eq!(claim, ClientRequestClaim::New);
    }

    #[tokio::test]
    async fn test_key_scoped_by_operation_and_principal() {
        let (repo, _temp) = setup_test_db().await;

        repo.claim_client_request("key-1", "purchase", "user-1")
            .await
            .unwrap();

        let other_op = repo
            .claim_client_request("key-1", "withdrawal", "user-1")
            .await
            .unwrap();
        let other_user = repo
            .claim_client_request("key-1", "purchase", "user-2")
            .await
            .unwrap();

        assert_eq!(other_op, ClientRequestClaim::New);
        assert_eq!(other_user, ClientRequestClaim::New);
    }
}
