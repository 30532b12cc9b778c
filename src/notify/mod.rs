//! Best-effort post-commit notifications.
//!
//! Settlements fire these after their transaction commits. Delivery is
//! never allowed to roll back or fail a financial mutation: the engine
//! spawns delivery onto its own task and only logs failures.

use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// A user-facing event produced by a committed settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    TipReceived {
        recipient_owner: String,
        amount: i64,
        reference: String,
    },
    GiftReceived {
        recipient_owner: String,
        amount: i64,
        reference: String,
    },
    SessionEnded {
        session_id: String,
        reason: String,
    },
    WithdrawalResolved {
        withdrawal_id: String,
        status: String,
    },
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Sink returned status {0}")]
    Status(u16),
}

/// Notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Discards notifications. Default when no sink URL is configured, and the
/// sink used throughout tests.
#[derive(Debug, Default, Clone)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        debug!(?notification, "Dropping notification (no sink configured)");
        Ok(())
    }
}

/// Posts notifications as JSON to a configured sink URL, with bounded
/// exponential backoff on transient failures.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    sink_url: String,
}

impl HttpNotifier {
    pub fn new(sink_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            sink_url,
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(10)),
            ..Default::default()
        };

        retry(backoff, || async {
            let response = self
                .client
                .post(&self.sink_url)
                .json(&notification)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(NotifyError::Network(e.to_string())))?;

            let status = response.status();
            if status.is_server_error() {
                return Err(backoff::Error::transient(NotifyError::Status(
                    status.as_u16(),
                )));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(NotifyError::Status(
                    status.as_u16(),
                )));
            }
            Ok(())
        })
        .await
    }
}
