//! Provider events: the wire shape and the processed-event dedup record.

use crate::domain::TimeMs;
use serde::{Deserialize, Serialize};

/// An inbound event from the external payment provider, post-verification.
///
/// The provider's full wire format is not modeled here; the reconciler only
/// needs the event id, a type to dispatch on, and the payload fields its
/// handlers extract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
}

/// Processing outcome of a provider event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Claimed but not yet handled; transient, visible only if the process
    /// dies mid-handling.
    Processing,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Processing => "processing",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(EventStatus::Processing),
            "processed" => Ok(EventStatus::Processed),
            "failed" => Ok(EventStatus::Failed),
            other => Err(format!("unknown event status: {}", other)),
        }
    }
}

/// Dedup + audit record for one distinct provider event id.
///
/// Created exactly once per event id; repeat deliveries short-circuit on
/// this row before any balance mutation. Failed events keep their payload
/// snapshot so they can be replayed manually.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedProviderEvent {
    pub event_id: String,
    pub event_type: String,
    pub status: EventStatus,
    pub detail: Option<String>,
    pub payload_snapshot: String,
    pub processed_at: TimeMs,
}
