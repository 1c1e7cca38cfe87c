//! Audit trail
//!
//! Every state transition emits an [`AuditEvent`] through an [`AuditSink`].
//! Persisting the trail is left to the embedding application; the default
//! sink writes structured `tracing` events under the `audit` target.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Upload,
    Download,
    SharedDownload,
    Delete,
    Revoke,
    Restore,
    SetExpiration,
    Lock,
    Unlock,
    SetDownloadLimit,
    ShareLinkCreated,
    AccessRequested,
    AccessGranted,
    IntegrityCheck,
    SystemIntegrityCheck,
    Scan,
    Quarantine,
    ExpirySweep,
}

/// How it ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    /// A gate refused the operation
    Blocked,
    Failure,
}

/// One audit record
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    pub file_id: Option<Uuid>,
    pub outcome: AuditOutcome,
    pub details: Value,
}

impl AuditEvent {
    /// Successful event with no details
    pub fn new(actor: impl Into<String>, action: AuditAction, file_id: Option<Uuid>) -> Self {
        AuditEvent {
            at: Utc::now(),
            actor: actor.into(),
            action,
            file_id,
            outcome: AuditOutcome::Success,
            details: Value::Null,
        }
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Destination for audit events
pub trait AuditSink: Send + Sync {
    /// Record one event. Must not block for long.
    fn record(&self, event: AuditEvent);
}

/// Writes audit events as `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(
            target: "audit",
            actor = %event.actor,
            action = ?event.action,
            file_id = ?event.file_id,
            outcome = ?event.outcome,
            details = %event.details,
            "audit event"
        );
    }
}

/// Keeps audit events in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Events for one file, oldest first
    pub fn for_file(&self, file_id: &Uuid) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.file_id.as_ref() == Some(file_id))
            .cloned()
            .collect()
    }

    /// Whether an event with this action and outcome was recorded
    pub fn contains(&self, action: AuditAction, outcome: AuditOutcome) -> bool {
        self.events
            .lock()
            .iter()
            .any(|e| e.action == action && e.outcome == outcome)
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_sink_filters_by_file() {
        let sink = MemoryAuditSink::new();
        let id = Uuid::new_v4();

        sink.record(AuditEvent::new("alice", AuditAction::Upload, Some(id)));
        sink.record(
            AuditEvent::new("alice", AuditAction::Download, Some(id))
                .outcome(AuditOutcome::Blocked)
                .details(json!({ "reason": "revoked" })),
        );
        sink.record(AuditEvent::new("bob", AuditAction::Upload, None));

        let events = sink.for_file(&id);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].details["reason"], "revoked");
        assert!(sink.contains(AuditAction::Download, AuditOutcome::Blocked));
        assert!(!sink.contains(AuditAction::Delete, AuditOutcome::Success));
    }

    #[test]
    fn test_event_serializes_snake_case() {
        let event = AuditEvent::new("admin", AuditAction::SystemIntegrityCheck, None);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["action"], "system_integrity_check");
        assert_eq!(value["outcome"], "success");
    }
}
