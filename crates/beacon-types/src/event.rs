//! The persisted queue row and the event names consumed by the background layer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// String-keyed event payload. Ordered so that serialised rows are stable.
pub type Properties = BTreeMap<String, String>;

/// A unit of deferred, at-least-once work stored as a row in `event_queue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEvent {
    /// Identifier generated at insert.
    pub id: Uuid,
    /// Event kind, e.g. `notification.send`.
    pub name: String,
    /// Event-specific payload.
    pub properties: Properties,
    /// Message of the last failed attempt, if any.
    pub error: Option<String>,
    /// Number of failed processing attempts.
    pub attempts: i64,
    /// Higher priorities are drained first.
    pub priority: i64,
}

impl QueueEvent {
    /// Returns a property value, if present.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Event names recognised by the consumers in this workspace.
pub mod names {
    pub const NOTIFICATION_SEND: &str = "notification.send";
    pub const NOTIFICATION_UPDATE: &str = "notification.update";
    pub const NOTIFICATION_DELETE: &str = "notification.delete";

    pub const INCIDENT_CREATED: &str = "incident.created";
    pub const INCIDENT_STATUS_OPEN: &str = "incident.status.open";
    pub const INCIDENT_STATUS_CLOSED: &str = "incident.status.closed";
    pub const INCIDENT_STATUS_MITIGATED: &str = "incident.status.mitigated";
    pub const INCIDENT_STATUS_RESOLVED: &str = "incident.status.resolved";
    pub const INCIDENT_STATUS_INVESTIGATING: &str = "incident.status.investigating";
    pub const INCIDENT_STATUS_CANCELLED: &str = "incident.status.cancelled";
    pub const INCIDENT_RESPONDER_ADDED: &str = "incident.responder.added";
    pub const INCIDENT_RESPONDER_REMOVED: &str = "incident.responder.removed";
    pub const INCIDENT_COMMENT_ADDED: &str = "incident.comment.added";
    pub const INCIDENT_DOD_ADDED: &str = "incident.dod.added";
    pub const INCIDENT_DOD_PASSED: &str = "incident.dod.passed";
    pub const INCIDENT_DOD_REGRESSED: &str = "incident.dod.regressed";

    pub const CHECK_PASSED: &str = "check.passed";
    pub const CHECK_FAILED: &str = "check.failed";

    pub const PUSH_QUEUE_CREATE: &str = "push_queue.create";

    /// Events owned by the responder consumer, which runs the notification
    /// fan-out for them once the outside systems have been told.
    pub const RESPONDER_EVENTS: &[&str] = &[INCIDENT_RESPONDER_ADDED, INCIDENT_COMMENT_ADDED];

    /// Domain events that may trigger a notification.
    pub const NOTIFICATION_TRIGGERS: &[&str] = &[
        INCIDENT_CREATED,
        INCIDENT_STATUS_OPEN,
        INCIDENT_STATUS_CLOSED,
        INCIDENT_STATUS_MITIGATED,
        INCIDENT_STATUS_RESOLVED,
        INCIDENT_STATUS_INVESTIGATING,
        INCIDENT_STATUS_CANCELLED,
        INCIDENT_RESPONDER_ADDED,
        INCIDENT_RESPONDER_REMOVED,
        INCIDENT_COMMENT_ADDED,
        INCIDENT_DOD_ADDED,
        INCIDENT_DOD_PASSED,
        INCIDENT_DOD_REGRESSED,
        CHECK_PASSED,
        CHECK_FAILED,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_lookup() {
        let event = QueueEvent {
            id: Uuid::new_v4(),
            name: names::INCIDENT_CREATED.to_string(),
            properties: Properties::from([("id".to_string(), "inc-1".to_string())]),
            error: None,
            attempts: 0,
            priority: 0,
        };

        assert_eq!(event.property("id"), Some("inc-1"));
        assert_eq!(event.property("missing"), None);
    }

    #[test]
    fn trigger_list_has_no_duplicates() {
        let mut seen = std::collections::HashSet::new();
        for name in names::NOTIFICATION_TRIGGERS {
            assert!(seen.insert(*name), "duplicate trigger {name}");
        }
        assert!(!names::NOTIFICATION_TRIGGERS.contains(&names::NOTIFICATION_SEND));
    }
}
