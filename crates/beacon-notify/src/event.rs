use crate::NotifyError;
use beacon_types::names;
use beacon_types::{from_properties, NotificationSendProperties, QueueEvent, ResourceRef};

/// A queued event as the notification engine sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    /// A domain change that may match notification rules.
    Trigger { name: String, resource: ResourceRef },
    /// One resolved recipient of a matched rule.
    Send(NotificationSendProperties),
    /// A rule was updated or deleted.
    RuleChanged { rule_id: Option<String> },
}

impl NotificationEvent {
    pub fn parse(event: &QueueEvent) -> Result<Self, NotifyError> {
        match event.name.as_str() {
            names::NOTIFICATION_SEND => Ok(Self::Send(from_properties(&event.properties)?)),
            names::NOTIFICATION_UPDATE | names::NOTIFICATION_DELETE => Ok(Self::RuleChanged {
                rule_id: event.property("id").map(str::to_string),
            }),
            name if names::NOTIFICATION_TRIGGERS.contains(&name) => Ok(Self::Trigger {
                name: name.to_string(),
                resource: from_properties(&event.properties)?,
            }),
            other => Err(NotifyError::UnknownEvent(other.to_string())),
        }
    }
}
