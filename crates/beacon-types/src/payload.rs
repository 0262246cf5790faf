//! Typed views over queue event properties.
//!
//! Events carry a flat `string -> string` map so that one envelope can hold
//! any payload. Consumers convert that map into a concrete struct at the
//! consumption boundary with [`from_properties`] and never index it by raw
//! key afterwards. Producers go the other way with [`to_properties`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::Properties;

/// Errors converting between typed payloads and property maps.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The payload did not serialise to a JSON object.
    #[error("payload must serialise to an object")]
    NotAnObject,

    /// A payload field was neither a string nor null.
    #[error("payload field '{0}' is not a string")]
    NonStringField(String),

    /// The property map could not be read as the requested payload.
    #[error("invalid event properties: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Flattens a serialisable struct into event properties.
///
/// `None` fields are dropped. Every other field must serialise to a string.
pub fn to_properties<T: Serialize>(value: &T) -> Result<Properties, PayloadError> {
    let Value::Object(map) = serde_json::to_value(value)? else {
        return Err(PayloadError::NotAnObject);
    };

    let mut properties = Properties::new();
    for (key, value) in map {
        match value {
            Value::Null => {}
            Value::String(s) => {
                properties.insert(key, s);
            }
            _ => return Err(PayloadError::NonStringField(key)),
        }
    }
    Ok(properties)
}

/// Reads event properties as a typed payload.
pub fn from_properties<T: DeserializeOwned>(properties: &Properties) -> Result<T, PayloadError> {
    let map: Map<String, Value> = properties
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    Ok(serde_json::from_value(Value::Object(map))?)
}

/// Payload of every domain trigger event: the id of the changed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub id: String,
}

/// Payload of a `notification.send` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSendProperties {
    /// Id of the resource the original event was about.
    pub id: String,
    /// Name of the original event this notification is for.
    pub event_name: String,
    /// Id of the notification rule that matched.
    pub notification_id: String,
    /// Person recipient.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person_id: Option<String>,
    /// Team recipient.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    /// Name of the team sub-notification or custom notification to use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_name: Option<String>,
}

/// The kind of record a trigger event points at.
///
/// Selected by event-name prefix; determines which objects are loaded into
/// the evaluation environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// `incident.created`, `incident.status.*`
    Incident,
    /// `check.*`
    Check,
    /// `incident.responder.*`
    Responder,
    /// `incident.comment.*`
    Comment,
    /// `incident.dod.*`
    Evidence,
}

impl ResourceKind {
    /// Resolves the resource kind for an event name.
    pub fn for_event(name: &str) -> Option<Self> {
        if name.starts_with("check.") {
            Some(Self::Check)
        } else if name == crate::names::INCIDENT_CREATED || name.starts_with("incident.status.") {
            Some(Self::Incident)
        } else if name.starts_with("incident.responder.") {
            Some(Self::Responder)
        } else if name.starts_with("incident.comment.") {
            Some(Self::Comment)
        } else if name.starts_with("incident.dod.") {
            Some(Self::Evidence)
        } else {
            None
        }
    }
}
