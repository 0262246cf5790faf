//! Shared types for the Beacon background layer.
//!
//! This crate holds the queue row shape, the catalogue of event names the
//! background consumers understand, typed views over the string-keyed event
//! properties, notification rule and team specifications, and the wire types
//! exchanged between agents and the hub.
//!
//! Nothing in here touches the database or the network. Every other crate in
//! the workspace depends on `beacon-types` for cross-cutting definitions,
//! which keeps the dependency graph flat.

pub mod event;
pub mod notification;
pub mod payload;
pub mod upstream;

pub use event::{names, Properties, QueueEvent};
pub use notification::{CustomNotification, NotificationRule, Person, TeamSpec};
pub use payload::{
    from_properties, to_properties, NotificationSendProperties, PayloadError, ResourceKind,
    ResourceRef,
};
pub use upstream::{parse_labels, AgentStatus, PullResponse, PushData, Row, TableChanges, TableRows};
