//! Notification matching, fan-out and delivery.
//!
//! [`NotificationEngine`] is the queue processor behind two consumers: one
//! watches domain trigger events and rule updates, the other delivers the
//! `notification.send` events the first one produces. Responder and comment
//! events go through [`ResponderProcessor`] first, which tells the outside
//! systems and then runs the same fan-out.

pub mod cache;
mod engine;
pub mod env;
mod error;
pub mod event;
pub mod responder;
pub mod rules;
pub mod templater;
pub mod transport;

pub use engine::{
    plan_sends, resolve_delivery, send_consumer_config, trigger_consumer_config, NotificationEngine,
};
pub use env::{build_env, DomainLoader, EvalEnv, SqlDomainLoader};
pub use error::NotifyError;
pub use event::NotificationEvent;
pub use responder::{
    responder_consumer_config, Responder, ResponderClient, ResponderError, ResponderProcessor,
};
pub use rules::RuleStore;
pub use templater::Templater;
pub use transport::{Delivery, HttpTransport, Transport, TransportError};
