//! Agent to hub replication.
//!
//! Local writes to the monitored tables are captured as `push_queue.create`
//! events by triggers installed in the migrations. On an agent, the push
//! consumer groups those events per table, reads the current row for each
//! changed key (or a tombstone when the row is gone) and sends the batch to
//! the hub. The hub applies the batch under the agent's ownership and serves
//! reference data back through the pull endpoint.

pub mod agent;
pub mod client;
mod error;
pub mod group;
pub mod hub;
pub mod tables;

pub use agent::{
    apply_pull, pull_cursor, push_consumer_config, sync_from_upstream, UpstreamPushProcessor,
};
pub use client::{UpstreamClient, UpstreamConfig};
pub use error::UpstreamError;
pub use group::{batch_id, collect_push_data, group_changes_by_table, ChangeGroup, Grouped};
pub use hub::{agent_status, apply_push, pull_reference_data, ApplyOutcome};
pub use tables::{monitored_table, MonitoredTable, DEFAULT_REFERENCE_TABLES, MONITORED_TABLES};
