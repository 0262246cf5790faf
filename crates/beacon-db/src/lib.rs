//! Database layer for Beacon.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! embedded SQL migrations, and helpers for reading rows generically as JSON.
//! Every table used by the background layer is created through versioned
//! migrations managed by this crate: the event queue, notification rules,
//! the referenced domain records, the monitored tables that agents replicate,
//! and the hub's agent and cursor bookkeeping.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: one file per deployment, concurrent readers
//!   with a single writer. Queue claims take an immediate write transaction
//!   so that competing workers serialise on the write lock.
//! - **`r2d2` connection pool**: bounded connection reuse shared by the
//!   consumers and the HTTP handlers.
//! - **Commit hooks on queue pools**: [`create_queue_pool`] reports every
//!   committed `event_queue` insert, including rows written by triggers, so
//!   idle consumers wake without waiting for their poll.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!` and cannot drift from the code that depends on them.

mod json;
mod migrations;
mod pool;

pub use json::{query_rows_as_json, row_to_json, sql_value_from_json};
pub use migrations::{run_migrations, MigrationError};
pub use pool::{
    create_pool, create_queue_pool, DbPool, DbRuntimeSettings, PoolError, QueueInsertListener,
    QUEUE_TABLE,
};
