//! Connection pool creation and per-connection setup.
//!
//! Every pooled connection runs in WAL mode with foreign keys on and the
//! configured busy timeout. A queue pool additionally watches its own
//! commits: SQLite reports row changes per connection, so any insert into
//! `event_queue` made through the pool is seen, whether it came from the
//! queue API, a change-capture trigger or a plain SQL writer.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::hooks::Action;
use rusqlite::{Connection, OpenFlags};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Table whose inserts are reported to a [`QueueInsertListener`].
pub const QUEUE_TABLE: &str = "event_queue";

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// Busy timeout for SQLite connections, in milliseconds. Competing queue
    /// claims wait up to this long for the write lock.
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 16,
        }
    }
}

/// A type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Called with the number of `event_queue` rows a pooled connection is
/// committing.
///
/// Runs inside SQLite's commit hook, before the commit is final, so it must
/// not touch the database. A reader that takes the write lock afterwards
/// waits for the commit and sees the rows.
pub type QueueInsertListener = Arc<dyn Fn(usize) + Send + Sync>;

/// Errors that can occur when creating the database pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Failed to build the connection pool.
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Creates a pool of configured connections to `db_path`.
///
/// `:memory:` gives every pooled connection its own private database, so
/// anything that shares state across connections (the queue, the consumers)
/// needs a file.
///
/// # Errors
///
/// Returns `PoolError::PoolInit` if the pool cannot be built, including when
/// the first connection fails its setup.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    build_pool(db_path, settings, None)
}

/// Creates a pool whose connections report committed `event_queue` inserts
/// to `listener`.
pub fn create_queue_pool(
    db_path: &str,
    settings: DbRuntimeSettings,
    listener: QueueInsertListener,
) -> Result<DbPool, PoolError> {
    build_pool(db_path, settings, Some(listener))
}

fn build_pool(
    db_path: &str,
    settings: DbRuntimeSettings,
    listener: Option<QueueInsertListener>,
) -> Result<DbPool, PoolError> {
    let watches_queue = listener.is_some();
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| {
            configure_connection(conn, settings)?;
            if let Some(listener) = &listener {
                watch_queue_inserts(conn, Arc::clone(listener));
            }
            Ok(())
        });

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)?;

    tracing::debug!(
        path = db_path,
        pool_max_size = settings.pool_max_size,
        busy_timeout_ms = settings.busy_timeout_ms,
        watches_queue,
        "created database pool"
    );

    Ok(pool)
}

fn configure_connection(conn: &Connection, settings: DbRuntimeSettings) -> rusqlite::Result<()> {
    let journal_mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    // In-memory databases stay in "memory" mode.
    if !journal_mode.eq_ignore_ascii_case("wal") && journal_mode != "memory" {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal_mode stayed {journal_mode}, expected wal")),
        ));
    }
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(Duration::from_millis(settings.busy_timeout_ms))
}

/// Counts queue inserts per transaction and hands the count to `listener`
/// on commit. A rollback discards the count.
fn watch_queue_inserts(conn: &Connection, listener: QueueInsertListener) {
    let pending = Arc::new(AtomicUsize::new(0));

    let inserted = Arc::clone(&pending);
    conn.update_hook(Some(
        move |action: Action, _db: &str, table: &str, _rowid: i64| {
            if action == Action::SQLITE_INSERT && table == QUEUE_TABLE {
                inserted.fetch_add(1, Ordering::Relaxed);
            }
        },
    ));

    let committed = Arc::clone(&pending);
    conn.commit_hook(Some(move || {
        let count = committed.swap(0, Ordering::Relaxed);
        if count > 0 {
            listener(count);
        }
        false
    }));

    conn.rollback_hook(Some(move || {
        pending.store(0, Ordering::Relaxed);
    }));
}
