use crate::notifier::QueueNotifier;
use crate::store::{self, NewEvent};
use crate::QueueError;
use beacon_db::{create_queue_pool, DbPool, DbRuntimeSettings, PoolError};
use beacon_types::QueueEvent;
use rusqlite::Connection;
use std::sync::Arc;

/// Shared handle to the durable queue: the pool plus the wake-up notifier.
///
/// Cheap to clone. A queue built with [`EventQueue::open`] announces every
/// insert committed through its pool, trigger and raw SQL inserts included.
/// One built over an existing pool only announces its own enqueues.
#[derive(Clone)]
pub struct EventQueue {
    pool: DbPool,
    notifier: QueueNotifier,
    hooked: bool,
}

impl EventQueue {
    pub fn new(pool: DbPool) -> Self {
        Self::with_notifier(pool, QueueNotifier::default())
    }

    pub fn with_notifier(pool: DbPool, notifier: QueueNotifier) -> Self {
        Self {
            pool,
            notifier,
            hooked: false,
        }
    }

    /// Opens a pool on `db_path` whose commits wake this queue's consumers.
    pub fn open(db_path: &str, settings: DbRuntimeSettings) -> Result<Self, PoolError> {
        let notifier = QueueNotifier::default();
        let announcer = notifier.clone();
        let pool = create_queue_pool(
            db_path,
            settings,
            Arc::new(move |_inserted| announcer.notify_unnamed()),
        )?;
        Ok(Self {
            pool,
            notifier,
            hooked: true,
        })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn notifier(&self) -> &QueueNotifier {
        &self.notifier
    }

    /// Inserts one event and wakes consumers watching its name.
    pub async fn enqueue(&self, event: NewEvent) -> Result<QueueEvent, QueueError> {
        let inserted = self
            .with_conn(move |conn| store::enqueue(conn, &event))
            .await?;
        if !self.hooked {
            self.notifier.notify(&inserted.name);
        }
        Ok(inserted)
    }

    /// Inserts several events in one transaction; either all land or none.
    pub async fn enqueue_all(&self, events: Vec<NewEvent>) -> Result<Vec<QueueEvent>, QueueError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let inserted = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let inserted = events
                    .iter()
                    .map(|event| store::enqueue(&tx, event))
                    .collect::<Result<Vec<_>, _>>()?;
                tx.commit()?;
                Ok(inserted)
            })
            .await?;

        if !self.hooked {
            for event in &inserted {
                self.notifier.notify(&event.name);
            }
        }
        Ok(inserted)
    }

    /// Runs blocking work on a pooled connection off the async runtime.
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, QueueError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut *conn)
        })
        .await?
    }
}
