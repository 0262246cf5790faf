//! Synchronous queue operations on a single SQLite connection.
//!
//! SQLite has no row locks, so a claim is a single
//! `UPDATE ... WHERE seq = (SELECT ... LIMIT 1) RETURNING` executed inside a
//! `BEGIN IMMEDIATE` transaction. The write lock serializes competing
//! claimers; the claim itself is recorded in `locked_by` together with a
//! lease in `available_at`. A claimed row stays invisible until its lease
//! runs out, so a worker that dies mid-batch only delays its events.
//! A claimed row that cannot be decoded is parked in the same transaction:
//! it keeps its row and its error, and is never claimed again.

use crate::QueueError;
use beacon_types::{Properties, QueueEvent};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::time::Duration;
use uuid::Uuid;

const EVENT_COLUMNS: &str = "id, name, properties, error, attempts, priority";

/// An event waiting to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub name: String,
    pub properties: Properties,
    pub priority: i64,
}

impl NewEvent {
    pub fn new(name: impl Into<String>, properties: Properties) -> Self {
        Self {
            name: name.into(),
            properties,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Current wall-clock time in unix milliseconds, the unit of `available_at`.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `available_at` of parked rows; never reached, so never claimed again.
const PARKED_AT: i64 = i64::MAX;

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Row as stored, before the id and properties are parsed.
struct RawEvent {
    id: String,
    name: String,
    properties: String,
    error: Option<String>,
    attempts: i64,
    priority: i64,
}

impl RawEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            properties: row.get(2)?,
            error: row.get(3)?,
            attempts: row.get(4)?,
            priority: row.get(5)?,
        })
    }

    fn into_event(self) -> Result<QueueEvent, QueueError> {
        Ok(QueueEvent {
            id: Uuid::parse_str(&self.id)?,
            name: self.name,
            properties: serde_json::from_str(&self.properties)?,
            error: self.error,
            attempts: self.attempts,
            priority: self.priority,
        })
    }

    /// Decoding for inspection. Properties that cannot be decoded come back
    /// empty; a parked row's `error` already says why.
    fn into_inspected_event(self) -> Result<QueueEvent, QueueError> {
        Ok(QueueEvent {
            id: Uuid::parse_str(&self.id)?,
            name: self.name,
            properties: serde_json::from_str(&self.properties).unwrap_or_default(),
            error: self.error,
            attempts: self.attempts,
            priority: self.priority,
        })
    }
}

/// Inserts an event, immediately claimable.
pub fn enqueue(conn: &Connection, event: &NewEvent) -> Result<QueueEvent, QueueError> {
    let id = Uuid::new_v4();
    let properties = serde_json::to_string(&event.properties)?;
    conn.execute(
        "INSERT INTO event_queue (id, name, properties, priority) VALUES (?1, ?2, ?3, ?4)",
        params![id.to_string(), event.name, properties, event.priority],
    )?;

    Ok(QueueEvent {
        id,
        name: event.name.clone(),
        properties: event.properties.clone(),
        error: None,
        attempts: 0,
        priority: event.priority,
    })
}

/// Claims the next visible event whose name is in `names`.
///
/// Highest priority wins, ties go to the oldest row. The claim holds for
/// `lease`; after that the row becomes visible to other workers again.
/// Returns `None` when nothing is claimable, including when `names` is empty.
pub fn dequeue_one(
    conn: &mut Connection,
    names: &[String],
    worker: &str,
    lease: Duration,
) -> Result<Option<QueueEvent>, QueueError> {
    if names.is_empty() {
        return Ok(None);
    }

    let now = now_millis();
    let lease_until = now.saturating_add(duration_millis(lease));
    let placeholders = (0..names.len())
        .map(|i| format!("?{}", i + 4))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE event_queue
         SET locked_by = ?1,
             available_at = ?2,
             last_attempt = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE seq = (
             SELECT seq FROM event_queue
             WHERE available_at <= ?3 AND name IN ({placeholders})
             ORDER BY priority DESC, seq ASC
             LIMIT 1
         )
         RETURNING {EVENT_COLUMNS}"
    );

    let mut bound: Vec<&dyn ToSql> = Vec::with_capacity(names.len() + 3);
    bound.push(&worker);
    bound.push(&lease_until);
    bound.push(&now);
    for name in names {
        bound.push(name);
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let claimed = loop {
        let Some(raw) = tx
            .query_row(&sql, bound.as_slice(), RawEvent::from_row)
            .optional()?
        else {
            break None;
        };
        let id = raw.id.clone();
        match raw.into_event() {
            Ok(event) => break Some(event),
            Err(e) => park(&tx, &id, &e)?,
        }
    };
    tx.commit()?;

    Ok(claimed)
}

/// Takes a row that cannot be decoded out of circulation, keeping the reason
/// on the row for operators.
fn park(conn: &Connection, id: &str, reason: &QueueError) -> Result<(), QueueError> {
    tracing::warn!(event_id = %id, error = %reason, "parked undecodable event");
    conn.execute(
        "UPDATE event_queue
         SET error = ?1, attempts = attempts + 1, locked_by = NULL, available_at = ?2
         WHERE id = ?3",
        params![format!("undecodable event: {reason}"), PARKED_AT, id],
    )?;
    Ok(())
}

/// Records a failed attempt and releases the claim.
///
/// The event keeps its row, its `attempts` count goes up by one and it
/// becomes claimable again at `retry_at_ms`.
pub fn mark_failed(
    conn: &Connection,
    id: Uuid,
    worker: &str,
    error: &str,
    retry_at_ms: i64,
) -> Result<(), QueueError> {
    let updated = conn.execute(
        "UPDATE event_queue
         SET error = ?1, attempts = attempts + 1, locked_by = NULL, available_at = ?2
         WHERE id = ?3 AND locked_by = ?4",
        params![error, retry_at_ms, id.to_string(), worker],
    )?;
    if updated == 0 {
        return Err(QueueError::NotHeld(id));
    }
    Ok(())
}

/// Deletes a successfully processed event.
pub fn mark_done(conn: &Connection, id: Uuid, worker: &str) -> Result<(), QueueError> {
    let deleted = conn.execute(
        "DELETE FROM event_queue WHERE id = ?1 AND locked_by = ?2",
        params![id.to_string(), worker],
    )?;
    if deleted == 0 {
        return Err(QueueError::NotHeld(id));
    }
    Ok(())
}

/// Gives a claim back without counting an attempt.
pub fn release_claim(conn: &Connection, id: Uuid, worker: &str) -> Result<(), QueueError> {
    let updated = conn.execute(
        "UPDATE event_queue SET locked_by = NULL, available_at = ?1
         WHERE id = ?2 AND locked_by = ?3",
        params![now_millis(), id.to_string(), worker],
    )?;
    if updated == 0 {
        return Err(QueueError::NotHeld(id));
    }
    Ok(())
}

/// Loads a single event by id, claimed or not.
pub fn get_event(conn: &Connection, id: Uuid) -> Result<Option<QueueEvent>, QueueError> {
    conn.query_row(
        &format!("SELECT {EVENT_COLUMNS} FROM event_queue WHERE id = ?1"),
        [id.to_string()],
        RawEvent::from_row,
    )
    .optional()?
    .map(RawEvent::into_inspected_event)
    .transpose()
}

/// Counts rows still in the queue, optionally restricted to one event name.
pub fn count_events(conn: &Connection, name: Option<&str>) -> Result<i64, QueueError> {
    let count = match name {
        Some(name) => conn.query_row(
            "SELECT COUNT(*) FROM event_queue WHERE name = ?1",
            [name],
            |row| row.get(0),
        )?,
        None => conn.query_row("SELECT COUNT(*) FROM event_queue", [], |row| row.get(0))?,
    };
    Ok(count)
}

/// Lists events with at least one failed attempt, most-retried first.
pub fn list_failed(conn: &Connection, limit: u32) -> Result<Vec<QueueEvent>, QueueError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM event_queue
         WHERE error IS NOT NULL
         ORDER BY attempts DESC, seq ASC
         LIMIT ?1"
    ))?;
    let raw = stmt
        .query_map([limit], RawEvent::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raw.into_iter().map(RawEvent::into_inspected_event).collect()
}
