//! Incident responders in outside systems.
//!
//! A responder added to an incident is announced through a
//! [`ResponderClient`], and the id the outside system hands back is kept on
//! the responder. A comment written locally is then mirrored to every
//! announced responder of its incident, once per responder. Both events go
//! on to the normal notification fan-out afterwards.
//!
//! Comments that carry an `external_id` were pulled in from an outside
//! system and are neither mirrored nor notified.

use crate::engine::NotificationEngine;
use crate::NotifyError;
use async_trait::async_trait;
use beacon_queue::{ConsumerConfig, EventProcessor, EventQueue, FailedEvent};
use beacon_types::{from_properties, names, QueueEvent, ResourceRef};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::sync::Arc;

const RESPONDER_COLUMNS: &str = "id, incident_id, type, team_id, person_id, properties, external_id";

/// A responder record as the outside system sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Responder {
    pub id: String,
    pub incident_id: String,
    /// Kind of outside system, e.g. `jira` or `pagerduty`.
    pub kind: String,
    pub team_id: Option<String>,
    pub person_id: Option<String>,
    pub properties: Map<String, Value>,
    /// Id of the responder's ticket or page, once announced.
    pub external_id: Option<String>,
}

impl Responder {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let properties: String = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            incident_id: row.get(1)?,
            kind: row.get(2)?,
            team_id: row.get(3)?,
            person_id: row.get(4)?,
            properties: serde_json::from_str(&properties)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
            external_id: row.get(6)?,
        })
    }
}

/// Failure reported by an outside responder system.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ResponderError(pub String);

impl ResponderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Talks to the outside system behind a responder.
///
/// Implementations pick the concrete system from `Responder::kind` and its
/// properties.
#[async_trait]
pub trait ResponderClient: Send + Sync + 'static {
    /// Opens the responder's ticket or page. Returns its outside id, if any.
    async fn notify_responder(&self, responder: &Responder) -> Result<Option<String>, ResponderError>;

    /// Adds a comment to the responder's ticket. Returns the comment's
    /// outside id, if any.
    async fn add_comment(
        &self,
        responder: &Responder,
        comment: &str,
    ) -> Result<Option<String>, ResponderError>;
}

/// Consumer settings for responder and comment events.
pub fn responder_consumer_config() -> ConsumerConfig {
    ConsumerConfig::new("responder", names::RESPONDER_EVENTS)
        .with_batch_size(1)
        .with_consumers(1)
}

struct LocalComment {
    incident_id: String,
    text: String,
}

fn load_responder(conn: &Connection, id: &str) -> rusqlite::Result<Option<Responder>> {
    conn.query_row(
        &format!("SELECT {RESPONDER_COLUMNS} FROM responders WHERE id = ?1"),
        [id],
        Responder::from_row,
    )
    .optional()
}

fn load_local_comment(conn: &Connection, id: &str) -> rusqlite::Result<Option<LocalComment>> {
    conn.query_row(
        "SELECT incident_id, comment FROM comments WHERE id = ?1 AND external_id IS NULL",
        [id],
        |row| {
            Ok(LocalComment {
                incident_id: row.get(0)?,
                text: row.get(1)?,
            })
        },
    )
    .optional()
}

/// Announced responders of the incident that have not received the comment.
fn comment_targets(
    conn: &Connection,
    comment_id: &str,
    incident_id: &str,
) -> rusqlite::Result<Vec<Responder>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RESPONDER_COLUMNS} FROM responders r
         WHERE r.incident_id = ?1
           AND r.external_id IS NOT NULL
           AND NOT EXISTS (
               SELECT 1 FROM comment_responders cr
               WHERE cr.comment_id = ?2 AND cr.responder_id = r.id
           )
         ORDER BY r.created_at, r.id"
    ))?;
    let responders = stmt
        .query_map(params![incident_id, comment_id], Responder::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>();
    responders
}

/// Processes `incident.responder.added` and `incident.comment.added`.
///
/// Without a client only the notification fan-out runs.
pub struct ResponderProcessor {
    engine: Arc<NotificationEngine>,
    client: Option<Arc<dyn ResponderClient>>,
}

impl ResponderProcessor {
    pub fn new(engine: Arc<NotificationEngine>, client: Option<Arc<dyn ResponderClient>>) -> Self {
        Self { engine, client }
    }

    fn queue(&self) -> &EventQueue {
        self.engine.queue()
    }

    pub async fn handle(&self, event: &QueueEvent) -> Result<(), NotifyError> {
        let resource: ResourceRef = from_properties(&event.properties)?;
        let notify = match event.name.as_str() {
            names::INCIDENT_RESPONDER_ADDED => self.responder_added(&resource.id).await?,
            names::INCIDENT_COMMENT_ADDED => self.comment_added(&resource.id).await?,
            other => return Err(NotifyError::UnknownEvent(other.to_string())),
        };

        if notify {
            self.engine
                .fan_out(event.name.clone(), event.properties.clone())
                .await?;
        }
        Ok(())
    }

    async fn responder_added(&self, id: &str) -> Result<bool, NotifyError> {
        let lookup = id.to_string();
        let responder = self
            .queue()
            .with_conn(move |conn| Ok(load_responder(conn, &lookup)?))
            .await?
            .ok_or_else(|| NotifyError::not_found("responder", id))?;

        let Some(client) = &self.client else {
            return Ok(true);
        };
        if responder.external_id.is_some() {
            // Announced on an earlier attempt whose fan-out failed.
            tracing::debug!(responder_id = %responder.id, "responder already announced");
            return Ok(true);
        }

        if let Some(external_id) = client.notify_responder(&responder).await? {
            tracing::info!(
                responder_id = %responder.id,
                kind = %responder.kind,
                external_id = %external_id,
                "announced responder"
            );
            let responder_id = responder.id.clone();
            self.queue()
                .with_conn(move |conn| {
                    conn.execute(
                        "UPDATE responders SET external_id = ?1 WHERE id = ?2",
                        params![external_id, responder_id],
                    )?;
                    Ok(())
                })
                .await?;
        }
        Ok(true)
    }

    async fn comment_added(&self, id: &str) -> Result<bool, NotifyError> {
        let lookup = id.to_string();
        let Some(comment) = self
            .queue()
            .with_conn(move |conn| Ok(load_local_comment(conn, &lookup)?))
            .await?
        else {
            tracing::debug!(comment_id = %id, "skipping comment that came from a responder");
            return Ok(false);
        };

        let Some(client) = &self.client else {
            return Ok(true);
        };

        let (lookup, incident_id) = (id.to_string(), comment.incident_id.clone());
        let targets = self
            .queue()
            .with_conn(move |conn| Ok(comment_targets(conn, &lookup, &incident_id)?))
            .await?;

        let mut failures = Vec::new();
        for responder in targets {
            match client.add_comment(&responder, &comment.text).await {
                Ok(external_id) => {
                    let (comment_id, responder_id) = (id.to_string(), responder.id.clone());
                    self.queue()
                        .with_conn(move |conn| {
                            conn.execute(
                                "INSERT OR IGNORE INTO comment_responders (comment_id, responder_id, external_id)
                                 VALUES (?1, ?2, ?3)",
                                params![comment_id, responder_id, external_id],
                            )?;
                            Ok(())
                        })
                        .await?;
                }
                Err(e) => {
                    tracing::warn!(
                        comment_id = %id,
                        responder_id = %responder.id,
                        kind = %responder.kind,
                        error = %e,
                        "failed to add comment to responder"
                    );
                    failures.push(format!("{}: {e}", responder.id));
                }
            }
        }

        if !failures.is_empty() {
            return Err(ResponderError::new(format!(
                "comment {id} not added to {}",
                failures.join(", ")
            ))
            .into());
        }
        Ok(true)
    }
}

#[async_trait]
impl EventProcessor for ResponderProcessor {
    async fn process(&self, events: &[QueueEvent]) -> Vec<FailedEvent> {
        let mut failed = Vec::new();
        for event in events {
            if let Err(e) = self.handle(event).await {
                tracing::warn!(event_id = %event.id, event_name = %event.name, error = %e, "responder event failed");
                failed.push(FailedEvent::new(event.id, e));
            }
        }
        failed
    }
}
