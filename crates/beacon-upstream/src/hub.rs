//! Hub side of replication: applying pushed batches and serving pulls.

use crate::tables::{
    delete_row, monitored_table, rows_owned_since, table_columns, upsert_row, MONITORED_TABLES,
};
use crate::UpstreamError;
use beacon_types::{AgentStatus, PullResponse, PushData, TableRows};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;

/// Timestamp format shared with the SQLite column defaults.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

pub fn now_timestamp() -> String {
    chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        rows: usize,
        deleted: usize,
        /// Rows left alone because another owner holds them.
        skipped: usize,
    },
    /// The batch equals the last one applied for this agent.
    Duplicate,
}

struct AgentRecord {
    id: String,
    labels: String,
}

fn find_agent(conn: &Connection, name: &str) -> Result<Option<AgentRecord>, UpstreamError> {
    Ok(conn
        .query_row(
            "SELECT id, labels FROM agents WHERE name = ?1",
            [name],
            |row| {
                Ok(AgentRecord {
                    id: row.get(0)?,
                    labels: row.get(1)?,
                })
            },
        )
        .optional()?)
}

/// Resolves the agent by name, creating it on first contact, and refreshes
/// its labels.
fn upsert_agent(
    conn: &Connection,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> Result<String, UpstreamError> {
    let labels = serde_json::to_string(labels)?;
    if let Some(agent) = find_agent(conn, name)? {
        if agent.labels != labels {
            conn.execute(
                "UPDATE agents SET labels = ?1, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?2",
                rusqlite::params![labels, agent.id],
            )?;
        }
        return Ok(agent.id);
    }

    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO agents (id, name, labels) VALUES (?1, ?2, ?3)",
        rusqlite::params![id, name, labels],
    )?;
    tracing::info!(agent = %name, agent_id = %id, "registered new agent");
    Ok(id)
}

/// Applies one pushed batch atomically under the agent's ownership.
///
/// Rows are upserted with the agent column stamped and tombstones delete
/// the agent's row. Replaying the batch last applied for the agent is a
/// no-op.
pub fn apply_push(conn: &mut Connection, data: &PushData) -> Result<ApplyOutcome, UpstreamError> {
    if data.agent_name.is_empty() {
        return Err(UpstreamError::MissingAgentName);
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let agent_id = upsert_agent(&tx, &data.agent_name, &data.labels)?;

    let last_batch: Option<String> = tx
        .query_row(
            "SELECT last_batch_id FROM agent_push_cursors WHERE agent_id = ?1",
            [&agent_id],
            |row| row.get(0),
        )
        .optional()?;
    if last_batch.as_deref() == Some(data.batch_id.as_str()) {
        tx.commit()?;
        tracing::debug!(agent = %data.agent_name, batch_id = %data.batch_id, "skipping already applied batch");
        return Ok(ApplyOutcome::Duplicate);
    }

    let (mut rows, mut deleted, mut skipped) = (0, 0, 0);
    for changes in &data.tables {
        let table = monitored_table(&changes.table)?;
        let columns = table_columns(&tx, table.name)?;

        for row in &changes.rows {
            if upsert_row(&tx, table, &columns, row, Some(&agent_id))? {
                rows += 1;
            } else {
                skipped += 1;
                tracing::warn!(
                    agent = %data.agent_name,
                    table = table.name,
                    "row is owned elsewhere, not overwriting"
                );
            }
        }
        for key in &changes.deleted {
            if delete_row(&tx, table, key, Some(&agent_id))? {
                deleted += 1;
            }
        }
    }

    tx.execute(
        "INSERT INTO agent_push_cursors (agent_id, last_batch_id, batches_applied)
         VALUES (?1, ?2, 1)
         ON CONFLICT (agent_id) DO UPDATE SET
             last_batch_id = excluded.last_batch_id,
             batches_applied = agent_push_cursors.batches_applied + 1,
             last_pushed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        rusqlite::params![agent_id, data.batch_id],
    )?;
    tx.commit()?;

    tracing::info!(
        agent = %data.agent_name,
        batch_id = %data.batch_id,
        rows,
        deleted,
        skipped,
        "applied upstream push"
    );
    Ok(ApplyOutcome::Applied {
        rows,
        deleted,
        skipped,
    })
}

/// Rows of the reference tables owned by the agent that changed after
/// `since`, as of now. The returned `before` is the next cursor.
pub fn pull_reference_data<S: AsRef<str>>(
    conn: &Connection,
    agent_name: &str,
    since: Option<&str>,
    tables: &[S],
) -> Result<PullResponse, UpstreamError> {
    let agent = find_agent(conn, agent_name)?
        .ok_or_else(|| UpstreamError::UnknownAgent(agent_name.to_string()))?;
    let before = now_timestamp();

    let mut response = PullResponse {
        agent_name: agent_name.to_string(),
        before: before.clone(),
        tables: Vec::with_capacity(tables.len()),
    };
    for name in tables {
        let table = monitored_table(name.as_ref())?;
        response.tables.push(TableRows {
            table: table.name.to_string(),
            rows: rows_owned_since(conn, table, &agent.id, since, &before)?,
        });
    }
    Ok(response)
}

pub fn agent_status(conn: &Connection, agent_name: &str) -> Result<AgentStatus, UpstreamError> {
    let agent = find_agent(conn, agent_name)?
        .ok_or_else(|| UpstreamError::UnknownAgent(agent_name.to_string()))?;

    let cursor: Option<(String, String)> = conn
        .query_row(
            "SELECT last_batch_id, last_pushed_at FROM agent_push_cursors WHERE agent_id = ?1",
            [&agent.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let mut tables = BTreeMap::new();
    for table in MONITORED_TABLES {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\" WHERE agent_id = ?1", table.name),
            [&agent.id],
            |row| row.get(0),
        )?;
        tables.insert(table.name.to_string(), count);
    }

    let (last_batch_id, last_pushed_at) = cursor.unzip();
    Ok(AgentStatus {
        agent_id: agent.id,
        agent_name: agent_name.to_string(),
        labels: serde_json::from_str(&agent.labels)?,
        last_batch_id,
        last_pushed_at,
        tables,
    })
}
