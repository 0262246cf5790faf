//! Agent side of replication: the push consumer and pull reconciliation.

use crate::client::UpstreamClient;
use crate::group::{collect_push_data, group_changes_by_table, Grouped};
use crate::tables::{monitored_table, table_columns, upsert_row};
use crate::UpstreamError;
use async_trait::async_trait;
use beacon_db::DbPool;
use beacon_queue::{ConsumerConfig, EventProcessor, FailedEvent};
use beacon_types::{names, parse_labels, PullResponse, PushData, QueueEvent};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Consumer settings for `push_queue.create`.
pub fn push_consumer_config(batch_size: usize) -> ConsumerConfig {
    ConsumerConfig::new("upstream-push", &[names::PUSH_QUEUE_CREATE])
        .with_batch_size(batch_size)
        .with_consumers(1)
}

/// Pushes captured changes to the hub, one batch per claim.
///
/// The hub acknowledges a batch as a whole: when the push fails every
/// grouped event fails with it.
pub struct UpstreamPushProcessor {
    pool: DbPool,
    client: UpstreamClient,
    labels: BTreeMap<String, String>,
}

impl UpstreamPushProcessor {
    pub fn new(pool: DbPool, client: UpstreamClient) -> Self {
        let labels = parse_labels(&client.config().labels);
        Self {
            pool,
            client,
            labels,
        }
    }

    async fn push(&self, events: &[QueueEvent]) -> Vec<FailedEvent> {
        let grouped = group_changes_by_table(events);
        let mut failed = grouped.rejected.clone();
        for f in &failed {
            tracing::warn!(event_id = %f.id, error = %f.error, "dropping unreplicable change");
        }
        if grouped.groups.is_empty() {
            return failed;
        }

        let event_ids: Vec<Uuid> = grouped.event_ids().collect();
        let data = match self.collect(grouped).await {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "failed to collect changes for upstream push");
                failed.extend(event_ids.iter().map(|id| FailedEvent::new(*id, &e)));
                return failed;
            }
        };

        match self.client.push(&data).await {
            Ok(()) => {
                tracing::info!(
                    agent = %data.agent_name,
                    batch_id = %data.batch_id,
                    tables = data.tables.len(),
                    count = data.count(),
                    "pushed changes upstream"
                );
            }
            Err(e) => {
                tracing::warn!(batch_id = %data.batch_id, error = %e, "upstream push failed");
                failed.extend(event_ids.iter().map(|id| FailedEvent::new(*id, &e)));
            }
        }
        failed
    }

    async fn collect(&self, grouped: Grouped) -> Result<PushData, UpstreamError> {
        let pool = self.pool.clone();
        let agent_name = self.client.config().agent_name.clone();
        let labels = self.labels.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            collect_push_data(&conn, &grouped, &agent_name, &labels)
        })
        .await?
    }
}

#[async_trait]
impl EventProcessor for UpstreamPushProcessor {
    async fn process(&self, events: &[QueueEvent]) -> Vec<FailedEvent> {
        self.push(events).await
    }
}

/// The `since` of the last successful pull from `upstream`.
pub fn pull_cursor(conn: &Connection, upstream: &str) -> Result<Option<String>, UpstreamError> {
    Ok(conn
        .query_row(
            "SELECT since FROM upstream_pull_cursors WHERE upstream = ?1",
            [upstream],
            |row| row.get(0),
        )
        .optional()?)
}

/// Stores pulled rows locally and advances the cursor, atomically.
///
/// Rows keep the owner the hub gave them, which keeps them out of change
/// capture. Returns the number of rows written.
pub fn apply_pull(
    conn: &mut Connection,
    upstream: &str,
    response: &PullResponse,
) -> Result<usize, UpstreamError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut written = 0;
    for rows in &response.tables {
        let table = monitored_table(&rows.table)?;
        let columns = table_columns(&tx, table.name)?;
        for row in &rows.rows {
            if upsert_row(&tx, table, &columns, row, None)? {
                written += 1;
            }
        }
    }
    tx.execute(
        "INSERT INTO upstream_pull_cursors (upstream, since) VALUES (?1, ?2)
         ON CONFLICT (upstream) DO UPDATE SET
             since = excluded.since,
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        rusqlite::params![upstream, response.before],
    )?;
    tx.commit()?;
    Ok(written)
}

/// Pulls reference data changed since the last cursor and applies it.
pub async fn sync_from_upstream(pool: &DbPool, client: &UpstreamClient) -> Result<usize, UpstreamError> {
    let upstream = client.config().host.clone();

    let since = {
        let pool = pool.clone();
        let upstream = upstream.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            pull_cursor(&conn, &upstream)
        })
        .await??
    };

    let response = client.pull(since.as_deref()).await?;

    let pool = pool.clone();
    let written = tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        apply_pull(&mut conn, &upstream, &response)
    })
    .await??;

    tracing::info!(upstream = %client.config().host, since = ?since, written, "pulled reference data");
    Ok(written)
}
