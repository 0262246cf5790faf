//! Grouping of captured changes into one push batch.

use crate::tables::{fetch_row, monitored_table, MonitoredTable};
use crate::UpstreamError;
use beacon_queue::FailedEvent;
use beacon_types::{PushData, QueueEvent, TableChanges};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Keys changed in one table, in the order their events were captured.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeGroup {
    pub table: &'static MonitoredTable,
    pub keys: Vec<Vec<String>>,
    /// Source events, including ones whose key repeated an earlier event.
    pub events: Vec<Uuid>,
}

#[derive(Debug, Default)]
pub struct Grouped {
    pub groups: Vec<ChangeGroup>,
    /// Events that cannot be replicated at all.
    pub rejected: Vec<FailedEvent>,
}

impl Grouped {
    pub fn event_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.groups.iter().flat_map(|g| g.events.iter().copied())
    }
}

/// Groups `push_queue.create` events by table.
///
/// Tables appear in first-seen order and keys keep their capture order with
/// repeats removed. An event naming an unreplicated table or lacking part
/// of the key is rejected on its own without holding back the rest.
pub fn group_changes_by_table(events: &[QueueEvent]) -> Grouped {
    let mut grouped = Grouped::default();
    let mut seen: Vec<HashSet<Vec<String>>> = Vec::new();

    for event in events {
        let table_name = event.property("table").unwrap_or_default();
        let table = match monitored_table(table_name) {
            Ok(table) => table,
            Err(e) => {
                grouped.rejected.push(FailedEvent::new(event.id, e));
                continue;
            }
        };
        let Some(key) = table.key_from_properties(&event.properties) else {
            grouped.rejected.push(FailedEvent::new(
                event.id,
                format!("missing primary key for {}", table.name),
            ));
            continue;
        };

        let idx = match grouped.groups.iter().position(|g| g.table.name == table.name) {
            Some(idx) => idx,
            None => {
                grouped.groups.push(ChangeGroup {
                    table,
                    keys: Vec::new(),
                    events: Vec::new(),
                });
                seen.push(HashSet::new());
                grouped.groups.len() - 1
            }
        };

        let group = &mut grouped.groups[idx];
        group.events.push(event.id);
        if seen[idx].insert(key.clone()) {
            group.keys.push(key);
        }
    }

    grouped
}

/// Deterministic batch id: the SHA-256 of the sorted source event ids.
pub fn batch_id<I: IntoIterator<Item = Uuid>>(event_ids: I) -> String {
    let mut ids: Vec<Uuid> = event_ids.into_iter().collect();
    ids.sort();
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Reads the current state of every grouped key.
///
/// Keys whose row is gone are sent as tombstones.
pub fn collect_push_data(
    conn: &Connection,
    grouped: &Grouped,
    agent_name: &str,
    labels: &BTreeMap<String, String>,
) -> Result<PushData, UpstreamError> {
    let mut tables = Vec::with_capacity(grouped.groups.len());
    for group in &grouped.groups {
        let mut changes = TableChanges {
            table: group.table.name.to_string(),
            primary_keys: group.keys.clone(),
            ..Default::default()
        };
        for key in &group.keys {
            match fetch_row(conn, group.table, key)? {
                Some(row) => changes.rows.push(row),
                None => changes.deleted.push(key.clone()),
            }
        }
        tables.push(changes);
    }

    Ok(PushData {
        agent_name: agent_name.to_string(),
        labels: labels.clone(),
        batch_id: batch_id(grouped.event_ids()),
        tables,
    })
}
