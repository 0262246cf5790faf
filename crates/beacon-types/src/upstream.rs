//! Wire types exchanged between agents and the hub.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A single row, column name to value.
pub type Row = Map<String, Value>;

/// Changes for one monitored table inside a push batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableChanges {
    pub table: String,
    /// Every affected primary key, in the order the changes were captured.
    pub primary_keys: Vec<Vec<String>>,
    /// Current rows for keys that still exist on the agent.
    #[serde(default)]
    pub rows: Vec<Row>,
    /// Tombstones: keys whose row no longer exists on the agent.
    #[serde(default)]
    pub deleted: Vec<Vec<String>>,
}

/// Body of `POST /upstream/push`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushData {
    pub agent_name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Deterministic id of the batch, derived from its source events.
    pub batch_id: String,
    pub tables: Vec<TableChanges>,
}

impl PushData {
    /// Total number of rows and tombstones carried by the batch.
    pub fn count(&self) -> usize {
        self.tables
            .iter()
            .map(|t| t.rows.len() + t.deleted.len())
            .sum()
    }
}

/// Rows of one reference table returned by the pull endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableRows {
    pub table: String,
    pub rows: Vec<Row>,
}

/// Body returned by `GET /upstream/pull/{agent_name}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub agent_name: String,
    /// Hub time at which the snapshot was taken. Use as the next `since`.
    pub before: String,
    pub tables: Vec<TableRows>,
}

impl PullResponse {
    /// Rows for a table, empty when the table was not included.
    pub fn rows(&self, table: &str) -> &[Row] {
        self.tables
            .iter()
            .find(|t| t.table == table)
            .map(|t| t.rows.as_slice())
            .unwrap_or(&[])
    }
}

/// Body returned by `GET /upstream/status/{agent_name}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub agent_name: String,
    pub labels: BTreeMap<String, String>,
    pub last_batch_id: Option<String>,
    pub last_pushed_at: Option<String>,
    /// Rows owned by the agent, per monitored table.
    pub tables: BTreeMap<String, i64>,
}

/// Parses `key=value` labels. Entries without `=` become keys with empty values.
pub fn parse_labels<S: AsRef<str>>(labels: &[S]) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter_map(|label| {
            let label = label.as_ref().trim();
            if label.is_empty() {
                return None;
            }
            Some(match label.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
                None => (label.to_string(), String::new()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_split_on_first_equals() {
        let labels = parse_labels(&["env=prod", "region = eu-west-1", "edge", "", "q=a=b"]);
        assert_eq!(labels["env"], "prod");
        assert_eq!(labels["region"], "eu-west-1");
        assert_eq!(labels["edge"], "");
        assert_eq!(labels["q"], "a=b");
        assert_eq!(labels.len(), 4);
    }

    #[test]
    fn push_data_count_includes_tombstones() {
        let data = PushData {
            agent_name: "edge".to_string(),
            batch_id: "b".to_string(),
            tables: vec![TableChanges {
                table: "checks".to_string(),
                primary_keys: vec![vec!["1".to_string()], vec!["2".to_string()]],
                rows: vec![Row::new()],
                deleted: vec![vec!["2".to_string()]],
            }],
            ..Default::default()
        };
        assert_eq!(data.count(), 2);
    }
}
