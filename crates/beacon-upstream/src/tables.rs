//! Replicated tables and the row-level SQL shared by agent and hub.
//!
//! Table and column names are never taken from the wire as-is: the table
//! must be in [`MONITORED_TABLES`] and every column must exist according to
//! `PRAGMA table_info` before it is spliced into a statement.

use crate::UpstreamError;
use beacon_db::{query_rows_as_json, row_to_json, sql_value_from_json};
use beacon_types::{Properties, Row};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::collections::HashSet;

/// A table whose changes are pushed from agents to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitoredTable {
    pub name: &'static str,
    pub primary_key: &'static [&'static str],
}

pub const MONITORED_TABLES: &[MonitoredTable] = &[
    MonitoredTable {
        name: "canaries",
        primary_key: &["id"],
    },
    MonitoredTable {
        name: "checks",
        primary_key: &["id"],
    },
    MonitoredTable {
        name: "check_statuses",
        primary_key: &["check_id", "time"],
    },
    MonitoredTable {
        name: "components",
        primary_key: &["id"],
    },
    MonitoredTable {
        name: "config_items",
        primary_key: &["id"],
    },
    MonitoredTable {
        name: "config_component_relationships",
        primary_key: &["component_id", "config_id"],
    },
];

/// Tables the hub serves back to agents by default.
pub const DEFAULT_REFERENCE_TABLES: &[&str] = &["canaries", "checks"];

/// Column stamped with the owning agent's id on the hub.
pub const AGENT_COLUMN: &str = "agent_id";

pub fn monitored_table(name: &str) -> Result<&'static MonitoredTable, UpstreamError> {
    MONITORED_TABLES
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| UpstreamError::UnknownTable(name.to_string()))
}

impl MonitoredTable {
    /// Reads the primary key out of a `push_queue.create` payload.
    pub fn key_from_properties(&self, properties: &Properties) -> Option<Vec<String>> {
        self.primary_key
            .iter()
            .map(|col| properties.get(*col).cloned())
            .collect()
    }

    fn check_key(&self, key: &[String]) -> Result<(), UpstreamError> {
        if key.len() != self.primary_key.len() {
            return Err(UpstreamError::InvalidKey {
                table: self.name.to_string(),
                expected: self.primary_key.len(),
                got: key.len(),
            });
        }
        Ok(())
    }

    fn key_predicate(&self, first_param: usize) -> String {
        self.primary_key
            .iter()
            .enumerate()
            .map(|(i, col)| format!("\"{col}\" = ?{}", first_param + i))
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

/// Column names of a table.
pub fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>, UpstreamError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let columns = stmt
        .query_map([table], |row| row.get(0))?
        .collect::<rusqlite::Result<HashSet<String>>>()?;
    if columns.is_empty() {
        return Err(UpstreamError::UnknownTable(table.to_string()));
    }
    Ok(columns)
}

/// Loads the current row for a key, `None` if it no longer exists.
pub fn fetch_row(
    conn: &Connection,
    table: &MonitoredTable,
    key: &[String],
) -> Result<Option<Row>, UpstreamError> {
    table.check_key(key)?;
    let sql = format!(
        "SELECT * FROM \"{}\" WHERE {}",
        table.name,
        table.key_predicate(1)
    );
    Ok(conn
        .query_row(&sql, params_from_iter(key.iter()), row_to_json)
        .optional()?)
}

/// Inserts or updates one row.
///
/// With `owner` set, the agent column is overwritten with it. An existing
/// row is only updated when it already belongs to the same owner, so rows
/// of other agents and locally owned rows are never taken over. Returns
/// whether a row was written.
pub fn upsert_row(
    conn: &Connection,
    table: &MonitoredTable,
    columns: &HashSet<String>,
    row: &Row,
    owner: Option<&str>,
) -> Result<bool, UpstreamError> {
    let mut names: Vec<&str> = Vec::with_capacity(row.len() + 1);
    let mut values: Vec<SqlValue> = Vec::with_capacity(row.len() + 1);

    for (column, value) in row {
        if owner.is_some() && column == AGENT_COLUMN {
            continue;
        }
        if !columns.contains(column) {
            return Err(UpstreamError::UnknownColumn {
                table: table.name.to_string(),
                column: column.clone(),
            });
        }
        names.push(column.as_str());
        values.push(sql_value_from_json(value));
    }
    if let Some(owner) = owner {
        names.push(AGENT_COLUMN);
        values.push(SqlValue::Text(owner.to_string()));
    }

    for pk in table.primary_key {
        if !names.contains(pk) {
            return Err(UpstreamError::InvalidKey {
                table: table.name.to_string(),
                expected: table.primary_key.len(),
                got: table.primary_key.iter().filter(|k| names.contains(*k)).count(),
            });
        }
    }

    let column_list = names.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
    let placeholders = (1..=names.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let conflict = table.primary_key.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
    let mut updates: Vec<String> = names
        .iter()
        .filter(|c| !table.primary_key.contains(*c))
        .map(|c| format!("\"{c}\" = excluded.\"{c}\""))
        .collect();
    if updates.is_empty() {
        // Key-only rows still need a DO UPDATE to honor the ownership guard.
        let first = table.primary_key[0];
        updates.push(format!("\"{first}\" = excluded.\"{first}\""));
    }

    let sql = format!(
        "INSERT INTO \"{table}\" ({column_list}) VALUES ({placeholders})
         ON CONFLICT ({conflict}) DO UPDATE SET {updates}
         WHERE \"{table}\".\"{AGENT_COLUMN}\" IS excluded.\"{AGENT_COLUMN}\"",
        table = table.name,
        updates = updates.join(", "),
    );

    let written = conn.execute(&sql, params_from_iter(values.iter()))?;
    Ok(written > 0)
}

/// Deletes one row owned by `owner` (`None` matches locally owned rows).
pub fn delete_row(
    conn: &Connection,
    table: &MonitoredTable,
    key: &[String],
    owner: Option<&str>,
) -> Result<bool, UpstreamError> {
    table.check_key(key)?;
    let sql = format!(
        "DELETE FROM \"{}\" WHERE {} AND \"{AGENT_COLUMN}\" IS ?{}",
        table.name,
        table.key_predicate(1),
        key.len() + 1
    );
    let mut values: Vec<SqlValue> = key.iter().cloned().map(SqlValue::Text).collect();
    values.push(owner.map_or(SqlValue::Null, |o| SqlValue::Text(o.to_string())));
    Ok(conn.execute(&sql, params_from_iter(values.iter()))? > 0)
}

/// Rows of a table owned by `owner` that changed after `since`.
///
/// Tables without `updated_at` are filtered on `created_at`.
pub fn rows_owned_since(
    conn: &Connection,
    table: &MonitoredTable,
    owner: &str,
    since: Option<&str>,
    until: &str,
) -> Result<Vec<Row>, UpstreamError> {
    let columns = table_columns(conn, table.name)?;
    let time_column = if columns.contains("updated_at") {
        "updated_at"
    } else {
        "created_at"
    };
    let sql = format!(
        "SELECT * FROM \"{table}\"
         WHERE \"{AGENT_COLUMN}\" = ?1
           AND (?2 IS NULL OR \"{time_column}\" > ?2)
           AND \"{time_column}\" <= ?3
         ORDER BY \"{time_column}\"",
        table = table.name,
    );
    Ok(query_rows_as_json(conn, &sql, rusqlite::params![owner, since, until])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_db::run_migrations;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().expect("should open db");
        run_migrations(&conn).expect("should migrate");
        conn
    }

    fn row(value: serde_json::Value) -> Row {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn keys_come_from_event_properties() {
        let statuses = monitored_table("check_statuses").expect("monitored");
        let props = Properties::from([
            ("table".to_string(), "check_statuses".to_string()),
            ("check_id".to_string(), "c1".to_string()),
            ("time".to_string(), "t1".to_string()),
        ]);
        assert_eq!(
            statuses.key_from_properties(&props),
            Some(vec!["c1".to_string(), "t1".to_string()])
        );
        let checks = monitored_table("checks").expect("monitored");
        assert_eq!(checks.key_from_properties(&props), None);
        assert!(matches!(
            monitored_table("people"),
            Err(UpstreamError::UnknownTable(_))
        ));
    }

    #[test]
    fn upsert_stamps_owner_and_respects_ownership() {
        let conn = setup();
        let checks = monitored_table("checks").expect("monitored");
        let columns = table_columns(&conn, "checks").expect("columns");

        let first = row(json!({"id": "c1", "name": "http", "status": "healthy", "agent_id": null}));
        assert!(upsert_row(&conn, checks, &columns, &first, Some("a1")).expect("insert"));

        let update = row(json!({"id": "c1", "name": "http", "status": "unhealthy"}));
        assert!(upsert_row(&conn, checks, &columns, &update, Some("a1")).expect("update"));
        assert!(
            !upsert_row(&conn, checks, &columns, &update, Some("a2")).expect("foreign"),
            "another agent cannot take the row over"
        );

        let stored = fetch_row(&conn, checks, &["c1".to_string()])
            .expect("fetch")
            .expect("present");
        assert_eq!(stored["status"], "unhealthy");
        assert_eq!(stored["agent_id"], "a1");
    }

    #[test]
    fn unknown_columns_and_missing_keys_are_rejected() {
        let conn = setup();
        let checks = monitored_table("checks").expect("monitored");
        let columns = table_columns(&conn, "checks").expect("columns");

        let bad = row(json!({"id": "c1", "name": "x", "\"; DROP TABLE checks; --": 1}));
        assert!(matches!(
            upsert_row(&conn, checks, &columns, &bad, Some("a1")),
            Err(UpstreamError::UnknownColumn { .. })
        ));

        let keyless = row(json!({"name": "x"}));
        assert!(matches!(
            upsert_row(&conn, checks, &columns, &keyless, Some("a1")),
            Err(UpstreamError::InvalidKey { .. })
        ));
    }

    #[test]
    fn composite_keys_fetch_and_delete() {
        let conn = setup();
        let statuses = monitored_table("check_statuses").expect("monitored");
        let columns = table_columns(&conn, "check_statuses").expect("columns");
        let status = row(json!({"check_id": "c1", "time": "t1", "status": 1}));
        upsert_row(&conn, statuses, &columns, &status, Some("a1")).expect("insert");

        let key = vec!["c1".to_string(), "t1".to_string()];
        assert!(fetch_row(&conn, statuses, &key).expect("fetch").is_some());
        assert!(!delete_row(&conn, statuses, &key, Some("a2")).expect("foreign delete"));
        assert!(delete_row(&conn, statuses, &key, Some("a1")).expect("delete"));
        assert!(fetch_row(&conn, statuses, &key).expect("fetch").is_none());

        assert!(matches!(
            fetch_row(&conn, statuses, &["c1".to_string()]),
            Err(UpstreamError::InvalidKey { expected: 2, got: 1, .. })
        ));
    }
}
