//! Generic row <-> JSON conversion.
//!
//! The background layer treats domain records as opaque field maps: the
//! notification engine exposes them to filters and templates, and the
//! replication engine ships them between deployments. Both go through these
//! helpers instead of per-table structs.

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, Params, Row};
use serde_json::{Map, Number, Value};

/// Converts the current row into a JSON object keyed by column name.
///
/// Integers and reals map to numbers, text to strings, blobs to hex strings
/// and `NULL` to `null`.
pub fn row_to_json(row: &Row<'_>) -> rusqlite::Result<Map<String, Value>> {
    let stmt = row.as_ref();
    let mut map = Map::with_capacity(stmt.column_count());

    for (idx, name) in stmt.column_names().into_iter().enumerate() {
        let value = match row.get_ref(idx)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::from(i),
            ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
            ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
        };
        map.insert(name.to_string(), value);
    }

    Ok(map)
}

/// Runs a query and collects every row as a JSON object.
pub fn query_rows_as_json<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> rusqlite::Result<Vec<Map<String, Value>>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_json)?;
    rows.collect()
}

/// Converts a JSON value into something SQLite can bind.
///
/// Booleans become 0/1; arrays and objects are stored as JSON text.
pub fn sql_value_from_json(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
