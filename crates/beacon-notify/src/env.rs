//! Evaluation environments: the domain objects a filter or template sees.

use crate::NotifyError;
use beacon_db::query_rows_as_json;
use beacon_types::{Properties, ResourceKind};
use rusqlite::Connection;
use serde_json::{Map, Value};

/// A record as a field map.
pub type Record = Map<String, Value>;

/// Loads domain records by kind and id.
pub trait DomainLoader {
    fn load(&self, kind: &str, id: &str) -> Result<Record, NotifyError>;
}

/// Reads records straight from their tables.
pub struct SqlDomainLoader<'a> {
    conn: &'a Connection,
}

impl<'a> SqlDomainLoader<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

const TABLES: &[(&str, &str)] = &[
    ("incident", "incidents"),
    ("check", "checks"),
    ("canary", "canaries"),
    ("responder", "responders"),
    ("comment", "comments"),
    ("evidence", "evidences"),
    ("hypothesis", "hypotheses"),
];

fn table_for(kind: &str) -> Option<(&'static str, &'static str)> {
    TABLES.iter().find(|(k, _)| *k == kind).copied()
}

impl DomainLoader for SqlDomainLoader<'_> {
    fn load(&self, kind: &str, id: &str) -> Result<Record, NotifyError> {
        let (kind, table) =
            table_for(kind).ok_or_else(|| NotifyError::not_found("record kind", kind))?;
        let mut rows = query_rows_as_json(
            self.conn,
            &format!("SELECT * FROM {table} WHERE id = ?1"),
            [id],
        )?;
        if rows.is_empty() {
            return Err(NotifyError::not_found(kind, id));
        }
        Ok(rows.swap_remove(0))
    }
}

/// Named domain objects exposed to filters and templates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalEnv {
    values: Map<String, Value>,
}

impl EvalEnv {
    pub fn insert(&mut self, name: &str, record: Record) {
        self.values.insert(name.to_string(), Value::Object(record));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }
}

fn parent_id<'r>(record: &'r Record, field: &str) -> Option<&'r str> {
    record.get(field).and_then(Value::as_str)
}

/// Loads the object chain for an event, selected by event-name prefix.
///
/// The resource id comes from the `id` property. A missing record anywhere
/// in the chain is an error. An event name outside the known prefixes
/// yields an empty environment.
pub fn build_env(
    loader: &dyn DomainLoader,
    event_name: &str,
    properties: &Properties,
) -> Result<EvalEnv, NotifyError> {
    let mut env = EvalEnv::default();
    let Some(kind) = ResourceKind::for_event(event_name) else {
        return Ok(env);
    };
    let id = properties.get("id").map(String::as_str).unwrap_or_default();

    match kind {
        ResourceKind::Incident => {
            env.insert("incident", loader.load("incident", id)?);
        }
        ResourceKind::Check => {
            let check = loader.load("check", id)?;
            if let Some(canary_id) = parent_id(&check, "canary_id") {
                env.insert("canary", loader.load("canary", canary_id)?);
            }
            env.insert("check", check);
        }
        ResourceKind::Responder => {
            let responder = loader.load("responder", id)?;
            let incident_id = parent_id(&responder, "incident_id").unwrap_or_default();
            env.insert("incident", loader.load("incident", incident_id)?);
            env.insert("responder", responder);
        }
        ResourceKind::Comment => {
            let comment = loader.load("comment", id)?;
            let incident_id = parent_id(&comment, "incident_id").unwrap_or_default();
            env.insert("incident", loader.load("incident", incident_id)?);
            env.insert("comment", comment);
        }
        ResourceKind::Evidence => {
            let evidence = loader.load("evidence", id)?;
            let hypothesis_id = parent_id(&evidence, "hypothesis_id").unwrap_or_default();
            let hypothesis = loader.load("hypothesis", hypothesis_id)?;
            let incident_id = parent_id(&hypothesis, "incident_id").unwrap_or_default();
            env.insert("incident", loader.load("incident", incident_id)?);
            env.insert("hypothesis", hypothesis);
            env.insert("evidence", evidence);
        }
    }

    Ok(env)
}
