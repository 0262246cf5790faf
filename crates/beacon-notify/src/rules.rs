//! Notification rules, team specifications and people, read through a TTL
//! cache.
//!
//! Rules and team specs change rarely and are read for every trigger and
//! send, so both are cached by id. Rule updates and deletes evict the rule
//! explicitly; team specs only expire.

use crate::cache::TtlCache;
use crate::NotifyError;
use beacon_types::{CustomNotification, NotificationRule, Person, TeamSpec};
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub struct RuleStore {
    rules: TtlCache<String, NotificationRule>,
    teams: TtlCache<String, TeamSpec>,
}

impl RuleStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            rules: TtlCache::new(ttl),
            teams: TtlCache::new(ttl),
        }
    }

    /// Ids of live rules that list `event_name` among their events.
    pub fn rule_ids_for_event(
        &self,
        conn: &Connection,
        event_name: &str,
    ) -> Result<Vec<String>, NotifyError> {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT n.id
             FROM notifications n, json_each(n.events) e
             WHERE e.value = ?1 AND n.deleted_at IS NULL
             ORDER BY n.id",
        )?;
        let ids = stmt
            .query_map([event_name], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    pub fn rule(&self, conn: &Connection, id: &str) -> Result<Arc<NotificationRule>, NotifyError> {
        let key = id.to_string();
        if let Some(rule) = self.rules.get(&key) {
            return Ok(rule);
        }
        let rule = load_rule(conn, id)?;
        Ok(self.rules.insert(key, rule))
    }

    pub fn team_spec(&self, conn: &Connection, team_id: &str) -> Result<Arc<TeamSpec>, NotifyError> {
        let key = team_id.to_string();
        if let Some(spec) = self.teams.get(&key) {
            return Ok(spec);
        }
        let raw: Option<String> = conn
            .query_row("SELECT spec FROM teams WHERE id = ?1", [team_id], |row| {
                row.get(0)
            })
            .optional()?;
        let raw = raw.ok_or_else(|| NotifyError::not_found("team", team_id))?;
        let spec: TeamSpec = serde_json::from_str(&raw)?;
        Ok(self.teams.insert(key, spec))
    }

    /// Evicts a rule after an update or delete. Returns whether it was cached.
    pub fn invalidate(&self, rule_id: &str) -> bool {
        self.rules.invalidate(&rule_id.to_string())
    }
}

fn load_rule(conn: &Connection, id: &str) -> Result<NotificationRule, NotifyError> {
    let row = conn
        .query_row(
            "SELECT id, events, filter, template, properties, person_id, team_id, custom_services
             FROM notifications WHERE id = ?1 AND deleted_at IS NULL",
            [id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            },
        )
        .optional()?;

    let (id, events, filter, template, properties, person_id, team_id, custom) =
        row.ok_or_else(|| NotifyError::not_found("notification", id))?;

    Ok(NotificationRule {
        id,
        events: serde_json::from_str(&events)?,
        filter,
        template,
        properties: serde_json::from_str::<BTreeMap<String, String>>(&properties)?,
        person_id,
        team_id,
        custom_notifications: serde_json::from_str::<Vec<CustomNotification>>(&custom)?,
    })
}

pub fn load_person(conn: &Connection, id: &str) -> Result<Person, NotifyError> {
    conn.query_row(
        "SELECT id, name, email FROM people WHERE id = ?1",
        [id],
        |row| {
            Ok(Person {
                id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| NotifyError::not_found("person", id))
}
