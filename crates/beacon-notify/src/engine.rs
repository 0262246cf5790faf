//! Trigger matching, fan-out and delivery.
//!
//! A trigger event is matched against every rule listening for its name.
//! Each matching rule produces one `notification.send` event per resolved
//! recipient. Send events are delivered by a separate, wider consumer so a
//! slow channel never holds up matching.

use crate::env::{build_env, EvalEnv, SqlDomainLoader};
use crate::event::NotificationEvent;
use crate::rules::{load_person, RuleStore};
use crate::templater::Templater;
use crate::transport::{Delivery, Transport};
use crate::NotifyError;
use async_trait::async_trait;
use beacon_queue::{ConsumerConfig, EventProcessor, EventQueue, FailedEvent, NewEvent};
use beacon_types::names;
use beacon_types::{
    to_properties, CustomNotification, NotificationRule, NotificationSendProperties, Properties,
    QueueEvent,
};
use rusqlite::Connection;
use std::sync::Arc;

/// Consumer settings for trigger events and rule updates.
///
/// Responder events are left to the responder consumer, which fans them out
/// itself.
pub fn trigger_consumer_config() -> ConsumerConfig {
    let mut watch: Vec<&str> = names::NOTIFICATION_TRIGGERS
        .iter()
        .copied()
        .filter(|name| !names::RESPONDER_EVENTS.contains(name))
        .collect();
    watch.push(names::NOTIFICATION_UPDATE);
    watch.push(names::NOTIFICATION_DELETE);
    ConsumerConfig::new("notification-trigger", watch.as_slice())
        .with_batch_size(1)
        .with_consumers(1)
}

/// Consumer settings for `notification.send`.
pub fn send_consumer_config(consumers: usize) -> ConsumerConfig {
    ConsumerConfig::new("notification-send", &[names::NOTIFICATION_SEND])
        .with_batch_size(1)
        .with_consumers(consumers)
}

pub struct NotificationEngine {
    queue: EventQueue,
    rules: Arc<RuleStore>,
    templater: Arc<Templater>,
    transport: Arc<dyn Transport>,
}

impl NotificationEngine {
    pub fn new(queue: EventQueue, rules: RuleStore, transport: Arc<dyn Transport>) -> Self {
        Self {
            queue,
            rules: Arc::new(rules),
            templater: Arc::new(Templater::new()),
            transport,
        }
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    pub async fn handle(&self, event: &QueueEvent) -> Result<(), NotifyError> {
        match NotificationEvent::parse(event)? {
            NotificationEvent::Trigger { name, .. } => {
                let sends = self.fan_out(name, event.properties.clone()).await?;
                if !sends.is_empty() {
                    tracing::info!(
                        event_id = %event.id,
                        event_name = %event.name,
                        sends = sends.len(),
                        "queued notification sends"
                    );
                }
                Ok(())
            }
            NotificationEvent::Send(props) => self.send(props).await,
            NotificationEvent::RuleChanged { rule_id } => {
                if let Some(id) = rule_id {
                    let evicted = self.rules.invalidate(&id);
                    tracing::debug!(rule_id = %id, evicted, "invalidated notification rule");
                }
                Ok(())
            }
        }
    }

    /// Matches a trigger and enqueues its sends in one transaction.
    pub async fn fan_out(
        &self,
        event_name: String,
        properties: Properties,
    ) -> Result<Vec<QueueEvent>, NotifyError> {
        let rules = Arc::clone(&self.rules);
        let templater = Arc::clone(&self.templater);

        let planned = self
            .blocking(move |conn| plan_sends(conn, &rules, &templater, &event_name, &properties))
            .await?;

        let events = planned
            .iter()
            .map(|props| -> Result<NewEvent, NotifyError> {
                Ok(NewEvent::new(names::NOTIFICATION_SEND, to_properties(props)?))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(self.queue.enqueue_all(events).await?)
    }

    async fn send(&self, props: NotificationSendProperties) -> Result<(), NotifyError> {
        let rules = Arc::clone(&self.rules);
        let templater = Arc::clone(&self.templater);
        let delivery = self
            .blocking(move |conn| resolve_delivery(conn, &rules, &templater, &props))
            .await?;

        self.transport.send(&delivery).await?;
        tracing::info!(connection = %delivery.connection, "sent notification");
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, NotifyError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, NotifyError> + Send + 'static,
    {
        let pool = self.queue.pool().clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&*conn)
        })
        .await?
    }
}

#[async_trait]
impl EventProcessor for NotificationEngine {
    async fn process(&self, events: &[QueueEvent]) -> Vec<FailedEvent> {
        let mut failed = Vec::new();
        for event in events {
            if let Err(e) = self.handle(event).await {
                tracing::warn!(event_id = %event.id, event_name = %event.name, error = %e, "notification event failed");
                failed.push(FailedEvent::new(event.id, e));
            }
        }
        failed
    }
}

/// Decides which sends a trigger produces.
///
/// Inert rules are skipped. A filter that errors counts as a non-match, for
/// the rule as a whole and for each team or custom sub-notification.
pub fn plan_sends(
    conn: &Connection,
    rules: &RuleStore,
    templater: &Templater,
    event_name: &str,
    properties: &Properties,
) -> Result<Vec<NotificationSendProperties>, NotifyError> {
    let rule_ids = rules.rule_ids_for_event(conn, event_name)?;
    if rule_ids.is_empty() {
        return Ok(Vec::new());
    }

    let env = build_env(&SqlDomainLoader::new(conn), event_name, properties)?;
    let resource_id = properties.get("id").cloned().unwrap_or_default();
    let mut sends = Vec::new();

    for rule_id in rule_ids {
        let rule = rules.rule(conn, &rule_id)?;
        if rule.is_inert() {
            tracing::debug!(rule_id = %rule.id, "skipping rule without recipients or template");
            continue;
        }
        if !templater.matches(&rule.filter, &env) {
            continue;
        }

        let base = NotificationSendProperties {
            id: resource_id.clone(),
            event_name: event_name.to_string(),
            notification_id: rule.id.clone(),
            ..Default::default()
        };

        if let Some(person_id) = &rule.person_id {
            sends.push(NotificationSendProperties {
                person_id: Some(person_id.clone()),
                ..base.clone()
            });
        }

        if let Some(team_id) = &rule.team_id {
            let team = rules.team_spec(conn, team_id)?;
            for cn in matching(&team.notifications, templater, &env) {
                sends.push(NotificationSendProperties {
                    team_id: Some(team_id.clone()),
                    notification_name: Some(cn.name.clone()),
                    ..base.clone()
                });
            }
        }

        for cn in matching(&rule.custom_notifications, templater, &env) {
            sends.push(NotificationSendProperties {
                notification_name: Some(cn.name.clone()),
                ..base.clone()
            });
        }
    }

    Ok(sends)
}

fn matching<'a>(
    notifications: &'a [CustomNotification],
    templater: &'a Templater,
    env: &'a EvalEnv,
) -> impl Iterator<Item = &'a CustomNotification> {
    notifications
        .iter()
        .filter(move |cn| templater.matches(&cn.filter, env))
}

/// Resolves the recipient of a send event and renders its message.
pub fn resolve_delivery(
    conn: &Connection,
    rules: &RuleStore,
    templater: &Templater,
    props: &NotificationSendProperties,
) -> Result<Delivery, NotifyError> {
    let rule = rules.rule(conn, &props.notification_id)?;
    let env = build_env(
        &SqlDomainLoader::new(conn),
        &props.event_name,
        &Properties::from([("id".to_string(), props.id.clone())]),
    )?;

    if let Some(person_id) = &props.person_id {
        let person = load_person(conn, person_id)?;
        let email = person
            .email
            .filter(|e| !e.is_empty())
            .ok_or_else(|| NotifyError::NoAddress(person_id.clone()))?;
        return Ok(Delivery {
            connection: "email".to_string(),
            target: email,
            message: templater.render(&rule.template, &env)?,
            properties: templater.render_map(&rule.properties, &env)?,
        });
    }

    let name = props.notification_name.as_deref().unwrap_or_default();

    if let Some(team_id) = &props.team_id {
        let team = rules.team_spec(conn, team_id)?;
        let cn = team
            .notification(name)
            .ok_or_else(|| NotifyError::not_found("team notification", name))?;
        return custom_delivery(templater, &rule, cn, &env);
    }

    let cn = rule
        .custom_notification(name)
        .ok_or_else(|| NotifyError::not_found("custom notification", name))?;
    custom_delivery(templater, &rule, cn, &env)
}

/// A sub-notification's own template wins over the rule's; its properties
/// are layered over the rule's.
fn custom_delivery(
    templater: &Templater,
    rule: &NotificationRule,
    cn: &CustomNotification,
    env: &EvalEnv,
) -> Result<Delivery, NotifyError> {
    let template = if cn.template.is_empty() {
        &rule.template
    } else {
        &cn.template
    };

    let mut properties = templater.render_map(&rule.properties, env)?;
    properties.extend(templater.render_map(&cn.properties, env)?);

    Ok(Delivery {
        connection: cn.connection.clone(),
        target: templater.render(&cn.url, env)?,
        message: templater.render(template, env)?,
        properties,
    })
}
