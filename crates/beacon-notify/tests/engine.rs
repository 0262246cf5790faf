use async_trait::async_trait;
use beacon_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use beacon_notify::{
    send_consumer_config, trigger_consumer_config, Delivery, NotificationEngine, RuleStore,
    Transport, TransportError,
};
use beacon_queue::store;
use beacon_queue::{EventConsumer, EventProcessor, EventQueue, NewEvent};
use beacon_types::{from_properties, NotificationSendProperties, Properties, QueueEvent};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<Delivery>>,
    reject: bool,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, delivery: &Delivery) -> Result<(), TransportError> {
        if self.reject {
            return Err(TransportError::Rejected(503));
        }
        self.sent.lock().expect("lock").push(delivery.clone());
        Ok(())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    pool: DbPool,
    queue: EventQueue,
    transport: Arc<RecordingTransport>,
    engine: Arc<NotificationEngine>,
}

fn harness(transport: RecordingTransport) -> Harness {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("notify.db");
    let pool = create_pool(path.to_str().expect("utf-8 path"), DbRuntimeSettings::default())
        .expect("pool");
    let conn = pool.get().expect("connection");
    run_migrations(&conn).expect("migrate");
    conn.execute_batch(
        r#"
        INSERT INTO incidents (id, title, severity) VALUES ('inc-1', 'db down', 'high');
        INSERT INTO canaries (id, name) VALUES ('can-1', 'web');
        INSERT INTO checks (id, canary_id, name, status) VALUES ('chk-1', 'can-1', 'http', 'unhealthy');
        INSERT INTO people (id, name, email) VALUES ('p1', 'Ada', 'ada@example.com');
        INSERT INTO teams (id, name, spec) VALUES ('t1', 'ops', '{"notifications":[
            {"name":"pager","connection":"pagerduty","url":"https://pager.example/{{ incident.id }}","filter":"incident.severity == \"high\""},
            {"name":"chat","connection":"slack","url":"https://chat.example","filter":"incident.severity == \"low\""}
        ]}');
        "#,
    )
    .expect("seed");
    drop(conn);

    let queue = EventQueue::new(pool.clone());
    let transport = Arc::new(transport);
    let engine = Arc::new(NotificationEngine::new(
        queue.clone(),
        RuleStore::new(Duration::from_secs(3600)),
        transport.clone(),
    ));

    Harness {
        _dir: dir,
        pool,
        queue,
        transport,
        engine,
    }
}

impl Harness {
    fn add_rule(
        &self,
        id: &str,
        events: &str,
        filter: &str,
        template: &str,
        recipient: Option<(&str, &str)>,
    ) {
        let conn = self.pool.get().expect("connection");
        conn.execute(
            "INSERT INTO notifications (id, events, filter, template) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![id, events, filter, template],
        )
        .expect("insert rule");
        if let Some((column, value)) = recipient {
            conn.execute(
                &format!("UPDATE notifications SET {column} = ?1 WHERE id = ?2"),
                rusqlite::params![value, id],
            )
            .expect("set recipient");
        }
    }

    async fn trigger(&self, name: &str, id: &str) -> QueueEvent {
        self.queue
            .enqueue(NewEvent::new(
                name,
                Properties::from([("id".to_string(), id.to_string())]),
            ))
            .await
            .expect("enqueue trigger")
    }

    async fn drain_triggers(&self) -> usize {
        EventConsumer::new(trigger_consumer_config(), self.queue.clone(), self.engine.clone())
            .consume_until_empty()
            .await
            .expect("drain triggers")
    }

    async fn drain_sends(&self) -> usize {
        EventConsumer::new(send_consumer_config(2), self.queue.clone(), self.engine.clone())
            .consume_until_empty()
            .await
            .expect("drain sends")
    }

    async fn pending_sends(&self) -> Vec<NotificationSendProperties> {
        let pool = self.pool.clone();
        let events = tokio::task::spawn_blocking(move || {
            let conn = pool.get().expect("connection");
            let mut stmt = conn
                .prepare("SELECT id FROM event_queue WHERE name = 'notification.send' ORDER BY seq")
                .expect("prepare");
            let ids: Vec<String> = stmt
                .query_map([], |row| row.get(0))
                .expect("query")
                .collect::<Result<_, _>>()
                .expect("rows");
            ids.into_iter()
                .map(|id| {
                    store::get_event(&conn, id.parse().expect("uuid"))
                        .expect("get")
                        .expect("event")
                })
                .collect::<Vec<_>>()
        })
        .await
        .expect("join");
        events
            .iter()
            .map(|e| from_properties(&e.properties).expect("send properties"))
            .collect()
    }
}

#[tokio::test]
async fn incident_created_with_person_rule_queues_one_send() {
    let h = harness(RecordingTransport::default());
    h.add_rule(
        "r1",
        r#"["incident.created"]"#,
        r#"incident.severity == "high""#,
        "Incident {{ incident.title }}",
        Some(("person_id", "p1")),
    );

    h.trigger("incident.created", "inc-1").await;
    assert_eq!(h.drain_triggers().await, 1);

    let sends = h.pending_sends().await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].person_id.as_deref(), Some("p1"));
    assert_eq!(sends[0].id, "inc-1");
    assert_eq!(sends[0].event_name, "incident.created");
    assert_eq!(sends[0].notification_id, "r1");

    assert_eq!(h.drain_sends().await, 1);
    let sent = h.transport.sent.lock().expect("lock").clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].connection, "email");
    assert_eq!(sent[0].target, "ada@example.com");
    assert_eq!(sent[0].message, "Incident db down");
}

#[tokio::test]
async fn team_rule_sends_only_matching_sub_notifications() {
    let h = harness(RecordingTransport::default());
    h.add_rule("r1", r#"["incident.created"]"#, "", "{{ incident.title }}", Some(("team_id", "t1")));

    h.trigger("incident.created", "inc-1").await;
    h.drain_triggers().await;

    let sends = h.pending_sends().await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].team_id.as_deref(), Some("t1"));
    assert_eq!(sends[0].notification_name.as_deref(), Some("pager"));

    h.drain_sends().await;
    let sent = h.transport.sent.lock().expect("lock").clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].connection, "pagerduty");
    assert_eq!(sent[0].target, "https://pager.example/inc-1");
}

#[tokio::test]
async fn filter_errors_never_produce_sends() {
    let h = harness(RecordingTransport::default());
    // `check` is not part of an incident environment.
    h.add_rule(
        "r1",
        r#"["incident.created"]"#,
        r#"check.status == "unhealthy""#,
        "x",
        Some(("person_id", "p1")),
    );

    h.trigger("incident.created", "inc-1").await;
    assert_eq!(h.drain_triggers().await, 1);
    assert!(h.pending_sends().await.is_empty());

    let remaining = {
        let conn = h.pool.get().expect("connection");
        store::count_events(&conn, Some("incident.created")).expect("count")
    };
    assert_eq!(remaining, 0, "a non-matching trigger is still a success");
}

#[tokio::test]
async fn inert_rules_are_skipped() {
    let h = harness(RecordingTransport::default());
    h.add_rule("no-template", r#"["check.failed"]"#, "", "", Some(("person_id", "p1")));
    h.add_rule("no-recipient", r#"["check.failed"]"#, "", "hello", None);

    h.trigger("check.failed", "chk-1").await;
    h.drain_triggers().await;
    assert!(h.pending_sends().await.is_empty());
}

#[tokio::test]
async fn custom_notifications_match_individually() {
    let h = harness(RecordingTransport::default());
    h.add_rule(
        "r1",
        r#"["check.failed"]"#,
        "",
        "{{ check.name }} on {{ canary.name }}",
        Some((
            "custom_services",
            r#"[{"name":"hook","connection":"webhook","url":"https://hooks.example/{{ check.id }}","filter":"check.status == \"unhealthy\""},{"name":"never","url":"https://x.example","filter":"false"}]"#,
        )),
    );

    h.trigger("check.failed", "chk-1").await;
    h.drain_triggers().await;
    let sends = h.pending_sends().await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].notification_name.as_deref(), Some("hook"));
    assert!(sends[0].person_id.is_none() && sends[0].team_id.is_none());

    h.drain_sends().await;
    let sent = h.transport.sent.lock().expect("lock").clone();
    assert_eq!(sent[0].target, "https://hooks.example/chk-1");
    assert_eq!(sent[0].message, "http on web");
}

#[tokio::test]
async fn rule_update_event_invalidates_the_cache() {
    let h = harness(RecordingTransport::default());
    h.add_rule("r1", r#"["incident.created"]"#, "false", "x", Some(("person_id", "p1")));

    {
        let conn = h.pool.get().expect("connection");
        assert_eq!(h.engine.rules().rule(&conn, "r1").expect("rule").filter, "false");
        conn.execute("UPDATE notifications SET filter = 'true' WHERE id = 'r1'", [])
            .expect("update");
        assert_eq!(h.engine.rules().rule(&conn, "r1").expect("rule").filter, "false");
    }

    h.trigger("notification.update", "r1").await;
    assert_eq!(h.drain_triggers().await, 1);

    let conn = h.pool.get().expect("connection");
    assert_eq!(h.engine.rules().rule(&conn, "r1").expect("rule").filter, "true");
}

#[tokio::test]
async fn delivery_failures_fail_the_send_event() {
    let h = harness(RecordingTransport {
        reject: true,
        ..Default::default()
    });
    h.add_rule("r1", r#"["incident.created"]"#, "", "x", Some(("person_id", "p1")));

    h.trigger("incident.created", "inc-1").await;
    h.drain_triggers().await;

    let send = h
        .queue
        .with_conn(|conn| {
            store::dequeue_one(conn, &["notification.send".to_string()], "test", Duration::from_secs(60))
        })
        .await
        .expect("dequeue")
        .expect("send event");

    let failed = h.engine.process(std::slice::from_ref(&send)).await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, send.id);
    assert!(failed[0].error.contains("503"));
}

#[tokio::test]
async fn missing_domain_object_fails_the_trigger() {
    let h = harness(RecordingTransport::default());
    h.add_rule("r1", r#"["incident.created"]"#, "", "x", Some(("person_id", "p1")));

    let event = h.trigger("incident.created", "missing").await;
    h.drain_triggers().await;

    let conn = h.pool.get().expect("connection");
    let stored = store::get_event(&conn, event.id).expect("get").expect("kept");
    assert_eq!(stored.attempts, 1);
    assert!(stored.error.unwrap_or_default().contains("not found"));
}
