use async_trait::async_trait;
use beacon_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use beacon_notify::{
    responder_consumer_config, trigger_consumer_config, Delivery, NotificationEngine, Responder,
    ResponderClient, ResponderError, ResponderProcessor, RuleStore, Transport, TransportError,
};
use beacon_queue::store;
use beacon_queue::{EventConsumer, EventQueue, NewEvent};
use beacon_types::{names, Properties, QueueEvent};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct NoTransport;

#[async_trait]
impl Transport for NoTransport {
    async fn send(&self, _delivery: &Delivery) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Records every call and hands out sequential ticket ids.
#[derive(Default)]
struct RecordingClient {
    announced: Mutex<Vec<String>>,
    comments: Mutex<Vec<(String, String)>>,
    reject: bool,
}

#[async_trait]
impl ResponderClient for RecordingClient {
    async fn notify_responder(&self, responder: &Responder) -> Result<Option<String>, ResponderError> {
        if self.reject {
            return Err(ResponderError::new("ticketing system unavailable"));
        }
        let mut announced = self.announced.lock().expect("lock");
        announced.push(responder.id.clone());
        Ok(Some(format!("TICKET-{}", announced.len())))
    }

    async fn add_comment(
        &self,
        responder: &Responder,
        comment: &str,
    ) -> Result<Option<String>, ResponderError> {
        if self.reject {
            return Err(ResponderError::new("ticketing system unavailable"));
        }
        self.comments
            .lock()
            .expect("lock")
            .push((responder.id.clone(), comment.to_string()));
        Ok(None)
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    pool: DbPool,
    queue: EventQueue,
    client: Arc<RecordingClient>,
    processor: Arc<ResponderProcessor>,
}

fn harness(client: RecordingClient) -> Harness {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("responder.db");
    let pool = create_pool(path.to_str().expect("utf-8 path"), DbRuntimeSettings::default())
        .expect("pool");
    let conn = pool.get().expect("connection");
    run_migrations(&conn).expect("migrate");
    conn.execute_batch(
        r#"
        INSERT INTO incidents (id, title, severity) VALUES ('inc-1', 'db down', 'high');
        INSERT INTO people (id, name, email) VALUES ('p1', 'Ada', 'ada@example.com');
        INSERT INTO responders (id, incident_id, type, properties)
            VALUES ('r1', 'inc-1', 'jira', '{"project":"OPS"}');
        INSERT INTO responders (id, incident_id, type, external_id)
            VALUES ('r2', 'inc-1', 'pagerduty', 'PD-7');
        INSERT INTO comments (id, incident_id, comment) VALUES ('cm1', 'inc-1', 'looking');
        INSERT INTO comments (id, incident_id, comment, external_id)
            VALUES ('cm2', 'inc-1', 'from the ticket', 'JIRA-C-1');
        INSERT INTO notifications (id, events, filter, template, person_id) VALUES (
            'n1',
            '["incident.responder.added","incident.comment.added"]',
            'incident.severity == "high"',
            'Update on {{ incident.title }}',
            'p1'
        );
        "#,
    )
    .expect("seed");
    drop(conn);

    let queue = EventQueue::new(pool.clone());
    let engine = Arc::new(NotificationEngine::new(
        queue.clone(),
        RuleStore::new(Duration::from_secs(3600)),
        Arc::new(NoTransport),
    ));
    let client = Arc::new(client);
    let processor = Arc::new(ResponderProcessor::new(
        engine,
        Some(client.clone() as Arc<dyn ResponderClient>),
    ));

    Harness {
        _dir: dir,
        pool,
        queue,
        client,
        processor,
    }
}

impl Harness {
    async fn enqueue(&self, name: &str, id: &str) -> QueueEvent {
        self.queue
            .enqueue(NewEvent::new(
                name,
                Properties::from([("id".to_string(), id.to_string())]),
            ))
            .await
            .expect("enqueue")
    }

    async fn drain(&self) -> usize {
        EventConsumer::new(
            responder_consumer_config(),
            self.queue.clone(),
            self.processor.clone(),
        )
        .consume_until_empty()
        .await
        .expect("drain responder events")
    }

    fn scalar(&self, sql: &str) -> i64 {
        self.pool
            .get()
            .expect("connection")
            .query_row(sql, [], |row| row.get(0))
            .expect("query")
    }

    fn sends_for(&self, event_name: &str) -> i64 {
        self.pool
            .get()
            .expect("connection")
            .query_row(
                "SELECT COUNT(*) FROM event_queue
                 WHERE name = 'notification.send'
                   AND json_extract(properties, '$.event_name') = ?1",
                [event_name],
                |row| row.get(0),
            )
            .expect("count sends")
    }
}

#[test]
fn responder_events_belong_to_the_responder_consumer() {
    let responder = responder_consumer_config();
    let triggers = trigger_consumer_config();
    for name in names::RESPONDER_EVENTS {
        assert!(responder.watch_events.iter().any(|w| w == name));
        assert!(!triggers.watch_events.iter().any(|w| w == name));
    }
    assert!(triggers
        .watch_events
        .iter()
        .any(|w| w == names::INCIDENT_RESPONDER_REMOVED));
}

#[tokio::test]
async fn added_responder_is_announced_then_notified() {
    let h = harness(RecordingClient::default());
    h.enqueue(names::INCIDENT_RESPONDER_ADDED, "r1").await;

    assert_eq!(h.drain().await, 1);
    assert_eq!(*h.client.announced.lock().expect("lock"), vec!["r1".to_string()]);

    let external_id: String = h
        .pool
        .get()
        .expect("connection")
        .query_row("SELECT external_id FROM responders WHERE id = 'r1'", [], |row| row.get(0))
        .expect("external id");
    assert_eq!(external_id, "TICKET-1");
    assert_eq!(h.sends_for(names::INCIDENT_RESPONDER_ADDED), 1);
}

#[tokio::test]
async fn redelivered_responder_event_is_not_announced_twice() {
    let h = harness(RecordingClient::default());
    let event = h.enqueue(names::INCIDENT_RESPONDER_ADDED, "r1").await;

    h.processor.handle(&event).await.expect("first delivery");
    h.processor.handle(&event).await.expect("second delivery");

    assert_eq!(h.client.announced.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn local_comments_reach_announced_responders_once() {
    let h = harness(RecordingClient::default());
    let local = h.enqueue(names::INCIDENT_COMMENT_ADDED, "cm1").await;
    h.enqueue(names::INCIDENT_COMMENT_ADDED, "cm2").await;

    assert_eq!(h.drain().await, 2);
    assert_eq!(
        *h.client.comments.lock().expect("lock"),
        vec![("r2".to_string(), "looking".to_string())],
        "only announced responders get the comment; pulled comments are skipped"
    );
    assert_eq!(h.scalar("SELECT COUNT(*) FROM comment_responders"), 1);
    assert_eq!(h.sends_for(names::INCIDENT_COMMENT_ADDED), 1);

    h.processor.handle(&local).await.expect("redelivery");
    assert_eq!(h.client.comments.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn client_failures_keep_the_event_for_retry() {
    let h = harness(RecordingClient {
        reject: true,
        ..Default::default()
    });
    let event = h.enqueue(names::INCIDENT_RESPONDER_ADDED, "r1").await;

    assert_eq!(h.drain().await, 1);

    let stored = h
        .queue
        .with_conn(move |conn| store::get_event(conn, event.id))
        .await
        .expect("inspect")
        .expect("event kept");
    assert_eq!(stored.attempts, 1);
    assert!(stored
        .error
        .as_deref()
        .is_some_and(|e| e.contains("ticketing system unavailable")));
    assert_eq!(h.sends_for(names::INCIDENT_RESPONDER_ADDED), 0);
    assert_eq!(
        h.scalar("SELECT COUNT(*) FROM responders WHERE id = 'r1' AND external_id IS NULL"),
        1
    );
}
