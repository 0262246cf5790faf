use beacon_db::{create_pool, query_rows_as_json, run_migrations, DbRuntimeSettings};

#[test]
fn pool_and_migrations_initialize_a_fresh_file() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("beacon.db");
    let pool = create_pool(
        path.to_str().expect("utf-8 path"),
        DbRuntimeSettings::default(),
    )
    .expect("failed to create pool");

    let conn = pool.get().expect("failed to get connection");
    let applied = run_migrations(&conn).expect("failed to run migrations");
    assert!(applied > 0);

    // A second connection sees the migrated schema and re-running is a no-op.
    let other = pool.get().expect("failed to get second connection");
    assert_eq!(run_migrations(&other).expect("second run"), 0);

    other
        .execute(
            "INSERT INTO checks (id, name, status) VALUES ('c1', 'http', 'healthy')",
            [],
        )
        .expect("failed to insert check");

    let rows = query_rows_as_json(&conn, "SELECT id, name, agent_id FROM checks", [])
        .expect("failed to read checks");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], "c1");
    assert!(rows[0]["agent_id"].is_null());
}

#[test]
fn local_changes_to_replicated_tables_are_captured() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("capture.db");
    let pool = create_pool(
        path.to_str().expect("utf-8 path"),
        DbRuntimeSettings::default(),
    )
    .expect("failed to create pool");
    let conn = pool.get().expect("failed to get connection");
    run_migrations(&conn).expect("failed to run migrations");

    conn.execute_batch(
        "INSERT INTO checks (id, name) VALUES ('c1', 'http');
         UPDATE checks SET status = 'unhealthy' WHERE id = 'c1';
         DELETE FROM checks WHERE id = 'c1';
         INSERT INTO checks (id, name, agent_id) VALUES ('remote', 'dns', 'agent-1');
         INSERT INTO check_statuses (check_id, time, status) VALUES ('c1', '2024-01-01 00:00:00', 1);",
    )
    .expect("failed to write rows");

    let events = query_rows_as_json(
        &conn,
        "SELECT id, name, properties FROM event_queue ORDER BY seq",
        [],
    )
    .expect("failed to read queue");
    assert_eq!(events.len(), 4, "rows owned by an agent are not captured");

    let properties: Vec<serde_json::Value> = events
        .iter()
        .map(|e| {
            assert_eq!(e["name"], "push_queue.create");
            let id = e["id"].as_str().expect("id is text");
            assert_eq!(id.len(), 36, "uuid-shaped id: {id}");
            serde_json::from_str(e["properties"].as_str().expect("json text"))
                .expect("properties are json")
        })
        .collect();

    assert_eq!(properties[0], serde_json::json!({"table": "checks", "id": "c1"}));
    assert_eq!(properties[2], serde_json::json!({"table": "checks", "id": "c1"}));
    assert_eq!(
        properties[3],
        serde_json::json!({"table": "check_statuses", "check_id": "c1", "time": "2024-01-01 00:00:00"})
    );
}
