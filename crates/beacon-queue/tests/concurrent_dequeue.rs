use beacon_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use beacon_queue::store::{self, NewEvent};
use beacon_types::Properties;
use std::collections::HashSet;
use std::time::Duration;

fn file_pool(dir: &tempfile::TempDir) -> DbPool {
    let path = dir.path().join("queue.db");
    let pool = create_pool(
        path.to_str().expect("utf-8 path"),
        DbRuntimeSettings {
            busy_timeout_ms: 10_000,
            pool_max_size: 8,
        },
    )
    .expect("failed to create pool");
    run_migrations(&pool.get().expect("connection")).expect("failed to migrate");
    pool
}

#[test]
fn concurrent_workers_never_claim_the_same_event() {
    let dir = tempfile::tempdir().expect("temp dir");
    let pool = file_pool(&dir);

    {
        let conn = pool.get().expect("connection");
        for i in 0..60 {
            let mut properties = Properties::new();
            properties.insert("n".to_string(), i.to_string());
            store::enqueue(&conn, &NewEvent::new("work", properties)).expect("enqueue");
        }
    }

    let handles: Vec<_> = (0..4)
        .map(|w| {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let mut conn = pool.get().expect("connection");
                let names = vec!["work".to_string()];
                let worker = format!("w{w}");
                let mut claimed = Vec::new();
                while let Some(event) =
                    store::dequeue_one(&mut conn, &names, &worker, Duration::from_secs(60))
                        .expect("dequeue")
                {
                    claimed.push(event.id);
                }
                claimed
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().expect("worker thread"));
    }

    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 60, "every event claimed");
    assert_eq!(unique.len(), 60, "no event claimed twice");
}
