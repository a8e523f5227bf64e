//! Integration tests for the notification outbox.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;
use vigil_events::{AppendEvent, EventStore};

/// Get a test database pool, or skip if no test DB is available.
async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;

    sqlx::migrate!("../../migrations").run(&pool).await.ok()?;

    // Clean slate for each test
    sqlx::query("TRUNCATE events RESTART IDENTITY")
        .execute(&pool)
        .await
        .ok()?;

    Some(pool)
}

#[tokio::test]
async fn append_returns_increasing_seq() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = EventStore::new(pool);

    let first = store
        .append(AppendEvent::new("new_cluster", json!({"n": 1})))
        .await
        .unwrap();
    let second = store
        .append(AppendEvent::new("new_evidence", json!({"n": 2})))
        .await
        .unwrap();

    assert!(first > 0);
    assert!(second > first);
    assert_eq!(store.latest_seq().await.unwrap(), second);
}

#[tokio::test]
async fn actor_and_subject_round_trip() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = EventStore::new(pool);
    let cluster_id = Uuid::new_v4();

    let seq = store
        .append(
            AppendEvent::new("vote_won", json!({"score_delta": 10.0}))
                .with_actor("voter-1")
                .with_subject(cluster_id),
        )
        .await
        .unwrap();

    let stored = store.read_event(seq).await.unwrap().unwrap();
    assert_eq!(stored.event_type, "vote_won");
    assert_eq!(stored.actor.as_deref(), Some("voter-1"));
    assert_eq!(stored.subject_id, Some(cluster_id));
    assert_eq!(stored.payload["score_delta"], 10.0);
    assert!(stored.delivered_at.is_none());

    let by_subject = store.read_by_subject(cluster_id).await.unwrap();
    assert_eq!(by_subject.len(), 1);
}

#[tokio::test]
async fn read_by_type_filters() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = EventStore::new(pool);

    store.append(AppendEvent::new("new_cluster", json!({}))).await.unwrap();
    store.append(AppendEvent::new("vote_lost", json!({}))).await.unwrap();
    store.append(AppendEvent::new("new_cluster", json!({}))).await.unwrap();

    let created = store.read_by_type("new_cluster", 1, 100).await.unwrap();
    assert_eq!(created.len(), 2);
    assert!(created.iter().all(|e| e.event_type == "new_cluster"));
}

#[tokio::test]
async fn delivery_drain_marks_each_event_once() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = EventStore::new(pool);

    let a = store.append(AppendEvent::new("vote_won", json!({}))).await.unwrap();
    let b = store.append(AppendEvent::new("vote_lost", json!({}))).await.unwrap();

    let pending = store.read_undelivered(10).await.unwrap();
    assert_eq!(pending.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![a, b]);

    assert!(store.mark_delivered(a).await.unwrap());
    assert!(!store.mark_delivered(a).await.unwrap());

    let pending = store.read_undelivered(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].seq, b);

    let all = store.read_all().await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn read_from_returns_events_in_order() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = EventStore::new(pool);

    for n in 0..3 {
        store
            .append(AppendEvent::new("new_evidence", json!({"n": n})))
            .await
            .unwrap();
    }

    let events = store.read_from(1, 100).await.unwrap();
    assert_eq!(events.len(), 3);
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    assert_eq!(events[2].payload["n"], 2);
}
