//! Integration tests for the PostgreSQL run store.
//!
//! Requires a running Postgres instance with the narwhal schema applied.
//! Run with: `cargo test --test postgres_store --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use narwhal::persistence::PostgresRunStore;
use narwhal::run::{RunPatch, RunStatus, RunnableKind};
use narwhal::store::{RunFilter, RunStore};

async fn connect() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("connect to postgres")
}

#[tokio::test]
#[ignore]
async fn insert_and_fetch_roundtrip() {
    let store = PostgresRunStore::new(connect().await);
    let runnable_id = Uuid::now_v7();
    let input = json!({"message": "hi"}).as_object().unwrap().clone();

    let run = store
        .insert_pending(RunnableKind::Agent, runnable_id, input.clone())
        .await
        .expect("insert");
    assert_eq!(run.status, RunStatus::Pending);

    let fetched = store.fetch(run.id).await.expect("fetch");
    assert_eq!(fetched.runnable_id, runnable_id);
    assert_eq!(fetched.runnable_kind, RunnableKind::Agent);
    assert_eq!(fetched.input_variables, input);
    assert!(fetched.started_at.is_none());
    assert!(fetched.worker_handle.is_none());
}

#[tokio::test]
#[ignore]
async fn transition_is_compare_and_set() {
    let store = PostgresRunStore::new(connect().await);
    let run = store
        .insert_pending(RunnableKind::Team, Uuid::now_v7(), serde_json::Map::new())
        .await
        .expect("insert");

    assert!(store
        .transition(
            run.id,
            &[RunStatus::Pending],
            RunStatus::Running,
            RunPatch::running("worker-1"),
        )
        .await
        .expect("first transition"));

    // Second writer expecting pending loses.
    assert!(!store
        .transition(
            run.id,
            &[RunStatus::Pending],
            RunStatus::Failed,
            RunPatch::failed("late"),
        )
        .await
        .expect("losing transition"));

    assert!(store
        .transition(
            run.id,
            &[RunStatus::Running],
            RunStatus::Completed,
            RunPatch::completed(Value::String("done".into())),
        )
        .await
        .expect("terminal transition"));

    let stored = store.fetch(run.id).await.expect("fetch");
    assert_eq!(stored.status, RunStatus::Completed);
    assert_eq!(stored.output_data, Some(Value::String("done".into())));
    assert_eq!(stored.error_message, None);
    assert_eq!(stored.worker_handle.as_deref(), Some("worker-1"));
    assert!(stored.started_at.is_some());
    assert!(stored.ended_at.is_some());
}

#[tokio::test]
#[ignore]
async fn terminal_status_cannot_be_overwritten() {
    let store = PostgresRunStore::new(connect().await);
    let run = store
        .insert_pending(RunnableKind::Agent, Uuid::now_v7(), serde_json::Map::new())
        .await
        .expect("insert");

    assert!(store
        .transition(
            run.id,
            RunStatus::ACTIVE,
            RunStatus::Cancelled,
            RunPatch::cancelled(),
        )
        .await
        .expect("cancel"));

    assert!(!store
        .transition(
            run.id,
            RunStatus::ACTIVE,
            RunStatus::Failed,
            RunPatch::failed("too late"),
        )
        .await
        .expect("late fail"));

    let stored = store.fetch(run.id).await.expect("fetch");
    assert_eq!(stored.status, RunStatus::Cancelled);
    assert_eq!(stored.error_message.as_deref(), Some("cancelled"));
}

#[tokio::test]
#[ignore]
async fn list_filters_by_runnable_and_status() {
    let store = PostgresRunStore::new(connect().await);
    let runnable_id = Uuid::now_v7();

    let first = store
        .insert_pending(RunnableKind::Agent, runnable_id, serde_json::Map::new())
        .await
        .expect("insert");
    store
        .insert_pending(RunnableKind::Agent, runnable_id, serde_json::Map::new())
        .await
        .expect("insert");

    store
        .transition(
            first.id,
            &[RunStatus::Pending],
            RunStatus::Failed,
            RunPatch::failed("boom"),
        )
        .await
        .expect("fail first");

    let all = store
        .list(RunFilter {
            runnable_id: Some(runnable_id),
            status: None,
        })
        .await
        .expect("list");
    assert_eq!(all.len(), 2);

    let failed = store
        .list(RunFilter {
            runnable_id: Some(runnable_id),
            status: Some(RunStatus::Failed),
        })
        .await
        .expect("list failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, first.id);

    let active = store.list_active().await.expect("list_active");
    assert!(active.iter().all(|run| !run.status.is_terminal()));
}
