//! Integration tests for the HTTP surface: REST endpoints, bearer-token
//! authentication, and the SSE result stream gateway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;
use uuid::Uuid;

use narwhal::bus::{result_channel, InProcMessageBus, MessageBus, ResultEnvelope};
use narwhal::coordinator::{RunCoordinator, ShutdownToken};
use narwhal::gateway::{self, AppState, TokenVerifier};
use narwhal::run::{Run, RunPatch, RunStatus, RunnableKind};
use narwhal::scheduler::WorkerScheduler;
use narwhal::store::RunStore;
use narwhal::OrchestratorConfig;
use narwhal_testkit::{
    InMemoryRunStore, InProcessScheduler, MockWorkerScheduler, ScriptedResolver,
    ScriptedRunnable,
};

const TOKEN: &str = "test-token";

struct StaticVerifier;

#[async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> anyhow::Result<()> {
        if token == TOKEN {
            Ok(())
        } else {
            anyhow::bail!("bad token")
        }
    }
}

struct TestApp {
    router: Router,
    store: Arc<InMemoryRunStore>,
    bus: Arc<InProcMessageBus>,
}

fn build_app(scheduler: Arc<dyn WorkerScheduler>, config: OrchestratorConfig) -> TestApp {
    let store = Arc::new(InMemoryRunStore::new());
    let bus = Arc::new(InProcMessageBus::new(config.result_channel_buffer));
    let coordinator = Arc::new(RunCoordinator::new(
        store.clone(),
        bus.clone(),
        scheduler,
        config.clone(),
    ));
    let state = AppState {
        store: store.clone(),
        bus: bus.clone(),
        coordinator,
        verifier: Arc::new(StaticVerifier),
        config,
        shutdown: ShutdownToken::new(),
    };
    TestApp {
        router: gateway::router(state),
        store,
        bus,
    }
}

fn mock_app() -> TestApp {
    build_app(
        Arc::new(MockWorkerScheduler::new()),
        OrchestratorConfig::default(),
    )
}

fn authed(method: Method, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn parse_sse(raw: &[u8]) -> Vec<ResultEnvelope> {
    String::from_utf8_lossy(raw)
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).expect("valid envelope"))
        .collect()
}

async fn seed_running(store: &Arc<InMemoryRunStore>) -> Run {
    let run = store
        .insert_pending(RunnableKind::Agent, Uuid::now_v7(), serde_json::Map::new())
        .await
        .unwrap();
    store
        .transition(
            run.id,
            &[RunStatus::Pending],
            RunStatus::Running,
            RunPatch::running("worker-1"),
        )
        .await
        .unwrap();
    store.fetch(run.id).await.unwrap()
}

#[tokio::test]
async fn test_requests_without_bearer_token_are_rejected() {
    let app = mock_app();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/api/v1/runs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/api/v1/runs")
                .header(header::AUTHORIZATION, "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_healthz_is_unauthenticated() {
    let app = mock_app();
    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_create_fetch_and_list_runs() {
    let app = mock_app();
    let runnable_id = Uuid::now_v7();

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Method::POST, "/api/v1/runs")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({
                        "runnable_id": runnable_id,
                        "runnable_type": "agent",
                        "input_variables": {"message": "hi"}
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let created = json_body(response).await;
    assert!(matches!(
        created["status"].as_str(),
        Some("pending") | Some("running")
    ));
    let id = created["id"].as_str().unwrap().to_string();

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Method::GET, &format!("/api/v1/runs/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = json_body(response).await;
    assert_eq!(fetched["id"].as_str(), Some(id.as_str()));
    assert_eq!(fetched["runnable_kind"].as_str(), Some("agent"));

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Method::GET, "/api/v1/runs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let listed = json_body(response).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let response = app
        .router
        .oneshot(
            authed(Method::GET, "/api/v1/runs?status=completed")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let filtered = json_body(response).await;
    assert!(filtered.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_runnable_type_is_bad_request() {
    let app = mock_app();
    let response = app
        .router
        .oneshot(
            authed(Method::POST, "/api/v1/runs")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({
                        "runnable_id": Uuid::now_v7(),
                        "runnable_type": "pipeline"
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["code"].as_str(), Some("BAD_REQUEST"));
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("invalid runnable kind"));
    // No record is created for a rejected request.
    assert!(app.store.is_empty());
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let app = mock_app();
    let response = app
        .router
        .oneshot(
            authed(Method::GET, &format!("/api/v1/runs/{}", Uuid::now_v7()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["code"].as_str(), Some("NOT_FOUND"));
}

#[tokio::test]
async fn test_cancel_endpoint_returns_cancelled_run() {
    let app = mock_app();
    let run = seed_running(&app.store).await;

    let response = app
        .router
        .oneshot(
            authed(Method::POST, &format!("/api/v1/runs/{}/cancel", run.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"].as_str(), Some("cancelled"));
    assert!(body["ended_at"].is_string());
}

#[tokio::test]
async fn test_stream_replays_finished_run() {
    let app = mock_app();
    let run = seed_running(&app.store).await;
    app.store
        .transition(
            run.id,
            &[RunStatus::Running],
            RunStatus::Completed,
            RunPatch::completed(Value::String("hello".into())),
        )
        .await
        .unwrap();

    let response = app
        .router
        .oneshot(
            authed(Method::GET, &format!("/api/v1/runs/{}/stream", run.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );

    let raw = response.into_body().collect().await.unwrap().to_bytes();
    let events = parse_sse(&raw);
    assert_eq!(
        events,
        vec![
            ResultEnvelope::chunk(Value::String("hello".into())),
            ResultEnvelope::end(),
        ]
    );
}

#[tokio::test]
async fn test_stream_forwards_live_envelopes_in_order() {
    let app = mock_app();
    let run = seed_running(&app.store).await;

    let response = app
        .router
        .oneshot(
            authed(Method::GET, &format!("/api/v1/runs/{}/stream", run.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The gateway subscribed during the handler; publish after it returns.
    let bus = app.bus.clone();
    let channel = result_channel(run.id);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        for env in [
            ResultEnvelope::chunk(Value::String("he".into())),
            ResultEnvelope::chunk(Value::String("llo".into())),
            ResultEnvelope::end(),
        ] {
            bus.publish(&channel, env.to_bytes()).await.unwrap();
        }
    });

    let raw = response.into_body().collect().await.unwrap().to_bytes();
    let events = parse_sse(&raw);
    assert_eq!(
        events,
        vec![
            ResultEnvelope::chunk(Value::String("he".into())),
            ResultEnvelope::chunk(Value::String("llo".into())),
            ResultEnvelope::end(),
        ]
    );
}

#[tokio::test]
async fn test_slow_client_is_closed_with_overflow() {
    let app = build_app(
        Arc::new(MockWorkerScheduler::new()),
        OrchestratorConfig {
            client_send_buffer: 4,
            ..Default::default()
        },
    );
    let run = seed_running(&app.store).await;

    let response = app
        .router
        .oneshot(
            authed(Method::GET, &format!("/api/v1/runs/{}/stream", run.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    // Publish far more than the per-connection queue while the client is
    // not reading; the gateway must close with an overflow event rather
    // than stall the channel.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let channel = result_channel(run.id);
    for i in 0..50 {
        app.bus
            .publish(
                &channel,
                ResultEnvelope::chunk(Value::String(format!("m{i}"))).to_bytes(),
            )
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let raw = response.into_body().collect().await.unwrap().to_bytes();
    let events = parse_sse(&raw);
    assert_eq!(
        events.last(),
        Some(&ResultEnvelope::end_error("client overflow"))
    );
    // The queued prefix arrives in order before the overflow close.
    assert_eq!(events[0], ResultEnvelope::chunk(Value::String("m0".into())));
    assert_eq!(events.len(), 5);
}

#[tokio::test]
async fn test_stream_for_unknown_run_is_not_found() {
    let app = mock_app();
    let response = app
        .router
        .oneshot(
            authed(
                Method::GET,
                &format!("/api/v1/runs/{}/stream", Uuid::now_v7()),
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_full_run_lifecycle_over_http() {
    let store = Arc::new(InMemoryRunStore::new());
    let bus = Arc::new(InProcMessageBus::new(1024));
    let resolver = Arc::new(ScriptedResolver::always(
        ScriptedRunnable::emitting(["he", "llo"]).with_chunk_delay(Duration::from_millis(30)),
    ));
    let scheduler = Arc::new(InProcessScheduler::new(
        store.clone(),
        bus.clone(),
        resolver,
    ));
    let coordinator = Arc::new(RunCoordinator::new(
        store.clone(),
        bus.clone(),
        scheduler,
        OrchestratorConfig::default(),
    ));
    let state = AppState {
        store: store.clone(),
        bus,
        coordinator,
        verifier: Arc::new(StaticVerifier),
        config: OrchestratorConfig::default(),
        shutdown: ShutdownToken::new(),
    };
    let router = gateway::router(state);

    let response = router
        .clone()
        .oneshot(
            authed(Method::POST, "/api/v1/runs")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({
                        "runnable_id": Uuid::now_v7(),
                        "runnable_type": "agent",
                        "input_variables": {"message": "hi"}
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await;
    let id = created["id"].as_str().unwrap().to_string();

    let response = router
        .clone()
        .oneshot(
            authed(Method::GET, &format!("/api/v1/runs/{id}/stream"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let raw = response.into_body().collect().await.unwrap().to_bytes();
    let events = parse_sse(&raw);

    assert!(events.last().unwrap().is_end());
    let streamed: String = events
        .iter()
        .filter_map(|env| match env {
            ResultEnvelope::Chunk {
                payload: Value::String(s),
            } => Some(s.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "hello");

    // The record eventually carries the aggregated output.
    let run = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let run = store.fetch(id.parse().unwrap()).await.unwrap();
            if run.status == RunStatus::Completed {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("run never completed");
    assert_eq!(run.output_data, Some(Value::String("hello".into())));
}
