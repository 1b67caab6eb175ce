use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::http::header::{HeaderName, HeaderValue};
use axum_test::TestServer;
use serde_json::{Value, json};

use agent_relay::AppState;
use agent_relay::api::identity::identity_middleware;
use agent_relay::api::routes::build_router;
use agent_relay::config::AppConfig;
use agent_relay::persistence::providers::memory::MemoryProvider;
use agent_relay::persistence::{EventLog, MetadataStore};
use agent_relay::streaming::source::GraphRegistry;
use agent_relay::streaming::{StreamCoordinator, StreamingSettings};

fn test_server() -> TestServer {
    let provider = Arc::new(MemoryProvider::new());
    let store: Arc<dyn MetadataStore> = provider.clone();
    let log: Arc<dyn EventLog> = provider;
    let coordinator = StreamCoordinator::new(
        store,
        log,
        Arc::new(GraphRegistry::with_defaults()),
        StreamingSettings {
            join_timeout: Duration::from_secs(5),
            ..StreamingSettings::default()
        },
    );
    let config = Arc::new(AppConfig::load_from_args(["agent-relay"]).unwrap());
    let state = AppState {
        coordinator,
        config,
    };

    let app = build_router()
        .layer(axum::middleware::from_fn(identity_middleware))
        .with_state(state);
    TestServer::new(app).unwrap()
}

fn user(name: &'static str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static("x-user-id"),
        HeaderValue::from_static(name),
    )
}

fn run_request() -> Value {
    json!({
        "assistant_id": "agent",
        "input": { "messages": [{ "role": "user", "content": "hi" }] }
    })
}

#[tokio::test]
async fn health_reports_ok() {
    let server = test_server();
    let res = server.get("/health").await;
    res.assert_status_ok();
    res.assert_json(&json!({ "status": "ok" }));
}

#[tokio::test]
async fn assistants_lists_registered_graphs() {
    let server = test_server();
    let res = server.get("/assistants").await;
    res.assert_status_ok();
    res.assert_json(&json!({ "assistants": ["agent"] }));
}

#[tokio::test]
async fn thread_create_and_fetch() {
    let server = test_server();
    let created: Value = server
        .post("/threads")
        .json(&json!({ "metadata": { "topic": "demo" } }))
        .await
        .json();
    let thread_id = created["thread_id"].as_str().unwrap().to_string();

    let res = server.get(&format!("/threads/{thread_id}")).await;
    res.assert_status_ok();
    let fetched: Value = res.json();
    assert_eq!(fetched["metadata"]["topic"], json!("demo"));
    assert_eq!(fetched["status"], json!("idle"));
}

#[tokio::test]
async fn thread_of_another_user_is_not_found() {
    let server = test_server();
    let (name, value) = user("alice");
    let created: Value = server
        .post("/threads")
        .add_header(name, value)
        .json(&json!({}))
        .await
        .json();
    let thread_id = created["thread_id"].as_str().unwrap();

    let (name, value) = user("bob");
    let res = server
        .get(&format!("/threads/{thread_id}"))
        .add_header(name, value)
        .await;
    assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn run_lifecycle_create_join_fetch() {
    let server = test_server();
    let run: Value = server
        .post("/threads/t1/runs")
        .json(&run_request())
        .await
        .json();
    assert_eq!(run["status"], json!("pending"));
    let run_id = run["run_id"].as_str().unwrap().to_string();

    let joined: Value = server
        .get(&format!("/threads/t1/runs/{run_id}/join"))
        .await
        .json();
    assert_eq!(joined["status"], json!("completed"));
    let messages = joined["output"]["messages"].as_array().unwrap();
    assert_eq!(messages.last().unwrap()["content"], json!("echo: hi"));

    let fetched: Value = server
        .get(&format!("/threads/t1/runs/{run_id}"))
        .await
        .json();
    assert_eq!(fetched["status"], json!("completed"));
}

#[tokio::test]
async fn run_listing_is_scoped_to_the_caller() {
    let server = test_server();
    let (name, value) = user("alice");
    let run: Value = server
        .post("/threads/t1/runs")
        .add_header(name.clone(), value.clone())
        .json(&run_request())
        .await
        .json();
    let run_id = run["run_id"].as_str().unwrap();
    server
        .get(&format!("/threads/t1/runs/{run_id}/join"))
        .add_header(name.clone(), value.clone())
        .await
        .assert_status_ok();

    let mine: Value = server.get("/runs").add_header(name, value).await.json();
    assert_eq!(mine["total"], json!(1));

    let (name, value) = user("bob");
    let theirs: Value = server.get("/runs").add_header(name, value).await.json();
    assert_eq!(theirs["total"], json!(0));
}

#[tokio::test]
async fn unknown_assistant_yields_not_found() {
    let server = test_server();
    let res = server
        .post("/threads/t1/runs")
        .json(&json!({ "assistant_id": "missing", "input": {} }))
        .await;
    assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn run_under_wrong_thread_is_not_found() {
    let server = test_server();
    let run: Value = server
        .post("/threads/t1/runs")
        .json(&run_request())
        .await
        .json();
    let run_id = run["run_id"].as_str().unwrap();

    let res = server.get(&format!("/threads/other/runs/{run_id}")).await;
    assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_of_completed_run_is_rejected() {
    let server = test_server();
    let run: Value = server
        .post("/threads/t1/runs")
        .json(&run_request())
        .await
        .json();
    let run_id = run["run_id"].as_str().unwrap().to_string();
    server
        .get(&format!("/threads/t1/runs/{run_id}/join"))
        .await
        .assert_status_ok();

    let res = server
        .post(&format!("/threads/t1/runs/{run_id}/cancel"))
        .await;
    assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = res.json();
    assert!(body["detail"].as_str().unwrap().contains("completed"));
}

#[tokio::test]
async fn stream_replays_values_and_end() {
    let server = test_server();
    let run: Value = server
        .post("/threads/t1/runs")
        .json(&run_request())
        .await
        .json();
    let run_id = run["run_id"].as_str().unwrap().to_string();
    server
        .get(&format!("/threads/t1/runs/{run_id}/join"))
        .await
        .assert_status_ok();

    let res = server
        .get(&format!("/threads/t1/runs/{run_id}/stream"))
        .await;
    res.assert_status_ok();
    let body = res.text();
    assert!(body.contains("event: values"));
    assert!(body.contains("echo: hi"));
    assert!(body.contains("event: end"));
}

#[tokio::test]
async fn stream_resumes_from_last_event_id() {
    let server = test_server();
    let run: Value = server
        .post("/threads/t1/runs")
        .json(&run_request())
        .await
        .json();
    let run_id = run["run_id"].as_str().unwrap().to_string();
    server
        .get(&format!("/threads/t1/runs/{run_id}/join"))
        .await
        .assert_status_ok();

    let res = server
        .get(&format!("/threads/t1/runs/{run_id}/stream"))
        .add_header(
            HeaderName::from_static("last-event-id"),
            HeaderValue::from_static("1"),
        )
        .await;
    res.assert_status_ok();
    let body = res.text();
    assert!(!body.contains("event: values"));
    assert!(body.contains("event: end"));
}

#[tokio::test]
async fn stream_on_create_starts_with_metadata() {
    let server = test_server();
    let res = server
        .post("/threads/t1/runs/stream")
        .json(&run_request())
        .await;
    res.assert_status_ok();
    let body = res.text();
    let metadata = body.find("event: metadata").unwrap();
    let values = body.find("event: values").unwrap();
    let end = body.find("event: end").unwrap();
    assert!(metadata < values);
    assert!(values < end);
}

#[tokio::test]
async fn stream_of_another_users_run_is_not_found() {
    let server = test_server();
    let (name, value) = user("alice");
    let run: Value = server
        .post("/threads/t1/runs")
        .add_header(name, value)
        .json(&run_request())
        .await
        .json();
    let run_id = run["run_id"].as_str().unwrap();

    let (name, value) = user("bob");
    let res = server
        .get(&format!("/threads/t1/runs/{run_id}/stream"))
        .add_header(name, value)
        .await;
    assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
}
