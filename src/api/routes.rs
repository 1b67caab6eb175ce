use async_stream::stream;
use axum::extract::{Extension, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt, pin_mut};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::AppState;
use crate::api::identity::Identity;
use crate::api::sse::{build_sse_response, metadata_event, wire_event};
use crate::domain::events::RunEvent;
use crate::domain::runs::{Run, RunCreate, RunList};
use crate::domain::threads::{Thread, ThreadCreate};
use crate::error::ApiError;
use crate::streaming::lifecycle::DisconnectGuard;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/assistants", get(list_assistants))
        .route("/threads", post(create_thread))
        .route("/threads/{thread_id}", get(get_thread))
        .route("/runs", get(list_runs))
        .route("/threads/{thread_id}/runs", post(create_run))
        .route("/threads/{thread_id}/runs/stream", post(create_run_stream))
        .route("/threads/{thread_id}/runs/{run_id}", get(get_run))
        .route("/threads/{thread_id}/runs/{run_id}/stream", get(stream_run))
        .route("/threads/{thread_id}/runs/{run_id}/cancel", post(cancel_run))
        .route(
            "/threads/{thread_id}/runs/{run_id}/interrupt",
            post(interrupt_run),
        )
        .route("/threads/{thread_id}/runs/{run_id}/join", get(join_run))
}

async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.coordinator.ping_store().await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Serialize)]
struct AssistantList {
    assistants: Vec<String>,
}

async fn list_assistants(State(state): State<AppState>) -> Json<AssistantList> {
    Json(AssistantList {
        assistants: state.coordinator.assistants(),
    })
}

async fn create_thread(
    State(state): State<AppState>,
    Extension(Identity(user)): Extension<Identity>,
    Json(req): Json<ThreadCreate>,
) -> Result<Json<Thread>, ApiError> {
    Ok(Json(state.coordinator.create_thread(&user, req).await?))
}

async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Extension(Identity(user)): Extension<Identity>,
) -> Result<Json<Thread>, ApiError> {
    Ok(Json(
        state.coordinator.get_thread_for(&thread_id, &user).await?,
    ))
}

async fn list_runs(
    State(state): State<AppState>,
    Extension(Identity(user)): Extension<Identity>,
) -> Result<Json<RunList>, ApiError> {
    let runs = state.coordinator.list_runs(&user).await?;
    let total = runs.len();
    Ok(Json(RunList { runs, total }))
}

async fn create_run(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Extension(Identity(user)): Extension<Identity>,
    Json(req): Json<RunCreate>,
) -> Result<Json<Run>, ApiError> {
    let run = state.coordinator.create_run(&thread_id, &user, req).await?;
    Ok(Json(run))
}

/// Create a run and immediately stream it, prefixed with a `metadata`
/// preamble identifying the new run.
async fn create_run_stream(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Extension(Identity(user)): Extension<Identity>,
    Json(req): Json<RunCreate>,
) -> Result<impl IntoResponse, ApiError> {
    let cancel_on_disconnect = req.cancel_on_disconnect;
    let run = state.coordinator.create_run(&thread_id, &user, req).await?;

    let events = state.coordinator.open_run_stream(&run.run_id, None);
    let guard = cancel_on_disconnect
        .then(|| DisconnectGuard::new(state.coordinator.lifecycle(), run.run_id.clone()));
    let wire = wire_stream(events, Some(metadata_event(&run.run_id)), guard);
    Ok(build_sse_response(
        wire,
        state.coordinator.settings().keep_alive,
    ))
}

#[derive(Debug, Default, Deserialize)]
struct StreamParams {
    #[serde(default)]
    cancel_on_disconnect: bool,
}

/// Attach to a run's stream, optionally resuming from a `Last-Event-ID`
/// cursor. Unknown cursors degrade to a full replay.
async fn stream_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
    Extension(Identity(user)): Extension<Identity>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let run = fetch_run(&state, &thread_id, &run_id, &user).await?;

    let cursor = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_cursor);

    let events = state.coordinator.open_run_stream(&run.run_id, cursor);
    let guard = params
        .cancel_on_disconnect
        .then(|| DisconnectGuard::new(state.coordinator.lifecycle(), run.run_id.clone()));
    let wire = wire_stream(events, None, guard);
    Ok(build_sse_response(
        wire,
        state.coordinator.settings().keep_alive,
    ))
}

async fn get_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
    Extension(Identity(user)): Extension<Identity>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(fetch_run(&state, &thread_id, &run_id, &user).await?))
}

#[derive(Debug, Serialize)]
struct RunStatusResponse {
    run_id: String,
    status: String,
    message: String,
}

async fn cancel_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
    Extension(Identity(user)): Extension<Identity>,
) -> Result<Json<RunStatusResponse>, ApiError> {
    fetch_run(&state, &thread_id, &run_id, &user).await?;
    let run = state.coordinator.cancel(&run_id).await?;
    Ok(Json(RunStatusResponse {
        run_id: run.run_id,
        status: run.status.as_str().to_string(),
        message: "Run cancelled".to_string(),
    }))
}

async fn interrupt_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
    Extension(Identity(user)): Extension<Identity>,
) -> Result<Json<RunStatusResponse>, ApiError> {
    fetch_run(&state, &thread_id, &run_id, &user).await?;
    let run = state.coordinator.interrupt(&run_id).await?;
    Ok(Json(RunStatusResponse {
        run_id: run.run_id,
        status: run.status.as_str().to_string(),
        message: "Run interrupted".to_string(),
    }))
}

async fn join_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
    Extension(Identity(user)): Extension<Identity>,
) -> Result<Json<Run>, ApiError> {
    fetch_run(&state, &thread_id, &run_id, &user).await?;
    Ok(Json(state.coordinator.join(&run_id).await?))
}

/// Ownership and thread-scope checks; mismatches are masked as not-found.
async fn fetch_run(
    state: &AppState,
    thread_id: &str,
    run_id: &str,
    user: &str,
) -> Result<Run, ApiError> {
    let run = state.coordinator.get_run_for(run_id, user).await?;
    if run.thread_id != thread_id {
        return Err(ApiError::not_found(format!("Run '{run_id}'")));
    }
    Ok(run)
}

/// Parse a `Last-Event-ID` value into a sequence cursor.
///
/// Accepts a bare sequence number or legacy `{run_id}_event_{n}` ids.
/// Anything else yields `None`, which streams the full history.
fn parse_cursor(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let sequence = raw
        .parse::<u64>()
        .ok()
        .or_else(|| raw.rsplit("_event_").next()?.parse().ok())?;
    (sequence > 0).then_some(sequence)
}

/// Convert internal events to wire events, disarming the disconnect guard
/// once a terminal event has gone out (or the stream ended on its own).
fn wire_stream<S>(
    events: S,
    preamble: Option<axum::response::sse::Event>,
    guard: Option<DisconnectGuard>,
) -> impl Stream<Item = axum::response::sse::Event> + Send + 'static
where
    S: Stream<Item = RunEvent> + Send + 'static,
{
    stream! {
        let mut guard = guard;
        if let Some(preamble) = preamble {
            yield preamble;
        }
        pin_mut!(events);
        while let Some(event) = events.next().await {
            let terminal = event.kind.is_terminal();
            if let Some(wire) = wire_event(&event) {
                yield wire;
            }
            if terminal {
                if let Some(guard) = guard.as_mut() {
                    guard.disarm();
                }
            }
        }
        if let Some(guard) = guard.as_mut() {
            guard.disarm();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_cursor;

    #[test]
    fn bare_sequence_cursor() {
        assert_eq!(parse_cursor("7"), Some(7));
        assert_eq!(parse_cursor(" 12 "), Some(12));
    }

    #[test]
    fn legacy_event_id_cursor() {
        assert_eq!(parse_cursor("abc123_event_8"), Some(8));
        assert_eq!(parse_cursor("mock_event_3"), Some(3));
    }

    #[test]
    fn foreign_cursors_fall_back_to_none() {
        assert_eq!(parse_cursor("not-a-cursor"), None);
        assert_eq!(parse_cursor("abc_event_x"), None);
        assert_eq!(parse_cursor("0"), None);
        assert_eq!(parse_cursor(""), None);
    }
}
