//! Health, readiness, config, shutdown, and version handlers.

use super::AppState;
use super::response::{bad_request, control_error};
use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub async fn healthz(State(state): State<AppState>) -> Response {
    if state.daemon.is_shutting_down() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "shutting_down"})),
        )
            .into_response()
    } else {
        Json(json!({"status": "ok"})).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ReadyQuery {
    process: Option<String>,
}

pub async fn readyz(State(state): State<AppState>, Query(query): Query<ReadyQuery>) -> Response {
    let Some(raw) = query.process else {
        return if state.daemon.is_ready() {
            Json(json!({"status": "ready"})).into_response()
        } else {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "not_ready"})),
            )
                .into_response()
        };
    };

    let names: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect();
    match state.daemon.check_ready(&names) {
        Err(error) => bad_request(error.to_string()),
        Ok(status) if status.ready => Json(json!({"status": "ready"})).into_response(),
        Ok(status) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "pending": status.pending})),
        )
            .into_response(),
    }
}

pub async fn get_config(State(state): State<AppState>) -> Response {
    Json(state.config.get_config()).into_response()
}

pub async fn reload_config(State(state): State<AppState>) -> Response {
    match state.config.reload() {
        Ok(outcome) => Json(json!({
            "status": "reloaded",
            "added": outcome.added,
            "changed": outcome.changed,
            "removed": outcome.removed,
        }))
        .into_response(),
        Err(error) => control_error(error),
    }
}

pub async fn shutdown(State(state): State<AppState>) -> Response {
    // Let the response leave the wire before the daemon starts tearing
    // the servers down.
    let daemon = state.daemon.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        daemon.shutdown();
    });
    Json(json!({"status": "shutting_down"})).into_response()
}

pub async fn version(State(state): State<AppState>) -> Response {
    Json(state.daemon.version()).into_response()
}
