//! Process handlers: listing, lifecycle verbs, signals, stdin, and log
//! snapshots.

use super::AppState;
use super::response::{bad_request, control_error, json_error};
use crate::control::LogStream;
use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection, rejection::QueryRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

const DEFAULT_LOG_LENGTH: usize = 1600;

pub async fn list_processes(State(state): State<AppState>) -> Response {
    Json(state.processes.list()).into_response()
}

pub async fn get_process(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.processes.get(&name) {
        Ok(info) => Json(info).into_response(),
        Err(error) => control_error(error),
    }
}

pub async fn start_process(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    if state.daemon.is_shutting_down() {
        return json_error(StatusCode::CONFLICT, "CONFLICT", "daemon is shutting down");
    }
    match state.processes.start(&name) {
        Ok(()) => Json(json!({"status": "started", "name": name})).into_response(),
        Err(error) => control_error(error),
    }
}

pub async fn stop_process(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.processes.stop(&name) {
        Ok(()) => Json(json!({"status": "stopped", "name": name})).into_response(),
        Err(error) => control_error(error),
    }
}

pub async fn restart_process(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.processes.restart(&name) {
        Ok(()) => Json(json!({"status": "restarted", "name": name})).into_response(),
        Err(error) => control_error(error),
    }
}

#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    #[serde(default)]
    signal: String,
}

pub async fn signal_process(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<SignalRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return bad_request("request body must be a JSON object with a signal field");
    };
    if request.signal.is_empty() {
        return bad_request("signal must not be empty");
    }
    match state.processes.signal(&name, &request.signal) {
        Ok(()) => Json(json!({"status": "signalled", "name": name})).into_response(),
        Err(error) => control_error(error),
    }
}

#[derive(Debug, Deserialize)]
pub struct StdinRequest {
    /// May be empty; an empty write is forwarded as-is.
    #[serde(default)]
    data: String,
}

pub async fn write_stdin(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<StdinRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return bad_request("request body must be a JSON object with a data field");
    };
    match state.processes.write_stdin(&name, request.data.as_bytes()) {
        Ok(()) => Json(json!({"status": "written", "name": name})).into_response(),
        Err(error) => control_error(error),
    }
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    offset: i64,
    length: Option<usize>,
}

pub async fn read_log(
    State(state): State<AppState>,
    Path((name, stream)): Path<(String, String)>,
    query: Result<Query<LogQuery>, QueryRejection>,
) -> Response {
    let Some(stream) = LogStream::parse(&stream) else {
        return bad_request("log stream must be stdout or stderr");
    };
    let Ok(Query(query)) = query else {
        return bad_request("offset must be an integer and length a positive integer");
    };
    let length = query.length.unwrap_or(DEFAULT_LOG_LENGTH);
    if length == 0 {
        return bad_request("length must be a positive integer");
    }
    match state.processes.read_log(&name, stream, query.offset, length) {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            bytes,
        )
            .into_response(),
        Err(error) => control_error(error),
    }
}
