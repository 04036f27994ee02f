//! Group handlers.

use super::AppState;
use super::response::{bad_request, control_error};
use axum::{
    Json,
    extract::{Path, State},
    response::{IntoResponse, Response},
};
use serde_json::json;

pub async fn list_groups(State(state): State<AppState>) -> Response {
    Json(json!({"groups": state.groups.list_groups()})).into_response()
}

pub async fn group_op(
    State(state): State<AppState>,
    Path((name, op)): Path<(String, String)>,
) -> Response {
    let (result, status) = match op.as_str() {
        "start" => (state.groups.start_group(&name), "started"),
        "stop" => (state.groups.stop_group(&name), "stopped"),
        "restart" => (state.groups.restart_group(&name), "restarted"),
        _ => return bad_request("group operation must be start, stop, or restart"),
    };
    match result {
        Ok(()) => Json(json!({"status": status, "group": name})).into_response(),
        Err(error) => control_error(error),
    }
}
