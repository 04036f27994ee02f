//! JSON response conventions shared by every handler.
//!
//! Errors always reach the client as `{"error": "<message>", "code":
//! "<CODE>"}` with `CODE` one of BAD_REQUEST, NOT_FOUND, CONFLICT,
//! UNAUTHORIZED, SERVER_ERROR.

use crate::control::ControlError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

pub(crate) fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
            code: code.into(),
        }),
    )
        .into_response()
}

pub fn bad_request(message: impl Into<String>) -> Response {
    json_error(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
}

pub fn not_found(message: impl Into<String>) -> Response {
    json_error(StatusCode::NOT_FOUND, "NOT_FOUND", message)
}

pub fn conflict(message: impl Into<String>) -> Response {
    json_error(StatusCode::CONFLICT, "CONFLICT", message)
}

pub fn unauthorized(message: impl Into<String>) -> Response {
    json_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
}

pub fn server_error(message: impl Into<String>) -> Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "SERVER_ERROR", message)
}

/// Total mapping from collaborator errors to HTTP responses.
pub fn control_error(error: ControlError) -> Response {
    let message = error.to_string();
    match error {
        ControlError::NoSuchProcess(_) | ControlError::NoSuchGroup(_) => not_found(message),
        ControlError::AlreadyStarted(_) => conflict(message),
        ControlError::NotRunning(_)
        | ControlError::InvalidSignal(_)
        | ControlError::StdinNotAccepted(_) => bad_request(message),
        ControlError::Internal(_) => server_error(message),
    }
}
