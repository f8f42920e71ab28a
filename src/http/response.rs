//! JSON response envelope helpers.
//!
//! Mutating endpoints always answer `{success, message}` on 200 and
//! `{success: false, error}` on failure; the dashboards key off the status
//! code, never the text.

use crate::error::ServerError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub fn ok_message(message: impl Into<String>) -> Response {
    (
        StatusCode::OK,
        Json(json!({"success": true, "message": message.into()})),
    )
        .into_response()
}

pub fn ok_json(value: serde_json::Value) -> Response {
    (StatusCode::OK, Json(value)).into_response()
}

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({"success": false, "error": message.into()})),
    )
        .into_response()
}

pub fn bad_request(message: impl Into<String>) -> Response {
    error_response(StatusCode::BAD_REQUEST, message)
}

pub fn forbidden(message: impl Into<String>) -> Response {
    error_response(StatusCode::FORBIDDEN, message)
}

pub fn not_found(message: impl Into<String>) -> Response {
    error_response(StatusCode::NOT_FOUND, message)
}

pub fn throttled(message: impl Into<String>) -> Response {
    error_response(StatusCode::TOO_MANY_REQUESTS, message)
}

pub fn internal_error(message: impl Into<String>) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
}

/// Map a command failure onto the API status contract.
pub fn from_server_error(err: &ServerError) -> Response {
    match err {
        ServerError::Validation(m) => bad_request(m.clone()),
        ServerError::Capacity(m) => throttled(m.clone()),
        ServerError::TimeUnavailable => internal_error("wall clock unavailable"),
        ServerError::Transport(m) | ServerError::UpstreamRejected(m) | ServerError::Storage(m) => {
            internal_error(m.clone())
        }
    }
}
