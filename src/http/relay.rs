//! Relay command endpoints.

use super::{require_pin, response, AppState};
use crate::state::Command;
use axum::{extract::State, response::Response, Json};
use serde_json::Value;
use tokio::sync::oneshot;

const MAX_RELAY_NUMBER: u64 = 8;

fn device_from(body: &Value) -> Option<String> {
    body.get("device")
        .or_else(|| body.get("c"))
        .and_then(|v| v.as_str())
        .filter(|d| !d.is_empty())
        .map(str::to_owned)
}

pub async fn post_relay(State(app): State<AppState>, Json(body): Json<Value>) -> Response {
    if let Err(resp) = require_pin(&app, &body).await {
        return resp;
    }
    let Some(device_uid) = device_from(&body) else {
        return response::bad_request("device is required");
    };
    let relay = match body.get("relay").and_then(|v| v.as_u64()) {
        Some(r) if r <= MAX_RELAY_NUMBER => r as u32,
        _ => return response::bad_request("relay must be 0-8"),
    };
    let Some(state) = body.get("state").and_then(|v| v.as_bool()) else {
        return response::bad_request("state must be a boolean");
    };
    let source = body
        .get("source")
        .and_then(|v| v.as_str())
        .unwrap_or("operator")
        .to_owned();

    let (reply, rx) = oneshot::channel();
    let cmd = Command::Relay {
        device_uid,
        relay,
        state,
        source,
        reply,
    };
    if app.tx.send(cmd).await.is_err() {
        return response::internal_error("serial task unavailable");
    }
    match rx.await {
        Ok(Ok(())) => response::ok_message("relay command queued"),
        Ok(Err(e)) => response::from_server_error(&e),
        Err(_) => response::internal_error("serial task dropped the request"),
    }
}

pub async fn post_relay_clear(State(app): State<AppState>, Json(body): Json<Value>) -> Response {
    if let Err(resp) = require_pin(&app, &body).await {
        return resp;
    }
    let Some(device_uid) = device_from(&body) else {
        return response::bad_request("device is required");
    };
    let tank = match body
        .get("tank")
        .or_else(|| body.get("k"))
        .and_then(|v| v.as_u64())
    {
        Some(t) => t as u32,
        None => return response::bad_request("tank is required"),
    };
    let source = body
        .get("source")
        .and_then(|v| v.as_str())
        .unwrap_or("operator")
        .to_owned();

    let (reply, rx) = oneshot::channel();
    let cmd = Command::RelayClear {
        device_uid,
        tank,
        source,
        reply,
    };
    if app.tx.send(cmd).await.is_err() {
        return response::internal_error("serial task unavailable");
    }
    match rx.await {
        Ok(Ok(())) => response::ok_message("relay reset queued"),
        Ok(Err(e)) => response::from_server_error(&e),
        Err(_) => response::internal_error("serial task dropped the request"),
    }
}
