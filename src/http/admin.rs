//! Admin endpoints: config dispatch, server settings, PIN, refresh, pause.

use super::{require_pin, response, AppState};
use crate::state::Command;
use axum::{extract::State, response::Response, Json};
use serde_json::{json, Value};
use tokio::sync::oneshot;

pub async fn healthz() -> &'static str {
    "ok"
}

// ---------------------------------------------------------------------------
// POST /api/config — dispatch a per-device config and/or patch settings
// ---------------------------------------------------------------------------

pub async fn post_config(State(app): State<AppState>, Json(body): Json<Value>) -> Response {
    if let Err(resp) = require_pin(&app, &body).await {
        return resp;
    }

    let device = body
        .get("device")
        .or_else(|| body.get("c"))
        .and_then(|v| v.as_str());
    let config = body.get("config");
    let settings_patch = body.get("settings");

    if device.is_none() && settings_patch.is_none() {
        return response::bad_request("expected device+config and/or settings");
    }

    if let (Some(device), Some(config)) = (device, config) {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::DispatchConfig {
            device_uid: device.to_owned(),
            config: config.clone(),
            reply,
        };
        if app.tx.send(cmd).await.is_err() {
            return response::internal_error("serial task unavailable");
        }
        match rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return response::from_server_error(&e),
            Err(_) => return response::internal_error("serial task dropped the request"),
        }
    } else if device.is_some() {
        return response::bad_request("config object is required with device");
    }

    if let Some(patch) = settings_patch {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::UpdateSettings {
            patch: patch.clone(),
            reply,
        };
        if app.tx.send(cmd).await.is_err() {
            return response::internal_error("serial task unavailable");
        }
        match rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return response::from_server_error(&e),
            Err(_) => return response::internal_error("serial task dropped the request"),
        }
    }

    response::ok_message("config applied")
}

// ---------------------------------------------------------------------------
// POST /api/server-settings
// ---------------------------------------------------------------------------

pub async fn post_server_settings(
    State(app): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    if let Err(resp) = require_pin(&app, &body).await {
        return resp;
    }
    let patch = match body.get("settings") {
        Some(patch) => patch.clone(),
        None => {
            // The body itself is the patch; drop the PIN before applying.
            let mut patch = body.clone();
            if let Some(obj) = patch.as_object_mut() {
                obj.remove("pin");
            }
            patch
        }
    };

    let (reply, rx) = oneshot::channel();
    if app
        .tx
        .send(Command::UpdateSettings { patch, reply })
        .await
        .is_err()
    {
        return response::internal_error("serial task unavailable");
    }
    match rx.await {
        Ok(Ok(())) => response::ok_message("settings saved"),
        Ok(Err(e)) => response::from_server_error(&e),
        Err(_) => response::internal_error("serial task dropped the request"),
    }
}

// ---------------------------------------------------------------------------
// POST /api/pin — set, change, or verify
// ---------------------------------------------------------------------------

/// Initial PIN set is the one mutation allowed without an existing PIN;
/// otherwise nothing could ever configure one over the API.
pub async fn post_pin(State(app): State<AppState>, Json(body): Json<Value>) -> Response {
    let pin = body.get("pin").and_then(|v| v.as_str()).unwrap_or("");
    let new_pin = body.get("newPin").and_then(|v| v.as_str());

    let pin_configured = {
        let st = app.state.read().await;
        !st.settings.admin_pin.is_empty()
    };

    match new_pin {
        None => {
            // Verify only.
            let st = app.state.read().await;
            if st.settings.pin_matches(pin) {
                response::ok_message("PIN valid")
            } else {
                response::forbidden("missing or invalid PIN")
            }
        }
        Some(new_pin) => {
            if pin_configured {
                if let Err(resp) = require_pin(&app, &body).await {
                    return resp;
                }
            }
            let (reply, rx) = oneshot::channel();
            let cmd = Command::SetPin {
                pin: new_pin.to_owned(),
                reply,
            };
            if app.tx.send(cmd).await.is_err() {
                return response::internal_error("serial task unavailable");
            }
            match rx.await {
                Ok(Ok(())) => response::ok_message("PIN updated"),
                Ok(Err(e)) => response::from_server_error(&e),
                Err(_) => response::internal_error("serial task dropped the request"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// POST /api/refresh — immediate bus drain
// ---------------------------------------------------------------------------

pub async fn post_refresh(State(app): State<AppState>, Json(body): Json<Value>) -> Response {
    if let Err(resp) = require_pin(&app, &body).await {
        return resp;
    }
    let (reply, rx) = oneshot::channel();
    if app.tx.send(Command::Refresh { reply }).await.is_err() {
        return response::internal_error("serial task unavailable");
    }
    match rx.await {
        Ok(()) => response::ok_message("refresh complete"),
        Err(_) => response::internal_error("serial task dropped the request"),
    }
}

// ---------------------------------------------------------------------------
// POST /api/pause — toggle or set ingest pause
// ---------------------------------------------------------------------------

pub async fn post_pause(State(app): State<AppState>, Json(body): Json<Value>) -> Response {
    if let Err(resp) = require_pin(&app, &body).await {
        return resp;
    }
    let paused = match body.get("paused").and_then(|v| v.as_bool()) {
        Some(p) => p,
        None => !app.state.read().await.paused,
    };
    let (reply, rx) = oneshot::channel();
    if app
        .tx
        .send(Command::SetPaused { paused, reply })
        .await
        .is_err()
    {
        return response::internal_error("serial task unavailable");
    }
    match rx.await {
        Ok(paused) => response::ok_json(json!({
            "success": true,
            "message": if paused { "ingest paused" } else { "ingest resumed" },
            "paused": paused,
        })),
        Err(_) => response::internal_error("serial task dropped the request"),
    }
}
