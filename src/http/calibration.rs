//! Calibration endpoints.

use super::{require_pin, response, AppState};
use crate::state::Command;
use axum::{extract::State, response::Response, Json};
use serde_json::{json, Value};
use tokio::sync::oneshot;

const RECENT_ENTRIES_MAX: usize = 50;

pub async fn get_calibration(State(app): State<AppState>) -> Response {
    let st = app.state.read().await;
    let mut params: Vec<Value> = st
        .calibrations
        .params()
        .map(|c| {
            json!({
                "device": c.device_uid,
                "tank": c.tank,
                "slope": c.slope,
                "offset": c.offset,
                "rSquared": c.r_squared,
                "sampleCount": c.sample_count,
                "lastCalibrationEpoch": c.last_calibration_epoch,
                "configMaxValue": c.config_max_value,
                "hasLearnedCalibration": c.has_learned,
            })
        })
        .collect();
    params.sort_by(|a, b| {
        (a["device"].as_str(), a["tank"].as_u64()).cmp(&(b["device"].as_str(), b["tank"].as_u64()))
    });

    let entries: Vec<Value> = st
        .calibrations
        .recent_entries(RECENT_ENTRIES_MAX)
        .into_iter()
        .map(|e| {
            json!({
                "epoch": e.epoch,
                "device": e.device_uid,
                "tank": e.tank,
                "sensorReading": e.sensor_reading,
                "verifiedLevel": e.verified_level,
                "notes": e.notes,
            })
        })
        .collect();

    response::ok_json(json!({ "params": params, "entries": entries }))
}

pub async fn post_calibration(State(app): State<AppState>, Json(body): Json<Value>) -> Response {
    if let Err(resp) = require_pin(&app, &body).await {
        return resp;
    }

    let device_uid = match body
        .get("device")
        .or_else(|| body.get("c"))
        .and_then(|v| v.as_str())
    {
        Some(d) if !d.is_empty() => d.to_owned(),
        _ => return response::bad_request("device is required"),
    };
    let tank = match body
        .get("tank")
        .or_else(|| body.get("k"))
        .and_then(|v| v.as_u64())
    {
        Some(t) => t as u32,
        None => return response::bad_request("tank is required"),
    };
    let sensor_reading = match body.get("sensorReading").and_then(|v| v.as_f64()) {
        Some(r) if r.is_finite() && (0.0..=30.0).contains(&r) => r,
        _ => return response::bad_request("sensorReading must be 0-30 mA"),
    };
    let verified_level = match body.get("verifiedLevel").and_then(|v| v.as_f64()) {
        Some(l) if l.is_finite() => l,
        _ => return response::bad_request("verifiedLevel must be a number"),
    };
    let notes = body
        .get("notes")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_owned();

    let (reply, rx) = oneshot::channel();
    let cmd = Command::SubmitCalibration {
        device_uid,
        tank,
        sensor_reading,
        verified_level,
        notes,
        reply,
    };
    if app.tx.send(cmd).await.is_err() {
        return response::internal_error("serial task unavailable");
    }
    match rx.await {
        Ok(Ok(summary)) => response::ok_json(json!({
            "success": true,
            "message": "calibration entry recorded",
            "calibration": summary,
        })),
        Ok(Err(e)) => response::from_server_error(&e),
        Err(_) => response::internal_error("serial task dropped the request"),
    }
}
