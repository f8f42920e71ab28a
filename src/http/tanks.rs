//! Fleet snapshot endpoints: tanks, clients, unloads.

use super::{response, AppState};
use crate::fleet::TankRecord;
use axum::{extract::State, response::Response};
use serde_json::{json, Value};

fn render_tank(r: &TankRecord) -> Value {
    json!({
        "device": r.device_uid,
        "tank": r.tank,
        "site": r.site,
        "label": r.label,
        "contents": r.contents,
        "objectType": r.object_type.as_str(),
        "sensorInterface": r.sensor.as_str(),
        "unit": r.unit,
        "level": r.level,
        "sensorMa": r.sensor_ma,
        "sensorVolts": r.sensor_volts,
        "alarmActive": r.alarm_active,
        "alarmType": r.alarm_type,
        "lastUpdateEpoch": r.last_update_epoch,
        "previousLevel": r.previous_level,
        "previousLevelEpoch": r.previous_level_epoch,
    })
}

pub async fn list_tanks(State(app): State<AppState>) -> Response {
    let st = app.state.read().await;
    let tanks: Vec<Value> = st.fleet.iter().map(render_tank).collect();
    response::ok_json(json!({ "tanks": tanks }))
}

pub async fn list_clients(State(app): State<AppState>) -> Response {
    let st = app.state.read().await;

    let mut clients: Vec<Value> = Vec::new();
    for meta in st.fleet.devices() {
        let tank_count = st
            .fleet
            .iter()
            .filter(|r| r.device_uid == meta.device_uid)
            .count();
        clients.push(json!({
            "device": meta.device_uid,
            "supplyVolts": meta.supply_volts,
            "supplyVoltsEpoch": meta.supply_volts_epoch,
            "site": st.device_configs.site(&meta.device_uid),
            "tankCount": tank_count,
            "serial": st.serial.device_state(&meta.device_uid).map(|s| json!({
                "awaitingLogs": s.awaiting_logs,
                "lastAckEpoch": s.last_ack_epoch,
                "lastAckStatus": s.last_ack_status,
            })),
        }));
    }

    let server = json!({
        "paused": st.paused,
        "clockSynced": st.clock.is_synced(),
        "now": st.clock.now(),
        "tankCount": st.fleet.len(),
        "smsOnHigh": st.settings.sms_on_high,
        "smsOnLow": st.settings.sms_on_low,
        "smsOnClear": st.settings.sms_on_clear,
        "dailyEmailHour": st.settings.daily_email_hour,
        "dailyEmailMinute": st.settings.daily_email_minute,
        "archiveEnabled": st.settings.archive_enabled,
        "pinConfigured": !st.settings.admin_pin.is_empty(),
    });

    response::ok_json(json!({ "clients": clients, "server": server }))
}

pub async fn list_unloads(State(app): State<AppState>) -> Response {
    let st = app.state.read().await;
    let mut unloads: Vec<Value> = st
        .history
        .unloads()
        .map(|u| {
            json!({
                "eventEpoch": u.event_epoch,
                "peakEpoch": u.peak_epoch,
                "site": u.site,
                "device": u.device_uid,
                "label": u.tank_label,
                "tank": u.tank,
                "peakLevel": u.peak_level,
                "emptyLevel": u.empty_level,
                "peakSensorMa": u.peak_sensor_ma,
                "emptySensorMa": u.empty_sensor_ma,
                "smsSent": u.sms_sent,
                "emailQueued": u.email_queued,
            })
        })
        .collect();
    unloads.reverse();
    response::ok_json(json!({ "unloads": unloads }))
}
