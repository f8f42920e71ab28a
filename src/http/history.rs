//! History endpoints: hot-tier trends, month comparison, year-over-year.
//!
//! The history store is the sole source here; nothing recomputes from raw
//! telemetry. Months outside the hot tier answer with archive hints that
//! point at the cold-tier documents.

use super::{response, AppState};
use crate::history::epoch_month;
use axum::{
    extract::{Query, State},
    response::Response,
};
use serde::Deserialize;
use serde_json::{json, Value};

const RECENT_ALARMS_MAX: usize = 50;

pub async fn get_history(State(app): State<AppState>) -> Response {
    let st = app.state.read().await;

    let mut tanks: Vec<Value> = Vec::new();
    let mut keys: Vec<&(String, u32)> = st.history.rings().map(|(k, _)| k).collect();
    keys.sort();
    for key in keys {
        let ring = st.history.snapshots(&key.0, key.1).expect("key from rings()");
        let series: Vec<Value> = ring
            .iter()
            .map(|s| json!({"epoch": s.epoch, "level": s.level, "voltage": s.voltage}))
            .collect();
        tanks.push(json!({
            "device": key.0,
            "tank": key.1,
            "series": series,
        }));
    }

    let mut alarms: Vec<Value> = st
        .history
        .alarms()
        .map(|a| {
            json!({
                "epoch": a.epoch,
                "site": a.site,
                "device": a.device_uid,
                "tank": a.tank,
                "level": a.level,
                "isHigh": a.is_high,
                "cleared": a.cleared,
                "clearedEpoch": a.cleared_epoch,
            })
        })
        .collect();
    alarms.reverse();
    alarms.truncate(RECENT_ALARMS_MAX);

    let voltages: Vec<Value> = st
        .fleet
        .devices()
        .map(|d| {
            json!({
                "device": d.device_uid,
                "supplyVolts": d.supply_volts,
                "epoch": d.supply_volts_epoch,
            })
        })
        .collect();

    response::ok_json(json!({
        "tanks": tanks,
        "alarms": alarms,
        "voltages": voltages,
    }))
}

// ---------------------------------------------------------------------------
// Month-over-month comparison
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CompareQuery {
    current: Option<u32>,
    previous: Option<u32>,
}

fn month_payload(app_month: u32, stats: Vec<crate::history::MonthTankStats>) -> Value {
    json!({
        "month": app_month,
        "tanks": stats,
        "archiveHint": format!("history/{}_history.json", app_month),
    })
}

pub async fn compare_months(
    State(app): State<AppState>,
    Query(q): Query<CompareQuery>,
) -> Response {
    let st = app.state.read().await;
    let now_month = epoch_month(st.clock.now());
    let current = q.current.unwrap_or(now_month);
    let previous = q.previous.unwrap_or_else(|| prev_of(current));
    if !valid_month(current) || !valid_month(previous) {
        return response::bad_request("months must be YYYYMM");
    }
    response::ok_json(json!({
        "current": month_payload(current, st.history.month_stats(current)),
        "previous": month_payload(previous, st.history.month_stats(previous)),
    }))
}

// ---------------------------------------------------------------------------
// Year-over-year
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct YoyQuery {
    tank: String,
    years: Option<u32>,
}

pub async fn year_over_year(State(app): State<AppState>, Query(q): Query<YoyQuery>) -> Response {
    let Some((device_uid, tank_str)) = q.tank.rsplit_once(':') else {
        return response::bad_request("tank must be <deviceUid>:<tankNumber>");
    };
    let Ok(tank) = tank_str.parse::<u32>() else {
        return response::bad_request("tank number must be an integer");
    };
    let years = q.years.unwrap_or(1).clamp(1, 5);

    let st = app.state.read().await;
    let now_month = epoch_month(st.clock.now());
    if now_month == 0 {
        return response::internal_error("wall clock unavailable");
    }

    let mut months: Vec<Value> = Vec::new();
    for back in 0..=years {
        let month = now_month - back * 100;
        let stats = st
            .history
            .month_stats(month)
            .into_iter()
            .find(|s| s.device_uid == device_uid && s.tank == tank);
        months.push(json!({
            "month": month,
            "stats": stats,
            "archiveHint": format!("history/{}_history.json", month),
        }));
    }

    response::ok_json(json!({
        "device": device_uid,
        "tank": tank,
        "months": months,
    }))
}

fn valid_month(yyyymm: u32) -> bool {
    let month = yyyymm % 100;
    (1..=12).contains(&month) && yyyymm >= 200001 && yyyymm <= 299912
}

fn prev_of(yyyymm: u32) -> u32 {
    let (year, month) = (yyyymm / 100, yyyymm % 100);
    if month <= 1 {
        (year.saturating_sub(1)) * 100 + 12
    } else {
        year * 100 + month - 1
    }
}
