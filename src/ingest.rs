//! Ingest pipeline: drain inbound notefiles and apply them to server state.
//!
//! One pass drains each file in a fixed order, bounded per file so a noisy
//! queue cannot starve the rest. Handlers are synchronous state mutations
//! that return the outbound notes (SMS, etc.) to enqueue after the lock is
//! released; the serial task is the only caller.
//!
//! A malformed note is dropped with a warning on the server serial ring.
//! Ingest never aborts: transport errors skip the file until the next pass.

use crate::alerts;
use crate::bus::{Bus, Note};
use crate::decode::{self, RawReading, SENSOR_PRESENT_MA};
use crate::fleet::{ObjectType, SensorKind, TankRecord};
use crate::history::{AlarmEvent, LevelSnapshot, UnloadEvent};
use crate::serial::{LogLevel, SerialEntry};
use crate::state::ServerState;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

/// Per-file drain bound for one pass.
pub const MAX_NOTES_PER_FILE: usize = 10;

/// Samples this far beyond the stored baseline epoch roll the baseline.
const BASELINE_WINDOW_SECS: f64 = 22.0 * 3600.0;

// ---------------------------------------------------------------------------
// Notefiles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteFile {
    Telemetry,
    Alarm,
    Daily,
    Unload,
    SerialLog,
    SerialAck,
}

impl NoteFile {
    pub fn file_name(self) -> &'static str {
        match self {
            NoteFile::Telemetry => "telemetry.qi",
            NoteFile::Alarm => "alarm.qi",
            NoteFile::Daily => "daily.qi",
            NoteFile::Unload => "unload.qi",
            NoteFile::SerialLog => "serial_log.qi",
            NoteFile::SerialAck => "serial_ack.qi",
        }
    }
}

/// Fixed drain order for every pass.
pub const DRAIN_ORDER: [NoteFile; 6] = [
    NoteFile::Telemetry,
    NoteFile::Alarm,
    NoteFile::Daily,
    NoteFile::Unload,
    NoteFile::SerialLog,
    NoteFile::SerialAck,
];

/// An outbound note produced by a handler, enqueued after state commit.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub file: String,
    pub body: Value,
    pub sync: bool,
}

// ---------------------------------------------------------------------------
// Wire bodies (short keys canonical, long-form aliases accepted)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TelemetryNote {
    #[serde(alias = "client")]
    pub c: String,
    #[serde(default, alias = "site")]
    pub s: String,
    #[serde(default, alias = "label")]
    pub n: String,
    #[serde(default, alias = "contents")]
    pub cn: String,
    #[serde(alias = "tank")]
    pub k: u32,
    #[serde(default, alias = "objectType")]
    pub ot: Option<String>,
    #[serde(default, alias = "sensorInterface", alias = "st", alias = "sensorType")]
    pub si: Option<String>,
    #[serde(default, alias = "measurementUnit")]
    pub mu: Option<String>,
    #[serde(default, alias = "sensorMa")]
    pub ma: Option<f64>,
    #[serde(default)]
    pub vt: Option<f64>,
    #[serde(default)]
    pub fl: Option<bool>,
    #[serde(default)]
    pub rm: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct AlarmNote {
    #[serde(alias = "client")]
    pub c: String,
    #[serde(default, alias = "site")]
    pub s: String,
    #[serde(alias = "tank")]
    pub k: u32,
    #[serde(alias = "type")]
    pub y: String,
    #[serde(default, alias = "sensorMa")]
    pub ma: Option<f64>,
    #[serde(default)]
    pub vt: Option<f64>,
    #[serde(default)]
    pub fl: Option<bool>,
    #[serde(default)]
    pub rm: Option<f64>,
    #[serde(default, alias = "smsEnabled")]
    pub se: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct DailyTankSummary {
    #[serde(alias = "tank")]
    pub k: u32,
    #[serde(default, alias = "label")]
    pub n: String,
    #[serde(default, alias = "contents")]
    pub cn: String,
    #[serde(default, alias = "objectType")]
    pub ot: Option<String>,
    #[serde(default, alias = "sensorInterface", alias = "st", alias = "sensorType")]
    pub si: Option<String>,
    #[serde(default, alias = "measurementUnit")]
    pub mu: Option<String>,
    #[serde(default, alias = "sensorMa")]
    pub ma: Option<f64>,
    #[serde(default)]
    pub vt: Option<f64>,
    #[serde(default)]
    pub fl: Option<bool>,
    #[serde(default)]
    pub rm: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct DailyNote {
    #[serde(alias = "client")]
    pub c: String,
    #[serde(default, alias = "site")]
    pub s: String,
    /// Multi-part reports: device-wide fields ride on part 1 only.
    #[serde(default = "default_part", alias = "part")]
    pub p: u32,
    #[serde(default, alias = "voltage")]
    pub v: Option<f64>,
    #[serde(default)]
    pub tanks: Vec<DailyTankSummary>,
}

fn default_part() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct UnloadNote {
    #[serde(alias = "client")]
    pub c: String,
    #[serde(default, alias = "site")]
    pub s: String,
    #[serde(default, alias = "label")]
    pub n: String,
    #[serde(alias = "tank")]
    pub k: u32,
    #[serde(alias = "peakLevel")]
    pub pk: f64,
    #[serde(alias = "emptyLevel")]
    pub em: f64,
    #[serde(default, alias = "peakEpoch")]
    pub pt: f64,
    #[serde(default, alias = "eventEpoch")]
    pub t: f64,
    #[serde(default, alias = "peakMa")]
    pub pma: Option<f64>,
    #[serde(default, alias = "emptyMa")]
    pub ema: Option<f64>,
    #[serde(default)]
    pub sms: Option<bool>,
    #[serde(default)]
    pub email: Option<bool>,
    #[serde(default, alias = "measurementUnit")]
    pub mu: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SerialLogLine {
    #[serde(default)]
    pub timestamp: f64,
    pub message: String,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SerialLogNote {
    #[serde(alias = "c")]
    pub client: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub logs: Option<Vec<SerialLogLine>>,
}

#[derive(Debug, Deserialize)]
pub struct SerialAckNote {
    #[serde(alias = "c")]
    pub client: String,
    #[serde(default)]
    pub status: String,
}

// ---------------------------------------------------------------------------
// Drain loop
// ---------------------------------------------------------------------------

/// One full ingest pass: drain every file in order and apply each note.
///
/// The write lock is held per note, never across bus I/O.
pub async fn run_cycle<B: Bus>(state: &RwLock<ServerState>, bus: &B) {
    for file in DRAIN_ORDER {
        let notes = match bus.drain(file.file_name(), MAX_NOTES_PER_FILE).await {
            Ok(notes) => notes,
            Err(e) => {
                warn!(file = file.file_name(), error = %e, "notefile drain failed");
                continue;
            }
        };
        for note in notes {
            let outbound = {
                let mut st = state.write().await;
                handle_note(&mut st, file, &note)
            };
            for out in outbound {
                if let Err(e) = bus.enqueue(&out.file, out.body, out.sync).await {
                    warn!(file = %out.file, error = %e, "outbound enqueue failed");
                }
            }
        }
    }
}

/// Dispatch one note to its typed handler.
pub fn handle_note(state: &mut ServerState, file: NoteFile, note: &Note) -> Vec<Outbound> {
    let now = state.clock.now();
    let epoch = if note.epoch > 0.0 { note.epoch } else { now };
    match file {
        NoteFile::Telemetry => parse_or_drop(state, now, &note.body, |st, n| {
            handle_telemetry(st, n, epoch);
            Vec::new()
        }),
        NoteFile::Alarm => parse_or_drop(state, now, &note.body, |st, n| {
            handle_alarm(st, n, epoch, now)
        }),
        NoteFile::Daily => parse_or_drop(state, now, &note.body, |st, n| {
            handle_daily(st, n, epoch);
            Vec::new()
        }),
        NoteFile::Unload => parse_or_drop(state, now, &note.body, |st, n| {
            handle_unload(st, n, epoch, now)
        }),
        NoteFile::SerialLog => parse_or_drop(state, now, &note.body, |st, n| {
            handle_serial_log(st, n, epoch);
            Vec::new()
        }),
        NoteFile::SerialAck => parse_or_drop(state, now, &note.body, |st, n| {
            handle_serial_ack(st, n, now);
            Vec::new()
        }),
    }
}

fn parse_or_drop<'de, N, F>(
    state: &mut ServerState,
    now: f64,
    body: &'de Value,
    apply: F,
) -> Vec<Outbound>
where
    N: Deserialize<'de>,
    F: FnOnce(&mut ServerState, N) -> Vec<Outbound>,
{
    match N::deserialize(body) {
        Ok(note) => apply(state, note),
        Err(e) => {
            warn!(error = %e, "dropping malformed note");
            state
                .serial
                .server_warn(now, format!("dropped malformed note: {}", e));
            Vec::new()
        }
    }
}

// ---------------------------------------------------------------------------
// Shared record plumbing
// ---------------------------------------------------------------------------

/// Refresh descriptive metadata. Empty strings never erase existing values;
/// this applies uniformly across telemetry, alarm, and daily handlers.
fn refresh_metadata(
    rec: &mut TankRecord,
    site: &str,
    label: &str,
    contents: &str,
    object_type: Option<&str>,
    sensor: Option<&str>,
    unit: Option<&str>,
) {
    if !site.is_empty() {
        rec.site = site.to_owned();
    }
    if !label.is_empty() {
        rec.label = label.to_owned();
    }
    if !contents.is_empty() {
        rec.contents = contents.to_owned();
    }
    if let Some(ot) = object_type.and_then(ObjectType::parse) {
        rec.object_type = ot;
    }
    if let Some(kind) = sensor.and_then(SensorKind::parse) {
        rec.sensor = kind;
    }
    if let Some(mu) = unit.filter(|u| !u.is_empty()) {
        rec.unit = mu.to_owned();
    }
}

/// 24-hour baseline rule. On a strictly newer sample: if the baseline is
/// unset, or the stored epoch is at least 22 h past it, roll the stored
/// (level, epoch) pair into the baseline before the commit.
fn apply_baseline(rec: &mut TankRecord, incoming_epoch: f64) {
    if rec.last_update_epoch <= 0.0 || incoming_epoch <= rec.last_update_epoch {
        return;
    }
    if rec.previous_level_epoch == 0.0
        || rec.last_update_epoch - rec.previous_level_epoch >= BASELINE_WINDOW_SECS
    {
        rec.previous_level = rec.level;
        rec.previous_level_epoch = rec.last_update_epoch;
    }
}

/// True when the note carries the raw field the record's sensor kind reads.
fn has_carrier(kind: SensorKind, ma: Option<f64>, vt: Option<f64>, fl: Option<bool>, rm: Option<f64>) -> bool {
    match kind {
        SensorKind::CurrentLoop => ma.is_some(),
        SensorKind::Analog => vt.is_some(),
        SensorKind::Digital => fl.is_some(),
        SensorKind::Pulse => rm.is_some(),
    }
}

/// Commit raw sensor values onto the record. Loop current below the 4 mA
/// presence floor is stored as 0.
fn commit_raw(rec: &mut TankRecord, ma: Option<f64>, vt: Option<f64>) {
    if let Some(ma) = ma {
        rec.sensor_ma = if ma >= SENSOR_PRESENT_MA { ma } else { 0.0 };
    }
    if let Some(vt) = vt {
        rec.sensor_volts = vt;
    }
}

struct SampleFields {
    ma: Option<f64>,
    vt: Option<f64>,
    fl: Option<bool>,
    rm: Option<f64>,
}

/// Shared telemetry/daily sample path: derive the level, roll the baseline,
/// commit the sample. Returns the derived level when one was computed.
fn commit_sample(state: &mut ServerState, device_uid: &str, tank: u32, epoch: f64, fields: &SampleFields) -> Option<f64> {
    let kind = state.fleet.lookup(device_uid, tank)?.sensor;
    if !has_carrier(kind, fields.ma, fields.vt, fields.fl, fields.rm) {
        let rec = state.fleet.lookup_mut(device_uid, tank)?;
        commit_raw(rec, fields.ma, fields.vt);
        rec.last_update_epoch = rec.last_update_epoch.max(epoch);
        return None;
    }
    let raw = RawReading {
        ma: fields.ma.unwrap_or(0.0),
        volts: fields.vt.unwrap_or(0.0),
        digital: fields.fl.unwrap_or(false),
        pulse: fields.rm.unwrap_or(0.0),
    };
    let level = decode::derive_level(
        state.calibrations.learned(device_uid, tank),
        state.device_configs.tank_sensor(device_uid, tank),
        kind,
        &raw,
    );
    let rec = state.fleet.lookup_mut(device_uid, tank)?;
    apply_baseline(rec, epoch);
    rec.level = level;
    commit_raw(rec, fields.ma, fields.vt);
    rec.last_update_epoch = rec.last_update_epoch.max(epoch);
    Some(level)
}

fn capacity_warn(state: &mut ServerState, now: f64, device_uid: &str, tank: u32) {
    warn!(device = %device_uid, tank, "tank table full, rejecting record");
    state.serial.server_warn(
        now,
        format!("tank table full: rejected {} tank {}", device_uid, tank),
    );
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

fn handle_telemetry(state: &mut ServerState, note: TelemetryNote, epoch: f64) {
    let now = state.clock.now();
    if state.fleet.upsert(&note.c, note.k).is_none() {
        capacity_warn(state, now, &note.c, note.k);
        return;
    }
    {
        let rec = state
            .fleet
            .lookup_mut(&note.c, note.k)
            .expect("record just upserted");
        // Zeroed records already carry the "tank" default for object type.
        refresh_metadata(
            rec,
            &note.s,
            &note.n,
            &note.cn,
            note.ot.as_deref(),
            note.si.as_deref(),
            note.mu.as_deref(),
        );
    }
    let fields = SampleFields {
        ma: note.ma,
        vt: note.vt,
        fl: note.fl,
        rm: note.rm,
    };
    if let Some(level) = commit_sample(state, &note.c, note.k, epoch, &fields) {
        let voltage = note.vt.unwrap_or(0.0);
        state.history.push_snapshot(
            &note.c,
            note.k,
            LevelSnapshot {
                epoch,
                level,
                voltage,
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Alarms
// ---------------------------------------------------------------------------

fn is_clear_type(y: &str) -> bool {
    matches!(y, "clear" | "sensor-recovered")
}

fn is_diagnostic_type(y: &str) -> bool {
    matches!(y, "sensor-fault" | "sensor-stuck" | "sensor-recovered")
}

fn is_digital_type(y: &str) -> bool {
    matches!(y, "triggered" | "not_triggered")
}

fn sms_policy_allows(state: &ServerState, y: &str) -> bool {
    match y {
        "low" => state.settings.sms_on_low,
        "clear" => state.settings.sms_on_clear,
        // Digital transitions are treated as high-severity.
        _ => state.settings.sms_on_high,
    }
}

fn handle_alarm(state: &mut ServerState, note: AlarmNote, epoch: f64, now: f64) -> Vec<Outbound> {
    if state.fleet.upsert(&note.c, note.k).is_none() {
        capacity_warn(state, now, &note.c, note.k);
        return Vec::new();
    }

    // Recompute the level from the carried raw fields so the alarm text
    // and the log entry reflect the reading that tripped it.
    let kind = state
        .fleet
        .lookup(&note.c, note.k)
        .map(|r| r.sensor)
        .unwrap_or(SensorKind::Analog);
    let level = if has_carrier(kind, note.ma, note.vt, note.fl, note.rm) {
        let raw = RawReading {
            ma: note.ma.unwrap_or(0.0),
            volts: note.vt.unwrap_or(0.0),
            digital: note.fl.unwrap_or(false),
            pulse: note.rm.unwrap_or(0.0),
        };
        decode::derive_level(
            state.calibrations.learned(&note.c, note.k),
            state.device_configs.tank_sensor(&note.c, note.k),
            kind,
            &raw,
        )
    } else {
        state
            .fleet
            .lookup(&note.c, note.k)
            .map(|r| r.level)
            .unwrap_or(0.0)
    };

    let cleared = is_clear_type(&note.y);
    let digital = is_digital_type(&note.y);
    {
        let rec = state
            .fleet
            .lookup_mut(&note.c, note.k)
            .expect("record just upserted");
        if !note.s.is_empty() {
            rec.site = note.s.clone();
        }
        commit_raw(rec, note.ma, note.vt);
        rec.last_update_epoch = rec.last_update_epoch.max(epoch);
        // Alarm state machine: Normal → Alarm(type) → Normal via clear.
        // Recovery keeps its token visible in alarm_type for the operator.
        rec.alarm_active = !cleared;
        rec.alarm_type = note.y.clone();
    }

    if cleared {
        state.history.clear_alarm(&note.c, note.k, now);
    } else {
        let site = state
            .fleet
            .lookup(&note.c, note.k)
            .map(|r| r.site.clone())
            .unwrap_or_default();
        state.history.record_alarm(AlarmEvent {
            epoch,
            site,
            device_uid: note.c.clone(),
            tank: note.k,
            level,
            is_high: note.y == "high" || note.y == "triggered",
            cleared: false,
            cleared_epoch: 0.0,
        });
    }

    // SMS policy: diagnostics never page, the per-note flag can opt out,
    // server policy gates the kind, then the per-tank rate limit runs.
    if is_diagnostic_type(&note.y) || note.se == Some(false) || !sms_policy_allows(state, &note.y) {
        return Vec::new();
    }
    let site = state
        .fleet
        .lookup(&note.c, note.k)
        .map(|r| r.site.clone())
        .unwrap_or_default();
    let rec = state
        .fleet
        .lookup_mut(&note.c, note.k)
        .expect("record just upserted");
    if !alerts::sms_gate(rec, now) {
        return Vec::new();
    }
    let text = alerts::alarm_sms_text(&site, note.k, &note.y, level, digital);
    vec![Outbound {
        file: "sms.qo".to_owned(),
        body: alerts::sms_body(&text, &state.settings),
        sync: true,
    }]
}

// ---------------------------------------------------------------------------
// Daily reports
// ---------------------------------------------------------------------------

fn handle_daily(state: &mut ServerState, note: DailyNote, epoch: f64) {
    let now = state.clock.now();
    if note.p == 1 {
        if let Some(v) = note.v {
            match state.fleet.device_meta_mut(&note.c) {
                Some(meta) => {
                    meta.supply_volts = v;
                    meta.supply_volts_epoch = epoch;
                }
                None => {
                    warn!(device = %note.c, "device metadata table full");
                    state
                        .serial
                        .server_warn(now, format!("device metadata table full: {}", note.c));
                }
            }
        }
    }

    for tank in &note.tanks {
        if state.fleet.upsert(&note.c, tank.k).is_none() {
            capacity_warn(state, now, &note.c, tank.k);
            continue;
        }
        {
            let rec = state
                .fleet
                .lookup_mut(&note.c, tank.k)
                .expect("record just upserted");
            refresh_metadata(
                rec,
                &note.s,
                &tank.n,
                &tank.cn,
                tank.ot.as_deref(),
                tank.si.as_deref(),
                tank.mu.as_deref(),
            );
        }
        let fields = SampleFields {
            ma: tank.ma,
            vt: tank.vt,
            fl: tank.fl,
            rm: tank.rm,
        };
        commit_sample(state, &note.c, tank.k, epoch, &fields);
    }
}

// ---------------------------------------------------------------------------
// Unloads
// ---------------------------------------------------------------------------

fn handle_unload(state: &mut ServerState, note: UnloadNote, epoch: f64, now: f64) -> Vec<Outbound> {
    if state.fleet.upsert(&note.c, note.k).is_none() {
        capacity_warn(state, now, &note.c, note.k);
        return Vec::new();
    }
    {
        let rec = state
            .fleet
            .lookup_mut(&note.c, note.k)
            .expect("record just upserted");
        refresh_metadata(rec, &note.s, &note.n, "", None, None, note.mu.as_deref());
    }

    let mut outbound = Vec::new();
    let mut sms_sent = false;
    if note.sms == Some(true) {
        let site = state
            .fleet
            .lookup(&note.c, note.k)
            .map(|r| r.site.clone())
            .unwrap_or_default();
        let rec = state
            .fleet
            .lookup_mut(&note.c, note.k)
            .expect("record just upserted");
        if alerts::sms_gate(rec, now) {
            sms_sent = true;
            let text = alerts::unload_sms_text(&site, note.k, note.pk, note.em);
            outbound.push(Outbound {
                file: "sms.qo".to_owned(),
                body: alerts::sms_body(&text, &state.settings),
                sync: true,
            });
        }
    }

    let (site, label) = state
        .fleet
        .lookup(&note.c, note.k)
        .map(|r| (r.site.clone(), r.label.clone()))
        .unwrap_or_default();
    state.history.record_unload(UnloadEvent {
        event_epoch: if note.t > 0.0 { note.t } else { epoch },
        peak_epoch: note.pt,
        site,
        device_uid: note.c.clone(),
        tank_label: label,
        tank: note.k,
        peak_level: note.pk,
        empty_level: note.em,
        peak_sensor_ma: note.pma.unwrap_or(0.0),
        empty_sensor_ma: note.ema.unwrap_or(0.0),
        sms_sent,
        email_queued: note.email == Some(true),
    });
    outbound
}

// ---------------------------------------------------------------------------
// Serial logs and acks
// ---------------------------------------------------------------------------

fn handle_serial_log(state: &mut ServerState, note: SerialLogNote, epoch: f64) {
    let now = state.clock.now();
    let mut dropped = false;
    if let Some(message) = note.message.filter(|m| !m.is_empty()) {
        dropped |= !state.serial.push_device(
            &note.client,
            SerialEntry {
                epoch,
                message,
                level: LogLevel::Info,
                source: "client".to_owned(),
            },
        );
    }
    for line in note.logs.unwrap_or_default() {
        let entry = SerialEntry {
            epoch: if line.timestamp > 0.0 { line.timestamp } else { epoch },
            message: line.message,
            level: LogLevel::parse(line.level.as_deref().unwrap_or("info")),
            source: line.source.unwrap_or_else(|| "client".to_owned()),
        };
        dropped |= !state.serial.push_device(&note.client, entry);
    }
    if dropped {
        warn!(device = %note.client, "serial ring table full, dropping entries");
        state
            .serial
            .server_warn(now, format!("serial ring table full: {}", note.client));
    }
}

fn handle_serial_ack(state: &mut ServerState, note: SerialAckNote, now: f64) {
    state.serial.ack(&note.client, &note.status, now);
}
