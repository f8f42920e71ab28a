//! Server state and the serial mutation task.
//!
//! All mutable stores live in one [`ServerState`] value behind an
//! `Arc<RwLock<_>>`. The serial task is the only writer: it runs the ingest
//! cadence, scheduled maintenance, and the commands HTTP handlers post over
//! the mpsc channel. HTTP readers take short-held read guards and never
//! hold them across I/O.

use crate::alerts::{self, EmailSchedule, ViewerSchedule};
use crate::bus::Bus;
use crate::calibration::{CalibrationEntry, CalibrationStore};
use crate::clock::FleetClock;
use crate::device_config::DeviceConfigStore;
use crate::error::{ServerError, ServerResult};
use crate::fleet::FleetState;
use crate::history::{FsArchive, HistoryStore};
use crate::ingest;
use crate::outbound;
use crate::serial::SerialStore;
use crate::settings::ServerSettings;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, trace, warn};

// ---------------------------------------------------------------------------
// ServerState
// ---------------------------------------------------------------------------

pub struct ServerState {
    pub clock: FleetClock,
    pub fleet: FleetState,
    pub calibrations: CalibrationStore,
    pub device_configs: DeviceConfigStore,
    pub history: HistoryStore,
    pub serial: SerialStore,
    pub settings: ServerSettings,
    pub email: EmailSchedule,
    pub viewer: ViewerSchedule,
    pub paused: bool,
    settings_path: PathBuf,
}

impl ServerState {
    /// Load every persisted piece from the data directory, creating it if
    /// needed. Always succeeds at boot: unreadable files fall back to
    /// empty stores with warnings.
    pub fn open(data_dir: &Path) -> ServerResult<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| ServerError::Storage(format!("create {}: {}", data_dir.display(), e)))?;
        let settings_path = data_dir.join("server_settings.json");
        Ok(ServerState {
            clock: FleetClock::new(),
            fleet: FleetState::new(),
            calibrations: CalibrationStore::load(data_dir),
            device_configs: DeviceConfigStore::load(&data_dir.join("device_configs.tsv")),
            history: HistoryStore::new(),
            serial: SerialStore::new(),
            settings: ServerSettings::load(&settings_path),
            email: EmailSchedule::new(),
            viewer: ViewerSchedule::new(),
            paused: false,
            settings_path,
        })
    }

    pub fn save_settings(&self) -> ServerResult<()> {
        self.settings.save(&self.settings_path)
    }
}

pub type SharedState = Arc<RwLock<ServerState>>;

// ---------------------------------------------------------------------------
// Commands from HTTP handlers
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SerialRequestOutcome {
    Dispatched,
    Throttled,
}

pub enum Command {
    SubmitCalibration {
        device_uid: String,
        tank: u32,
        sensor_reading: f64,
        verified_level: f64,
        notes: String,
        reply: oneshot::Sender<ServerResult<Value>>,
    },
    DispatchConfig {
        device_uid: String,
        config: Value,
        reply: oneshot::Sender<ServerResult<()>>,
    },
    Relay {
        device_uid: String,
        relay: u32,
        state: bool,
        source: String,
        reply: oneshot::Sender<ServerResult<()>>,
    },
    RelayClear {
        device_uid: String,
        tank: u32,
        source: String,
        reply: oneshot::Sender<ServerResult<()>>,
    },
    SerialRequest {
        device_uid: String,
        reply: oneshot::Sender<ServerResult<SerialRequestOutcome>>,
    },
    UpdateSettings {
        patch: Value,
        reply: oneshot::Sender<ServerResult<()>>,
    },
    SetPin {
        pin: String,
        reply: oneshot::Sender<ServerResult<()>>,
    },
    Refresh {
        reply: oneshot::Sender<()>,
    },
    SetPaused {
        paused: bool,
        reply: oneshot::Sender<bool>,
    },
}

// ---------------------------------------------------------------------------
// Serial task
// ---------------------------------------------------------------------------

/// Run the single mutation task until the command channel closes.
pub async fn run_serial_task<B: Bus>(
    state: SharedState,
    bus: Arc<B>,
    mut rx: mpsc::Receiver<Command>,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(interval = ?poll_interval, "serial task started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sync_clock(&state, &*bus).await;
                let paused = state.read().await.paused;
                if !paused {
                    ingest::run_cycle(&state, &*bus).await;
                }
                run_scheduled(&state, &*bus).await;
                // Watchdog liveness: one tick per cycle, well inside 30 s.
                trace!("serial task tick");
            }
            cmd = rx.recv() => match cmd {
                Some(cmd) => handle_command(&state, &*bus, cmd).await,
                None => {
                    info!("command channel closed, serial task stopping");
                    break;
                }
            }
        }
    }
}

async fn sync_clock<B: Bus>(state: &RwLock<ServerState>, bus: &B) {
    let needs = state.read().await.clock.needs_sync();
    if !needs {
        return;
    }
    match bus.current_time().await {
        Ok(epoch) => {
            state.write().await.clock.mark_synced(epoch);
            debug!(epoch, "clock synced from bus");
        }
        Err(e) => debug!(error = %e, "clock sync failed"),
    }
}

/// Scheduled work: daily email, viewer summary, hot-tier prune, monthly
/// archive. Each fire is guarded inside its own store, so calling every
/// poll tick is safe.
async fn run_scheduled<B: Bus>(state: &RwLock<ServerState>, bus: &B) {
    // Daily email.
    let email_body = {
        let mut st = state.write().await;
        let now = st.clock.now();
        let (hour, minute) = (st.settings.daily_email_hour, st.settings.daily_email_minute);
        if st.email.due(now, hour, minute) && !st.settings.email_to.is_empty() {
            Some(alerts::email_digest(&st.fleet, &st.settings))
        } else {
            None
        }
    };
    if let Some(body) = email_body {
        if let Err(e) = bus.enqueue("email.qo", body, true).await {
            warn!(error = %e, "daily email enqueue failed");
        }
    }

    // Viewer summary.
    let summary = {
        let mut st = state.write().await;
        let now = st.clock.now();
        let (every, base) = (
            st.settings.viewer_summary_hours,
            st.settings.viewer_base_hour,
        );
        if st.viewer.due(now, every, base) {
            Some(alerts::viewer_summary(&st.fleet))
        } else {
            None
        }
    };
    if let Some(body) = summary {
        if let Err(e) = bus.enqueue("viewer_summary.qo", body, false).await {
            warn!(error = %e, "viewer summary enqueue failed");
        }
    }

    // History maintenance.
    {
        let mut st = state.write().await;
        let now = st.clock.now();
        let retention = st.settings.hot_retention_days;
        st.history.prune(now, retention);
        let enabled = st.settings.archive_enabled && !st.settings.archive_root.is_empty();
        if enabled {
            let mut sink = FsArchive::new(st.settings.archive_root.clone());
            let _ = st.history.maybe_archive(now, true, &mut sink);
        }
    }
}

async fn handle_command<B: Bus>(state: &RwLock<ServerState>, bus: &B, cmd: Command) {
    match cmd {
        Command::SubmitCalibration {
            device_uid,
            tank,
            sensor_reading,
            verified_level,
            notes,
            reply,
        } => {
            let result = {
                let mut st = state.write().await;
                let epoch = st.clock.now();
                st.calibrations
                    .submit(CalibrationEntry {
                        epoch,
                        device_uid,
                        tank,
                        sensor_reading,
                        verified_level,
                        notes,
                    })
                    .map(|cal| {
                        json!({
                            "hasLearnedCalibration": cal.has_learned,
                            "slope": cal.slope,
                            "offset": cal.offset,
                            "rSquared": cal.r_squared,
                            "sampleCount": cal.sample_count,
                        })
                    })
            };
            let _ = reply.send(result);
        }
        Command::DispatchConfig {
            device_uid,
            config,
            reply,
        } => {
            let result = dispatch_config(state, bus, &device_uid, config).await;
            let _ = reply.send(result);
        }
        Command::Relay {
            device_uid,
            relay,
            state: relay_state,
            source,
            reply,
        } => {
            let result = outbound::dispatch_relay(bus, &device_uid, relay, relay_state, &source).await;
            let _ = reply.send(result);
        }
        Command::RelayClear {
            device_uid,
            tank,
            source,
            reply,
        } => {
            let result = outbound::dispatch_relay_clear(bus, &device_uid, tank, &source).await;
            let _ = reply.send(result);
        }
        Command::SerialRequest { device_uid, reply } => {
            let now_and_pass = {
                let mut st = state.write().await;
                let now = st.clock.now();
                (now, st.serial.try_begin_request(&device_uid, now))
            };
            let result = match now_and_pass {
                (_, false) => Ok(SerialRequestOutcome::Throttled),
                (now, true) => outbound::request_serial_logs(bus, &device_uid, now)
                    .await
                    .map(|()| SerialRequestOutcome::Dispatched),
            };
            let _ = reply.send(result);
        }
        Command::UpdateSettings { patch, reply } => {
            let result = {
                let mut st = state.write().await;
                match st.settings.apply_patch(&patch) {
                    Ok(()) => st.save_settings(),
                    Err(e) => Err(e),
                }
            };
            let _ = reply.send(result);
        }
        Command::SetPin { pin, reply } => {
            let result = {
                let mut st = state.write().await;
                match st.settings.set_pin(&pin) {
                    Ok(()) => st.save_settings(),
                    Err(e) => Err(e),
                }
            };
            let _ = reply.send(result);
        }
        Command::Refresh { reply } => {
            ingest::run_cycle(state, bus).await;
            let _ = reply.send(());
        }
        Command::SetPaused { paused, reply } => {
            let mut st = state.write().await;
            st.paused = paused;
            info!(paused, "ingest pause toggled");
            let _ = reply.send(st.paused);
        }
    }
}

/// Config dispatch: push to the device, then mirror into the local cache
/// so the decoder picks the new ranges up immediately.
async fn dispatch_config<B: Bus>(
    state: &RwLock<ServerState>,
    bus: &B,
    device_uid: &str,
    config: Value,
) -> ServerResult<()> {
    outbound::dispatch_config(bus, device_uid, config.clone()).await?;
    let mut st = state.write().await;
    st.device_configs.insert(device_uid, config)?;
    // Record the new full-scale values for calibration drift reporting.
    let maxes: Vec<(u32, f64)> = st
        .device_configs
        .get(device_uid)
        .map(|cfg| {
            cfg.tank_sensors()
                .map(|(tank, sensor)| (tank, sensor.range_max))
                .collect()
        })
        .unwrap_or_default();
    for (tank, max) in maxes {
        st.calibrations.note_config_max(device_uid, tank, max);
    }
    Ok(())
}
