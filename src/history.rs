//! Tiered history store.
//!
//! Hot tier: per-tank rings of hourly snapshots (7 days), the alarm log,
//! and the unload log, all in memory and rebuilt from scratch on restart.
//! Warm tier: nothing beyond the settings JSON; pruning keeps the hot tier
//! within its retention window. Cold tier: a monthly summary document
//! handed to an [`ArchiveSink`] once the calendar month rolls over.
//!
//! This store is the sole source for the `/api/history` endpoints; handlers
//! never recompute trends from raw telemetry.

use crate::error::{ServerError, ServerResult};
use chrono::{Datelike, TimeZone, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use tracing::{info, warn};

pub const HOURLY_RING_CAP: usize = 168;
pub const ALARM_LOG_CAP: usize = 100;
pub const UNLOAD_LOG_CAP: usize = 100;

// ---------------------------------------------------------------------------
// Entry types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LevelSnapshot {
    pub epoch: f64,
    pub level: f64,
    pub voltage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlarmEvent {
    pub epoch: f64,
    pub site: String,
    pub device_uid: String,
    pub tank: u32,
    pub level: f64,
    pub is_high: bool,
    pub cleared: bool,
    pub cleared_epoch: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnloadEvent {
    pub event_epoch: f64,
    pub peak_epoch: f64,
    pub site: String,
    pub device_uid: String,
    pub tank_label: String,
    pub tank: u32,
    pub peak_level: f64,
    pub empty_level: f64,
    pub peak_sensor_ma: f64,
    pub empty_sensor_ma: f64,
    pub sms_sent: bool,
    pub email_queued: bool,
}

/// Aggregate stats for one tank over one month.
#[derive(Debug, Clone, Serialize)]
pub struct MonthTankStats {
    pub device_uid: String,
    pub tank: u32,
    pub samples: usize,
    pub min_level: f64,
    pub max_level: f64,
    pub avg_level: f64,
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub avg_voltage: f64,
}

// ---------------------------------------------------------------------------
// ArchiveSink boundary
// ---------------------------------------------------------------------------

/// Destination for cold-tier monthly documents. The production FTP uploader
/// lives outside this crate; the filesystem sink below covers local use and
/// tests.
pub trait ArchiveSink {
    fn store(&mut self, relative_path: &str, contents: &[u8]) -> ServerResult<()>;
}

pub struct FsArchive {
    root: PathBuf,
}

impl FsArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsArchive { root: root.into() }
    }
}

impl ArchiveSink for FsArchive {
    fn store(&mut self, relative_path: &str, contents: &[u8]) -> ServerResult<()> {
        let path = self.root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ServerError::Storage(format!("mkdir {}: {}", parent.display(), e)))?;
        }
        std::fs::write(&path, contents)
            .map_err(|e| ServerError::Storage(format!("write {}: {}", path.display(), e)))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HistoryStore
// ---------------------------------------------------------------------------

pub struct HistoryStore {
    rings: HashMap<(String, u32), VecDeque<LevelSnapshot>>,
    alarms: VecDeque<AlarmEvent>,
    unloads: VecDeque<UnloadEvent>,
    last_prune_epoch: f64,
    /// YYYYMM of the last archived month, e.g. 202607.
    last_archived_month: u32,
}

impl HistoryStore {
    pub fn new() -> Self {
        HistoryStore {
            rings: HashMap::new(),
            alarms: VecDeque::new(),
            unloads: VecDeque::new(),
            last_prune_epoch: 0.0,
            last_archived_month: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Hot-tier writes (ingest hooks)
    // -----------------------------------------------------------------------

    pub fn push_snapshot(&mut self, device_uid: &str, tank: u32, snap: LevelSnapshot) {
        let ring = self
            .rings
            .entry((device_uid.to_owned(), tank))
            .or_default();
        if ring.len() >= HOURLY_RING_CAP {
            ring.pop_front();
        }
        ring.push_back(snap);
    }

    pub fn record_alarm(&mut self, event: AlarmEvent) {
        if self.alarms.len() >= ALARM_LOG_CAP {
            self.alarms.pop_front();
        }
        self.alarms.push_back(event);
    }

    /// Mark the most recent uncleared alarm for (device, tank) cleared.
    /// Returns false when no matching entry exists.
    pub fn clear_alarm(&mut self, device_uid: &str, tank: u32, cleared_epoch: f64) -> bool {
        for event in self.alarms.iter_mut().rev() {
            if event.device_uid == device_uid && event.tank == tank && !event.cleared {
                event.cleared = true;
                event.cleared_epoch = cleared_epoch;
                return true;
            }
        }
        false
    }

    pub fn record_unload(&mut self, event: UnloadEvent) {
        if self.unloads.len() >= UNLOAD_LOG_CAP {
            self.unloads.pop_front();
        }
        self.unloads.push_back(event);
    }

    // -----------------------------------------------------------------------
    // Hot-tier reads
    // -----------------------------------------------------------------------

    pub fn snapshots(&self, device_uid: &str, tank: u32) -> Option<&VecDeque<LevelSnapshot>> {
        self.rings.get(&(device_uid.to_owned(), tank))
    }

    pub fn rings(&self) -> impl Iterator<Item = (&(String, u32), &VecDeque<LevelSnapshot>)> {
        self.rings.iter()
    }

    pub fn alarms(&self) -> impl Iterator<Item = &AlarmEvent> {
        self.alarms.iter()
    }

    pub fn unloads(&self) -> impl Iterator<Item = &UnloadEvent> {
        self.unloads.iter()
    }

    /// Stats for every tank restricted to one YYYYMM month.
    pub fn month_stats(&self, yyyymm: u32) -> Vec<MonthTankStats> {
        let mut out = Vec::new();
        let mut keys: Vec<&(String, u32)> = self.rings.keys().collect();
        keys.sort();
        for key in keys {
            let ring = &self.rings[key];
            let mut samples = 0usize;
            let (mut min_l, mut max_l, mut sum_l) = (f64::MAX, f64::MIN, 0.0);
            let (mut min_v, mut max_v, mut sum_v) = (f64::MAX, f64::MIN, 0.0);
            for s in ring.iter().filter(|s| epoch_month(s.epoch) == yyyymm) {
                samples += 1;
                min_l = min_l.min(s.level);
                max_l = max_l.max(s.level);
                sum_l += s.level;
                min_v = min_v.min(s.voltage);
                max_v = max_v.max(s.voltage);
                sum_v += s.voltage;
            }
            if samples == 0 {
                continue;
            }
            let n = samples as f64;
            out.push(MonthTankStats {
                device_uid: key.0.clone(),
                tank: key.1,
                samples,
                min_level: min_l,
                max_level: max_l,
                avg_level: sum_l / n,
                min_voltage: min_v,
                max_voltage: max_v,
                avg_voltage: sum_v / n,
            });
        }
        out
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Drop snapshots older than the retention window. Runs at most once
    /// per day regardless of how often maintenance fires.
    pub fn prune(&mut self, now: f64, retention_days: u32) {
        if now <= 0.0 || now - self.last_prune_epoch < 86_400.0 {
            return;
        }
        self.last_prune_epoch = now;
        let cutoff = now - f64::from(retention_days) * 86_400.0;
        let mut dropped = 0usize;
        for ring in self.rings.values_mut() {
            while ring.front().is_some_and(|s| s.epoch < cutoff) {
                ring.pop_front();
                dropped += 1;
            }
        }
        if dropped > 0 {
            info!(dropped, retention_days, "pruned hot-tier snapshots");
        }
    }

    /// Archive the previous calendar month once it has fully rolled over.
    pub fn maybe_archive(
        &mut self,
        now: f64,
        enabled: bool,
        sink: &mut dyn ArchiveSink,
    ) -> ServerResult<()> {
        if !enabled || now <= 0.0 {
            return Ok(());
        }
        let prev = previous_month(now);
        if prev == 0 || prev == self.last_archived_month {
            return Ok(());
        }
        let doc = self.monthly_document(prev);
        let path = format!("history/{}_history.json", prev);
        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| ServerError::Storage(format!("encode archive: {}", e)))?;
        match sink.store(&path, &bytes) {
            Ok(()) => {
                self.last_archived_month = prev;
                info!(month = prev, path = %path, "archived monthly history");
                Ok(())
            }
            Err(e) => {
                warn!(month = prev, error = %e, "monthly archive failed, will retry");
                Err(e)
            }
        }
    }

    fn monthly_document(&self, yyyymm: u32) -> serde_json::Value {
        let alarms: Vec<&AlarmEvent> = self
            .alarms
            .iter()
            .filter(|a| epoch_month(a.epoch) == yyyymm)
            .collect();
        json!({
            "month": yyyymm,
            "tanks": self.month_stats(yyyymm),
            "alarms": alarms,
        })
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Month math
// ---------------------------------------------------------------------------

/// YYYYMM of an epoch, UTC. 0 for non-positive epochs.
pub fn epoch_month(epoch: f64) -> u32 {
    if epoch <= 0.0 {
        return 0;
    }
    match Utc.timestamp_opt(epoch as i64, 0).single() {
        Some(dt) => dt.year() as u32 * 100 + dt.month(),
        None => 0,
    }
}

/// YYYYMM of the month before the one containing `epoch`.
pub fn previous_month(epoch: f64) -> u32 {
    let current = epoch_month(epoch);
    if current == 0 {
        return 0;
    }
    let (year, month) = (current / 100, current % 100);
    if month == 1 {
        (year - 1) * 100 + 12
    } else {
        year * 100 + month - 1
    }
}
