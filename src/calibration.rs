//! Per-tank calibration learning.
//!
//! Operators submit verified (sensor reading, level) pairs; each accepted
//! entry recomputes an ordinary least squares fit over the full entry log
//! for that tank. The learned line overrides the config-based mapping once
//! two valid points exist and the determinant is non-degenerate.
//!
//! Entries with readings outside the 4-20 mA loop range are persisted for
//! the audit trail but excluded from the regression.
//!
//! # Persistence
//! - `calibration_entries.log`: append-only tab-delimited rows
//!   `epoch\tuid\ttank\treading\tlevel\tnotes`
//! - `calibration_params.tsv`: full rewrite per recompute,
//!   `uid\ttank\tslope\toffset\tr2\tcount\tepoch\tconfig_max`
//!
//! Truncated or unparsable lines are skipped with a warning on load.

use crate::error::{ServerError, ServerResult};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Cap on stored entries per tank; submissions beyond this are rejected.
pub const MAX_CALIBRATION_ENTRIES: usize = 50;

/// Valid regression domain (loop current, mA).
pub const SENSOR_READING_MIN: f64 = 4.0;
pub const SENSOR_READING_MAX: f64 = 20.0;

/// Determinant threshold below which the fit is degenerate.
const DENOM_EPSILON: f64 = 1e-4;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationEntry {
    pub epoch: f64,
    pub device_uid: String,
    pub tank: u32,
    pub sensor_reading: f64,
    pub verified_level: f64,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TankCalibration {
    pub device_uid: String,
    pub tank: u32,
    /// level = slope * sensor + offset
    pub slope: f64,
    pub offset: f64,
    pub r_squared: f64,
    pub sample_count: u32,
    pub last_calibration_epoch: f64,
    /// Original config full-scale value, kept for drift reporting.
    pub config_max_value: f64,
    pub has_learned: bool,
}

// ---------------------------------------------------------------------------
// CalibrationStore
// ---------------------------------------------------------------------------

pub struct CalibrationStore {
    entries: Vec<CalibrationEntry>,
    params: HashMap<(String, u32), TankCalibration>,
    entries_path: PathBuf,
    params_path: PathBuf,
}

impl CalibrationStore {
    pub fn load(dir: &Path) -> Self {
        let mut store = CalibrationStore {
            entries: Vec::new(),
            params: HashMap::new(),
            entries_path: dir.join("calibration_entries.log"),
            params_path: dir.join("calibration_params.tsv"),
        };
        store.load_entries();
        store.load_params();
        store
    }

    /// Submit one manual reading. The entry is persisted whether or not it
    /// falls in the regression domain; only in-domain entries train the fit.
    pub fn submit(&mut self, entry: CalibrationEntry) -> ServerResult<&TankCalibration> {
        let key = (entry.device_uid.clone(), entry.tank);
        let tank_count = self
            .entries
            .iter()
            .filter(|e| e.device_uid == key.0 && e.tank == key.1)
            .count();
        if tank_count >= MAX_CALIBRATION_ENTRIES {
            return Err(ServerError::Capacity(format!(
                "calibration log full for {} tank {} ({} entries)",
                key.0, key.1, MAX_CALIBRATION_ENTRIES
            )));
        }

        self.append_entry_line(&entry)?;
        self.entries.push(entry);
        self.recompute(&key.0, key.1);
        self.save_params()?;
        Ok(self.params.get(&key).expect("recompute always inserts"))
    }

    pub fn learned(&self, device_uid: &str, tank: u32) -> Option<&TankCalibration> {
        self.params
            .get(&(device_uid.to_owned(), tank))
            .filter(|c| c.has_learned)
    }

    pub fn params(&self) -> impl Iterator<Item = &TankCalibration> {
        self.params.values()
    }

    /// Most recent entries first, capped at `max`.
    pub fn recent_entries(&self, max: usize) -> Vec<&CalibrationEntry> {
        let start = self.entries.len().saturating_sub(max);
        self.entries[start..].iter().rev().collect()
    }

    /// Record the config full-scale value used for drift reporting. Called
    /// when a config dispatch changes the range of a calibrated tank.
    pub fn note_config_max(&mut self, device_uid: &str, tank: u32, config_max: f64) {
        if let Some(cal) = self.params.get_mut(&(device_uid.to_owned(), tank)) {
            cal.config_max_value = config_max;
        }
    }

    // -----------------------------------------------------------------------
    // Regression
    // -----------------------------------------------------------------------

    fn recompute(&mut self, device_uid: &str, tank: u32) {
        let key = (device_uid.to_owned(), tank);
        let mut n = 0u32;
        let (mut sx, mut sy, mut sxy, mut sxx, mut syy) = (0.0f64, 0.0, 0.0, 0.0, 0.0);
        let mut last_epoch = 0.0f64;
        let mut total = 0u32;

        for e in self
            .entries
            .iter()
            .filter(|e| e.device_uid == device_uid && e.tank == tank)
        {
            total += 1;
            last_epoch = last_epoch.max(e.epoch);
            let x = e.sensor_reading;
            let y = e.verified_level;
            if !(SENSOR_READING_MIN..=SENSOR_READING_MAX).contains(&x) || y < 0.0 {
                continue;
            }
            n += 1;
            sx += x;
            sy += y;
            sxy += x * y;
            sxx += x * x;
            syy += y * y;
        }

        let config_max = self
            .params
            .get(&key)
            .map(|c| c.config_max_value)
            .unwrap_or(0.0);

        let nf = f64::from(n);
        let denom = nf * sxx - sx * sx;
        let cal = if n < 2 || denom.abs() < DENOM_EPSILON {
            TankCalibration {
                device_uid: key.0.clone(),
                tank,
                slope: 0.0,
                offset: 0.0,
                r_squared: 0.0,
                sample_count: total,
                last_calibration_epoch: last_epoch,
                config_max_value: config_max,
                has_learned: false,
            }
        } else {
            let slope = (nf * sxy - sx * sy) / denom;
            let offset = (sy - slope * sx) / nf;
            let y_denom = nf * syy - sy * sy;
            let r_squared = if y_denom.abs() < DENOM_EPSILON {
                // All levels identical: the flat line explains everything.
                1.0
            } else {
                let num = nf * sxy - sx * sy;
                ((num * num) / (denom * y_denom)).clamp(0.0, 1.0)
            };
            TankCalibration {
                device_uid: key.0.clone(),
                tank,
                slope,
                offset,
                r_squared,
                sample_count: total,
                last_calibration_epoch: last_epoch,
                config_max_value: config_max,
                has_learned: true,
            }
        };
        self.params.insert(key, cal);
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn append_entry_line(&self, e: &CalibrationEntry) -> ServerResult<()> {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.entries_path)
            .map_err(|err| ServerError::Storage(format!("open entry log: {}", err)))?;
        // Notes are flattened to keep one entry per line.
        let notes = e.notes.replace(['\t', '\n'], " ");
        writeln!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}",
            e.epoch, e.device_uid, e.tank, e.sensor_reading, e.verified_level, notes
        )
        .map_err(|err| ServerError::Storage(format!("append entry: {}", err)))?;
        Ok(())
    }

    fn save_params(&self) -> ServerResult<()> {
        let write = || -> std::io::Result<()> {
            let mut f = std::fs::File::create(&self.params_path)?;
            for c in self.params.values() {
                writeln!(
                    f,
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    c.device_uid,
                    c.tank,
                    c.slope,
                    c.offset,
                    c.r_squared,
                    c.sample_count,
                    c.last_calibration_epoch,
                    c.config_max_value
                )?;
            }
            Ok(())
        };
        write().map_err(|e| {
            let _ = std::fs::remove_file(&self.params_path);
            warn!(path = %self.params_path.display(), error = %e, "params table write failed");
            ServerError::Storage(e.to_string())
        })
    }

    fn load_entries(&mut self) {
        let content = match std::fs::read_to_string(&self.entries_path) {
            Ok(c) => c,
            Err(_) => return,
        };
        let mut seen: HashMap<(String, u32), usize> = HashMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let fields: Vec<&str> = line.splitn(6, '\t').collect();
            if fields.len() < 5 {
                warn!(line = lineno + 1, "entry log: skipping truncated line");
                continue;
            }
            let parsed = (|| -> Option<CalibrationEntry> {
                Some(CalibrationEntry {
                    epoch: fields[0].parse().ok()?,
                    device_uid: fields[1].to_owned(),
                    tank: fields[2].parse().ok()?,
                    sensor_reading: fields[3].parse().ok()?,
                    verified_level: fields[4].parse().ok()?,
                    notes: fields.get(5).unwrap_or(&"").to_string(),
                })
            })();
            match parsed {
                Some(e) => {
                    let count = seen
                        .entry((e.device_uid.clone(), e.tank))
                        .or_insert(0);
                    if *count >= MAX_CALIBRATION_ENTRIES {
                        continue;
                    }
                    *count += 1;
                    self.entries.push(e);
                }
                None => {
                    warn!(line = lineno + 1, "entry log: skipping unparsable line");
                }
            }
        }
        // Rebuild params from entries so a lost params table self-heals.
        let keys: Vec<(String, u32)> = {
            let mut ks: Vec<_> = self
                .entries
                .iter()
                .map(|e| (e.device_uid.clone(), e.tank))
                .collect();
            ks.sort();
            ks.dedup();
            ks
        };
        for (uid, tank) in keys {
            self.recompute(&uid, tank);
        }
    }

    fn load_params(&mut self) {
        // The params table only contributes config_max_value; slopes come
        // from the recompute over the entry log.
        let content = match std::fs::read_to_string(&self.params_path) {
            Ok(c) => c,
            Err(_) => return,
        };
        for (lineno, line) in content.lines().enumerate() {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 8 {
                warn!(line = lineno + 1, "params table: skipping truncated line");
                continue;
            }
            let (Ok(tank), Ok(config_max)) =
                (fields[1].parse::<u32>(), fields[7].parse::<f64>())
            else {
                warn!(line = lineno + 1, "params table: skipping unparsable line");
                continue;
            };
            self.note_config_max(fields[0], tank, config_max);
        }
    }
}
