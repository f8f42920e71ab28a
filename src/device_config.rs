//! Per-device configuration snapshot cache.
//!
//! The server keeps the last configuration it dispatched to (or restored
//! for) each device. The sensor decoder reads the extracted per-tank sensor
//! parameters; everything else treats the snapshot as an opaque JSON blob.
//!
//! Disk mirror: one tab-delimited line per device, `uid\t<json>`. Truncated
//! or unparsable lines are skipped with a warning on load. A failed rewrite
//! removes the partial file; memory stays authoritative.

use crate::error::{ServerError, ServerResult};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Bounded snapshot table; one entry per device.
pub const MAX_DEVICE_CONFIGS: usize = 64;

// ---------------------------------------------------------------------------
// Extracted sensor parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorSubType {
    Pressure,
    Ultrasonic,
}

/// Per-tank sensor parameters extracted from the snapshot JSON.
#[derive(Debug, Clone)]
pub struct TankSensorConfig {
    pub sub_type: SensorSubType,
    pub range_min: f64,
    pub range_max: f64,
    pub mount_height: f64,
    pub v_min: f64,
    pub v_max: f64,
}

#[derive(Debug, Deserialize)]
struct RawTankConfig {
    #[serde(alias = "k")]
    tank: u32,
    #[serde(default, alias = "subType")]
    sub_type: Option<String>,
    #[serde(default, alias = "rangeMin")]
    range_min: f64,
    #[serde(default, alias = "rangeMax")]
    range_max: f64,
    #[serde(default, alias = "mountHeight")]
    mount_height: f64,
    #[serde(default, alias = "vMin")]
    v_min: f64,
    #[serde(default, alias = "vMax")]
    v_max: f64,
}

#[derive(Debug, Deserialize)]
struct RawDeviceConfig {
    #[serde(default)]
    site: String,
    #[serde(default)]
    tanks: Vec<RawTankConfig>,
}

/// One cached snapshot: the opaque blob plus what we extract from it.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub device_uid: String,
    pub site: String,
    pub raw: Value,
    tanks: HashMap<u32, TankSensorConfig>,
}

impl DeviceConfig {
    pub fn tank_sensors(&self) -> impl Iterator<Item = (u32, &TankSensorConfig)> {
        self.tanks.iter().map(|(k, v)| (*k, v))
    }
}

fn extract(device_uid: &str, raw: &Value) -> DeviceConfig {
    let parsed: RawDeviceConfig =
        serde_json::from_value(raw.clone()).unwrap_or(RawDeviceConfig {
            site: String::new(),
            tanks: Vec::new(),
        });
    let mut tanks = HashMap::new();
    for t in parsed.tanks {
        let sub_type = match t.sub_type.as_deref() {
            Some("ultrasonic") => SensorSubType::Ultrasonic,
            // Pressure is the default loop sub-type in the field.
            _ => SensorSubType::Pressure,
        };
        tanks.insert(
            t.tank,
            TankSensorConfig {
                sub_type,
                range_min: t.range_min,
                range_max: t.range_max,
                mount_height: t.mount_height,
                v_min: t.v_min,
                v_max: t.v_max,
            },
        );
    }
    DeviceConfig {
        device_uid: device_uid.to_owned(),
        site: parsed.site,
        raw: raw.clone(),
        tanks,
    }
}

// ---------------------------------------------------------------------------
// DeviceConfigStore
// ---------------------------------------------------------------------------

pub struct DeviceConfigStore {
    configs: HashMap<String, DeviceConfig>,
    /// Insertion order for deterministic mirror rewrites.
    order: Vec<String>,
    path: PathBuf,
}

impl DeviceConfigStore {
    /// Load the mirror file, skipping damaged lines.
    pub fn load(path: &Path) -> Self {
        let mut store = DeviceConfigStore {
            configs: HashMap::new(),
            order: Vec::new(),
            path: path.to_owned(),
        };
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return store,
        };
        for (lineno, line) in content.lines().enumerate() {
            let Some((uid, json)) = line.split_once('\t') else {
                warn!(line = lineno + 1, "config cache: skipping truncated line");
                continue;
            };
            match serde_json::from_str::<Value>(json) {
                Ok(raw) => {
                    if store.configs.len() >= MAX_DEVICE_CONFIGS {
                        warn!(device = %uid, "config cache full, dropping entry on load");
                        continue;
                    }
                    store.order.push(uid.to_owned());
                    store.configs.insert(uid.to_owned(), extract(uid, &raw));
                }
                Err(e) => {
                    warn!(line = lineno + 1, error = %e, "config cache: skipping unparsable line");
                }
            }
        }
        store
    }

    /// Cache a snapshot and rewrite the disk mirror.
    pub fn insert(&mut self, device_uid: &str, raw: Value) -> ServerResult<()> {
        if !self.configs.contains_key(device_uid) {
            if self.configs.len() >= MAX_DEVICE_CONFIGS {
                return Err(ServerError::Capacity(format!(
                    "device config table full ({} entries)",
                    MAX_DEVICE_CONFIGS
                )));
            }
            self.order.push(device_uid.to_owned());
        }
        self.configs
            .insert(device_uid.to_owned(), extract(device_uid, &raw));
        self.save()
    }

    pub fn get(&self, device_uid: &str) -> Option<&DeviceConfig> {
        self.configs.get(device_uid)
    }

    pub fn tank_sensor(&self, device_uid: &str, tank: u32) -> Option<&TankSensorConfig> {
        self.configs.get(device_uid)?.tanks.get(&tank)
    }

    pub fn site(&self, device_uid: &str) -> Option<&str> {
        let site = self.configs.get(device_uid)?.site.as_str();
        if site.is_empty() {
            None
        } else {
            Some(site)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceConfig> {
        self.order.iter().filter_map(|uid| self.configs.get(uid))
    }

    /// Rewrite the mirror. On failure the partial file is removed and the
    /// in-memory cache remains authoritative.
    fn save(&self) -> ServerResult<()> {
        match self.write_mirror() {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = std::fs::remove_file(&self.path);
                warn!(path = %self.path.display(), error = %e, "config cache mirror write failed");
                Err(ServerError::Storage(e.to_string()))
            }
        }
    }

    fn write_mirror(&self) -> std::io::Result<()> {
        let mut f = std::fs::File::create(&self.path)?;
        for cfg in self.iter() {
            let json = serde_json::to_string(&cfg.raw)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            writeln!(f, "{}\t{}", cfg.device_uid, json)?;
        }
        f.sync_all()
    }
}
