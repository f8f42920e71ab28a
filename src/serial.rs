//! Serial diagnostic log rings.
//!
//! One bounded ring per device plus one server-wide ring. Operator-facing
//! only; nothing downstream consumes these. Per-device ack state tracks the
//! send-logs request/acknowledge handshake.

use serde::Serialize;
use std::collections::HashMap;
use std::collections::VecDeque;

pub const DEVICE_RING_CAP: usize = 200;
pub const SERVER_RING_CAP: usize = 500;
/// Bounded count of per-device rings.
pub const MAX_DEVICE_RINGS: usize = 64;
/// Minimum spacing between send-logs requests to one device.
pub const REQUEST_INTERVAL_SECS: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Self {
        match s {
            "warn" | "warning" => LogLevel::Warn,
            "error" | "err" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SerialEntry {
    pub epoch: f64,
    pub message: String,
    pub level: LogLevel,
    pub source: String,
}

/// Ack handshake state for one device.
#[derive(Debug, Default)]
pub struct DeviceSerialState {
    ring: VecDeque<SerialEntry>,
    pub awaiting_logs: bool,
    pub last_request_epoch: f64,
    pub last_ack_epoch: f64,
    pub last_ack_status: String,
    pub last_log_epoch: f64,
}

// ---------------------------------------------------------------------------
// SerialStore
// ---------------------------------------------------------------------------

pub struct SerialStore {
    devices: HashMap<String, DeviceSerialState>,
    server: VecDeque<SerialEntry>,
}

impl SerialStore {
    pub fn new() -> Self {
        SerialStore {
            devices: HashMap::new(),
            server: VecDeque::new(),
        }
    }

    /// Append to a device ring. Returns false when the bounded device table
    /// refused a new ring; the entry is dropped.
    pub fn push_device(&mut self, device_uid: &str, entry: SerialEntry) -> bool {
        if !self.devices.contains_key(device_uid) && self.devices.len() >= MAX_DEVICE_RINGS {
            return false;
        }
        let state = self.devices.entry(device_uid.to_owned()).or_default();
        if state.ring.len() >= DEVICE_RING_CAP {
            state.ring.pop_front();
        }
        state.last_log_epoch = state.last_log_epoch.max(entry.epoch);
        state.ring.push_back(entry);
        true
    }

    pub fn push_server(&mut self, entry: SerialEntry) {
        if self.server.len() >= SERVER_RING_CAP {
            self.server.pop_front();
        }
        self.server.push_back(entry);
    }

    /// Convenience: a server-ring warning entry.
    pub fn server_warn(&mut self, now: f64, message: impl Into<String>) {
        self.push_server(SerialEntry {
            epoch: now,
            message: message.into(),
            level: LogLevel::Warn,
            source: "server".to_owned(),
        });
    }

    pub fn device_state(&self, device_uid: &str) -> Option<&DeviceSerialState> {
        self.devices.get(device_uid)
    }

    /// Entries for the operator view: newest last, filtered by minimum epoch,
    /// capped at `max` (most recent kept).
    pub fn device_entries(&self, device_uid: &str, max: usize, since: f64) -> Vec<&SerialEntry> {
        match self.devices.get(device_uid) {
            Some(state) => tail(state.ring.iter().filter(|e| e.epoch >= since), max),
            None => Vec::new(),
        }
    }

    pub fn server_entries(&self, max: usize, since: f64) -> Vec<&SerialEntry> {
        tail(self.server.iter().filter(|e| e.epoch >= since), max)
    }

    // -----------------------------------------------------------------------
    // Send-logs handshake
    // -----------------------------------------------------------------------

    /// Check the per-device request throttle; on pass, record the request.
    pub fn try_begin_request(&mut self, device_uid: &str, now: f64) -> bool {
        if !self.devices.contains_key(device_uid) && self.devices.len() >= MAX_DEVICE_RINGS {
            return false;
        }
        let state = self.devices.entry(device_uid.to_owned()).or_default();
        if state.last_request_epoch > 0.0 && now - state.last_request_epoch < REQUEST_INTERVAL_SECS
        {
            return false;
        }
        state.last_request_epoch = now;
        state.awaiting_logs = true;
        true
    }

    /// Apply a serial acknowledgement. The awaiting flag survives only a
    /// "processing" status (device still flushing its buffer).
    pub fn ack(&mut self, device_uid: &str, status: &str, now: f64) {
        let state = self.devices.entry(device_uid.to_owned()).or_default();
        state.last_ack_epoch = now;
        state.last_ack_status = status.to_owned();
        if status != "processing" {
            state.awaiting_logs = false;
        }
    }
}

impl Default for SerialStore {
    fn default() -> Self {
        Self::new()
    }
}

fn tail<'a>(iter: impl Iterator<Item = &'a SerialEntry>, max: usize) -> Vec<&'a SerialEntry> {
    let all: Vec<&SerialEntry> = iter.collect();
    let start = all.len().saturating_sub(max);
    all[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(epoch: f64, msg: &str) -> SerialEntry {
        SerialEntry {
            epoch,
            message: msg.to_owned(),
            level: LogLevel::Info,
            source: "client".to_owned(),
        }
    }

    #[test]
    fn device_ring_drops_oldest_on_overflow() {
        let mut store = SerialStore::new();
        for i in 0..(DEVICE_RING_CAP + 5) {
            store.push_device("dev:A", entry(i as f64, "m"));
        }
        let entries = store.device_entries("dev:A", DEVICE_RING_CAP + 10, 0.0);
        assert_eq!(entries.len(), DEVICE_RING_CAP);
        assert_eq!(entries[0].epoch, 5.0);
    }

    #[test]
    fn device_table_is_bounded() {
        let mut store = SerialStore::new();
        for i in 0..MAX_DEVICE_RINGS {
            assert!(store.push_device(&format!("dev:{}", i), entry(1.0, "m")));
        }
        assert!(!store.push_device("dev:overflow", entry(1.0, "m")));
        // Existing rings still accept entries.
        assert!(store.push_device("dev:0", entry(2.0, "m")));
    }

    #[test]
    fn entries_filter_by_since_and_cap_to_most_recent() {
        let mut store = SerialStore::new();
        for i in 0..10 {
            store.push_server(entry(f64::from(i), "m"));
        }
        let since = store.server_entries(100, 7.0);
        assert_eq!(since.len(), 3);
        let capped = store.server_entries(2, 0.0);
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].epoch, 8.0);
    }

    #[test]
    fn request_throttle_enforces_interval() {
        let mut store = SerialStore::new();
        let t = 1_700_000_000.0;
        assert!(store.try_begin_request("dev:A", t));
        assert!(!store.try_begin_request("dev:A", t + 30.0));
        assert!(store.try_begin_request("dev:A", t + 61.0));
    }

    #[test]
    fn ack_clears_awaiting_unless_processing() {
        let mut store = SerialStore::new();
        let t = 1_700_000_000.0;
        store.try_begin_request("dev:A", t);
        assert!(store.device_state("dev:A").unwrap().awaiting_logs);

        store.ack("dev:A", "processing", t + 5.0);
        assert!(store.device_state("dev:A").unwrap().awaiting_logs);

        store.ack("dev:A", "complete", t + 10.0);
        let state = store.device_state("dev:A").unwrap();
        assert!(!state.awaiting_logs);
        assert_eq!(state.last_ack_status, "complete");
        assert_eq!(state.last_ack_epoch, t + 10.0);
    }
}
