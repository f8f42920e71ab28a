//! Runtime-mutable server settings.
//!
//! Alert policy, notification targets, the daily email schedule, history
//! knobs, and the admin PIN. Persisted as one JSON document under the data
//! directory and edited through the HTTP API; a missing or corrupt file
//! falls back to defaults with a warning (the server must always boot).

use crate::error::{ServerError, ServerResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
    /// Site names this contact is scoped to; empty = all sites.
    #[serde(default)]
    pub sites: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub sms_on_high: bool,
    pub sms_on_low: bool,
    pub sms_on_clear: bool,
    pub sms_primary: String,
    pub sms_secondary: String,
    pub email_to: String,
    pub email_subject: String,
    pub daily_email_hour: u32,
    pub daily_email_minute: u32,
    /// Viewer summary cadence and alignment hour.
    pub viewer_summary_hours: u32,
    pub viewer_base_hour: u32,
    /// Empty string = no PIN configured; every mutating endpoint refuses.
    pub admin_pin: String,
    pub hot_retention_days: u32,
    pub archive_enabled: bool,
    pub archive_root: String,
    pub contacts: Vec<Contact>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            sms_on_high: true,
            sms_on_low: true,
            sms_on_clear: false,
            sms_primary: String::new(),
            sms_secondary: String::new(),
            email_to: String::new(),
            email_subject: "Daily tank report".to_owned(),
            daily_email_hour: 7,
            daily_email_minute: 0,
            viewer_summary_hours: 6,
            viewer_base_hour: 0,
            admin_pin: String::new(),
            hot_retention_days: 7,
            archive_enabled: false,
            archive_root: String::new(),
            contacts: Vec::new(),
        }
    }
}

impl ServerSettings {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "settings unparsable, using defaults");
                    ServerSettings::default()
                }
            },
            Err(_) => ServerSettings::default(),
        }
    }

    pub fn save(&self, path: &Path) -> ServerResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ServerError::Storage(format!("encode settings: {}", e)))?;
        std::fs::write(path, json)
            .map_err(|e| ServerError::Storage(format!("write settings: {}", e)))?;
        Ok(())
    }

    /// True when `pin` matches a configured admin PIN. An unset PIN matches
    /// nothing.
    pub fn pin_matches(&self, pin: &str) -> bool {
        !self.admin_pin.is_empty() && self.admin_pin == pin
    }

    /// Validate and install a new PIN.
    pub fn set_pin(&mut self, pin: &str) -> ServerResult<()> {
        if pin.len() != 4 || !pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ServerError::Validation(
                "PIN must be exactly 4 digits".to_owned(),
            ));
        }
        self.admin_pin = pin.to_owned();
        Ok(())
    }

    /// SMS destinations in priority order, skipping unset slots.
    pub fn sms_numbers(&self) -> Vec<String> {
        [&self.sms_primary, &self.sms_secondary]
            .into_iter()
            .filter(|n| !n.is_empty())
            .cloned()
            .collect()
    }

    /// Apply a partial update from an API body. Unknown keys are ignored;
    /// numeric fields are clamped to sane ranges.
    pub fn apply_patch(&mut self, patch: &serde_json::Value) -> ServerResult<()> {
        let obj = patch
            .as_object()
            .ok_or_else(|| ServerError::Validation("settings patch must be an object".to_owned()))?;

        macro_rules! patch_bool {
            ($key:literal, $field:ident) => {
                if let Some(v) = obj.get($key).and_then(|v| v.as_bool()) {
                    self.$field = v;
                }
            };
        }
        macro_rules! patch_str {
            ($key:literal, $field:ident) => {
                if let Some(v) = obj.get($key).and_then(|v| v.as_str()) {
                    self.$field = v.to_owned();
                }
            };
        }

        patch_bool!("smsOnHigh", sms_on_high);
        patch_bool!("smsOnLow", sms_on_low);
        patch_bool!("smsOnClear", sms_on_clear);
        patch_bool!("archiveEnabled", archive_enabled);
        patch_str!("smsPrimary", sms_primary);
        patch_str!("smsSecondary", sms_secondary);
        patch_str!("emailTo", email_to);
        patch_str!("emailSubject", email_subject);
        patch_str!("archiveRoot", archive_root);

        if let Some(v) = obj.get("dailyEmailHour").and_then(|v| v.as_u64()) {
            self.daily_email_hour = (v as u32).min(23);
        }
        if let Some(v) = obj.get("dailyEmailMinute").and_then(|v| v.as_u64()) {
            self.daily_email_minute = (v as u32).min(59);
        }
        if let Some(v) = obj.get("viewerSummaryHours").and_then(|v| v.as_u64()) {
            self.viewer_summary_hours = (v as u32).clamp(1, 24);
        }
        if let Some(v) = obj.get("viewerBaseHour").and_then(|v| v.as_u64()) {
            self.viewer_base_hour = (v as u32).min(23);
        }
        if let Some(v) = obj.get("hotRetentionDays").and_then(|v| v.as_u64()) {
            self.hot_retention_days = (v as u32).clamp(1, 7);
        }
        if let Some(v) = obj.get("contacts").and_then(|v| v.as_array()) {
            let parsed: Result<Vec<Contact>, _> = v
                .iter()
                .map(|c| serde_json::from_value(c.clone()))
                .collect();
            self.contacts = parsed
                .map_err(|e| ServerError::Validation(format!("bad contact: {}", e)))?;
        }
        Ok(())
    }
}
