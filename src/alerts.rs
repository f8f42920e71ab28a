//! Alert engine: SMS gating, the daily email schedule, and the periodic
//! viewer summary.
//!
//! The per-tank SMS gate enforces two independent limits: a 300-second
//! minimum spacing between accepted sends and at most two sends in any
//! rolling hour. `last_sms_epoch` advances only on accepted sends, so a
//! burst of rejected attempts cannot starve the next legitimate alert.
//!
//! The email dispatch is server-wide: one scheduled send per day with a
//! one-hour cooldown guarding against schedule edits double-firing.

use crate::fleet::{FleetState, TankRecord, SMS_RING_CAP};
use crate::settings::ServerSettings;
use serde_json::{json, Value};

pub const MIN_SMS_INTERVAL_SECS: f64 = 300.0;
pub const MAX_SMS_PER_HOUR: usize = 2;
pub const EMAIL_COOLDOWN_SECS: f64 = 3600.0;

// ---------------------------------------------------------------------------
// Per-tank SMS gate
// ---------------------------------------------------------------------------

/// Run the rate-limit check for one tank; commits the bookkeeping and
/// returns true when the SMS may be enqueued.
///
/// Check order is load-bearing: a cold clock always allows (alarms beat
/// rate limiting when time is unknown), the interval check runs against the
/// last *accepted* send, then the hourly ring is compacted and counted.
pub fn sms_gate(rec: &mut TankRecord, now: f64) -> bool {
    if now <= 0.0 {
        return true;
    }
    if rec.last_sms_epoch > 0.0 && now - rec.last_sms_epoch < MIN_SMS_INTERVAL_SECS {
        return false;
    }
    rec.sms_epochs.retain(|&e| e > now - 3600.0);
    if rec.sms_epochs.len() >= MAX_SMS_PER_HOUR {
        return false;
    }
    rec.last_sms_epoch = now;
    rec.sms_epochs.push(now);
    if rec.sms_epochs.len() > SMS_RING_CAP {
        rec.sms_epochs.remove(0);
    }
    true
}

/// Wire body for `sms.qo`.
pub fn sms_body(message: &str, settings: &ServerSettings) -> Value {
    json!({
        "message": message,
        "numbers": settings.sms_numbers(),
    })
}

/// Alarm SMS text. Digital alarms read as float-switch transitions; level
/// alarms carry the derived reading.
pub fn alarm_sms_text(site: &str, tank: u32, alarm_type: &str, level: f64, digital: bool) -> String {
    if digital {
        let state = if alarm_type == "triggered" {
            "ACTIVATED"
        } else {
            "NOT ACTIVATED"
        };
        format!("{} #{} Float Switch {}", site, tank, state)
    } else {
        format!("{} #{} {} alarm {:.1} in", site, tank, alarm_type, level)
    }
}

/// Unload SMS text: delivered volume with peak/empty context.
pub fn unload_sms_text(site: &str, tank: u32, peak: f64, empty: f64) -> String {
    format!(
        "{} #{} unloaded: {:.1} in delivered (peak {:.1}, now {:.1})",
        site,
        tank,
        peak - empty,
        peak,
        empty
    )
}

// ---------------------------------------------------------------------------
// Daily email schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct EmailSchedule {
    next_epoch: f64,
    last_dispatch_epoch: f64,
    armed_hour: u32,
    armed_minute: u32,
}

impl EmailSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next dispatch epoch: today at (hour, minute) UTC, or tomorrow if
    /// that is already past.
    pub fn next_after(now: f64, hour: u32, minute: u32) -> f64 {
        let day_start = (now / 86_400.0).floor() * 86_400.0;
        let today = day_start + f64::from(hour) * 3600.0 + f64::from(minute) * 60.0;
        if today > now {
            today
        } else {
            today + 86_400.0
        }
    }

    /// True exactly once per scheduled slot; commits the dispatch time and
    /// schedules the next. A changed (hour, minute) re-arms the schedule;
    /// the server-wide cooldown then refuses a dispatch within an hour of
    /// the previous one, so moving the slot cannot double-fire.
    pub fn due(&mut self, now: f64, hour: u32, minute: u32) -> bool {
        if now <= 0.0 {
            return false;
        }
        if self.next_epoch == 0.0 || hour != self.armed_hour || minute != self.armed_minute {
            self.armed_hour = hour;
            self.armed_minute = minute;
            self.next_epoch = Self::next_after(now, hour, minute);
            return false;
        }
        if now < self.next_epoch {
            return false;
        }
        self.next_epoch = Self::next_after(now, hour, minute);
        if self.last_dispatch_epoch > 0.0 && now - self.last_dispatch_epoch < EMAIL_COOLDOWN_SECS {
            return false;
        }
        self.last_dispatch_epoch = now;
        true
    }

    pub fn last_dispatch_epoch(&self) -> f64 {
        self.last_dispatch_epoch
    }
}

/// Wire body for `email.qo`: the full-fleet digest.
pub fn email_digest(fleet: &FleetState, settings: &ServerSettings) -> Value {
    let tanks: Vec<Value> = fleet
        .iter()
        .map(|r| {
            json!({
                "device": r.device_uid,
                "site": r.site,
                "label": r.label,
                "tank": r.tank,
                "levelInches": r.level,
                "sensorMa": r.sensor_ma,
                "alarm": r.alarm_active,
                "alarmType": r.alarm_type,
            })
        })
        .collect();
    json!({
        "to": settings.email_to,
        "subject": settings.email_subject,
        "tanks": tanks,
    })
}

// ---------------------------------------------------------------------------
// Viewer summary schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ViewerSchedule {
    next_epoch: f64,
}

impl ViewerSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires every `every_hours`, aligned to `base_hour` UTC.
    pub fn due(&mut self, now: f64, every_hours: u32, base_hour: u32) -> bool {
        if now <= 0.0 || every_hours == 0 {
            return false;
        }
        if self.next_epoch == 0.0 {
            self.next_epoch = Self::next_after(now, every_hours, base_hour);
            return false;
        }
        if now < self.next_epoch {
            return false;
        }
        self.next_epoch = Self::next_after(now, every_hours, base_hour);
        true
    }

    fn next_after(now: f64, every_hours: u32, base_hour: u32) -> f64 {
        let period = f64::from(every_hours) * 3600.0;
        let day_start = (now / 86_400.0).floor() * 86_400.0;
        let mut next = day_start + f64::from(base_hour) * 3600.0;
        while next <= now {
            next += period;
        }
        next
    }
}

/// Compact tank-table snapshot for `viewer_summary.qo`.
pub fn viewer_summary(fleet: &FleetState) -> Value {
    let tanks: Vec<Value> = fleet
        .iter()
        .map(|r| {
            json!({
                "c": r.device_uid,
                "k": r.tank,
                "s": r.site,
                "n": r.label,
                "l": r.level,
                "a": r.alarm_active,
                "t": r.last_update_epoch,
            })
        })
        .collect();
    json!({ "tanks": tanks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::FleetState;

    fn record() -> TankRecord {
        let mut fleet = FleetState::new();
        fleet.upsert("dev:A", 1).unwrap().clone()
    }

    #[test]
    fn gate_allows_when_clock_is_cold() {
        let mut rec = record();
        assert!(sms_gate(&mut rec, 0.0));
        // A cold-clock allow records nothing.
        assert!(rec.sms_epochs.is_empty());
    }

    #[test]
    fn gate_follows_the_burst_scenario() {
        // Three alarms at t, t+200, t+400 produce exactly two sends; a
        // fourth at t+700 hits the hourly cap.
        let mut rec = record();
        let t = 1_700_000_000.0;
        assert!(sms_gate(&mut rec, t), "first send accepted");
        assert!(!sms_gate(&mut rec, t + 200.0), "interval rejects");
        assert!(sms_gate(&mut rec, t + 400.0), "300s past last accepted");
        assert!(!sms_gate(&mut rec, t + 700.0), "hourly cap rejects");
        assert_eq!(rec.sms_epochs, vec![t, t + 400.0]);
    }

    #[test]
    fn rejected_attempts_do_not_reset_the_interval() {
        let mut rec = record();
        let t = 1_700_000_000.0;
        assert!(sms_gate(&mut rec, t));
        for i in 1..5 {
            assert!(!sms_gate(&mut rec, t + f64::from(i) * 60.0));
        }
        // 300s after the accepted send, not after the last attempt.
        assert!(sms_gate(&mut rec, t + 300.0));
    }

    #[test]
    fn hourly_window_rolls_forward() {
        let mut rec = record();
        let t = 1_700_000_000.0;
        assert!(sms_gate(&mut rec, t));
        assert!(sms_gate(&mut rec, t + 400.0));
        assert!(!sms_gate(&mut rec, t + 800.0), "two in the hour");
        // Past the hour from the first send, one slot frees up.
        assert!(sms_gate(&mut rec, t + 3601.0));
    }

    #[test]
    fn sms_ring_is_capped() {
        let mut rec = record();
        let mut t = 1_700_000_000.0;
        // Spread sends out so neither limit rejects; the ring must not grow
        // past its cap.
        for _ in 0..(SMS_RING_CAP + 4) {
            assert!(sms_gate(&mut rec, t));
            t += 3700.0;
        }
        assert!(rec.sms_epochs.len() <= SMS_RING_CAP);
    }

    #[test]
    fn alarm_texts_render_both_shapes() {
        assert_eq!(
            alarm_sms_text("North", 2, "high", 43.25, false),
            "North #2 high alarm 43.2 in"
        );
        assert_eq!(
            alarm_sms_text("North", 2, "triggered", 1.0, true),
            "North #2 Float Switch ACTIVATED"
        );
        assert_eq!(
            alarm_sms_text("North", 2, "not_triggered", 0.0, true),
            "North #2 Float Switch NOT ACTIVATED"
        );
    }

    #[test]
    fn unload_text_reports_delta() {
        assert_eq!(
            unload_sms_text("North", 1, 48.0, 6.5),
            "North #1 unloaded: 41.5 in delivered (peak 48.0, now 6.5)"
        );
    }

    #[test]
    fn email_fires_once_per_slot_and_honors_cooldown() {
        let mut sched = EmailSchedule::new();
        // Day boundary + 7:00.
        let day = 1_700_006_400.0 - (1_700_006_400.0 % 86_400.0);
        let now = day + 6.0 * 3600.0;

        // First call arms the schedule.
        assert!(!sched.due(now, 7, 0));
        // Before the slot: not due.
        assert!(!sched.due(now + 1800.0, 7, 0));
        // At the slot: fires once.
        assert!(sched.due(day + 7.0 * 3600.0 + 5.0, 7, 0));
        assert!(!sched.due(day + 7.0 * 3600.0 + 10.0, 7, 0));
        // Next day: fires again.
        assert!(sched.due(day + 86_400.0 + 7.0 * 3600.0 + 5.0, 7, 0));
    }

    #[test]
    fn schedule_edit_cannot_double_fire_within_the_cooldown() {
        let mut sched = EmailSchedule::new();
        let day = 1_700_006_400.0 - (1_700_006_400.0 % 86_400.0);
        assert!(!sched.due(day + 6.0 * 3600.0, 7, 0), "arm");
        assert!(sched.due(day + 7.0 * 3600.0, 7, 0), "scheduled fire");

        // Operator moves the slot to 07:30 the same day.
        assert!(!sched.due(day + 7.0 * 3600.0 + 60.0, 7, 30), "re-arm");
        // The new slot arrives inside the cooldown: refused.
        assert!(!sched.due(day + 7.5 * 3600.0 + 5.0, 7, 30));
        // Tomorrow's slot fires normally.
        assert!(sched.due(day + 86_400.0 + 7.5 * 3600.0 + 5.0, 7, 30));
    }

    #[test]
    fn email_never_fires_on_a_cold_clock() {
        let mut sched = EmailSchedule::new();
        assert!(!sched.due(0.0, 7, 0));
        assert!(!sched.due(0.0, 7, 0));
    }

    #[test]
    fn digest_includes_every_tank_in_order() {
        let mut fleet = FleetState::new();
        fleet.upsert("dev:A", 1).unwrap().level = 10.0;
        fleet.upsert("dev:B", 2).unwrap().level = 20.0;
        let settings = ServerSettings {
            email_to: "ops@example.com".to_owned(),
            ..ServerSettings::default()
        };
        let digest = email_digest(&fleet, &settings);
        assert_eq!(digest["to"], "ops@example.com");
        let tanks = digest["tanks"].as_array().unwrap();
        assert_eq!(tanks.len(), 2);
        assert_eq!(tanks[0]["device"], "dev:A");
        assert_eq!(tanks[1]["levelInches"], 20.0);
    }

    #[test]
    fn viewer_schedule_fires_on_period() {
        let mut sched = ViewerSchedule::new();
        let day = 1_700_006_400.0 - (1_700_006_400.0 % 86_400.0);
        let now = day + 100.0;
        assert!(!sched.due(now, 6, 0), "first call arms");
        assert!(!sched.due(now + 3600.0, 6, 0));
        assert!(sched.due(day + 6.0 * 3600.0 + 1.0, 6, 0));
        assert!(!sched.due(day + 6.0 * 3600.0 + 2.0, 6, 0));
        assert!(sched.due(day + 12.0 * 3600.0 + 1.0, 6, 0));
    }
}
