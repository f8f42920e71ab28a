//! Raw sensor reading → engineering-unit level.
//!
//! Pure functions only: the decoder reads the cached device config and the
//! learned calibration but never mutates state.
//!
//! Derivation order for loop sensors: learned calibration (when trained),
//! then the config mapping, then the documented fallback (4→0, 20→100).
//! Voltage sensors map through (vMin, vMax) or fall back to 0V→0, 10V→100.

use crate::calibration::TankCalibration;
use crate::device_config::{SensorSubType, TankSensorConfig};
use crate::fleet::SensorKind;

/// Canonical "sensor present" floor for loop current.
pub const SENSOR_PRESENT_MA: f64 = 4.0;
pub const SENSOR_MAX_MA: f64 = 20.0;

/// Raw carrier fields from a telemetry or alarm note.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawReading {
    pub ma: f64,
    pub volts: f64,
    pub digital: bool,
    pub pulse: f64,
}

/// Derive the level for a tank, preferring the learned calibration for
/// loop sensors, then the config mapping, then the fallback.
pub fn derive_level(
    learned: Option<&TankCalibration>,
    cfg: Option<&TankSensorConfig>,
    kind: SensorKind,
    raw: &RawReading,
) -> f64 {
    if kind == SensorKind::CurrentLoop {
        if !(SENSOR_PRESENT_MA..=SENSOR_MAX_MA).contains(&raw.ma) {
            return 0.0;
        }
        if let Some(cal) = learned.filter(|c| c.has_learned) {
            return cal.slope * raw.ma + cal.offset;
        }
    }
    decode(cfg, kind, raw)
}

/// Config-mapping decode with documented fallbacks. Does not consult the
/// learned calibration.
pub fn decode(cfg: Option<&TankSensorConfig>, kind: SensorKind, raw: &RawReading) -> f64 {
    match kind {
        SensorKind::CurrentLoop => decode_current_loop(cfg, raw.ma),
        SensorKind::Analog => decode_analog(cfg, raw.volts),
        SensorKind::Digital => {
            if raw.digital {
                1.0
            } else {
                0.0
            }
        }
        SensorKind::Pulse => raw.pulse,
    }
}

fn decode_current_loop(cfg: Option<&TankSensorConfig>, ma: f64) -> f64 {
    if !(SENSOR_PRESENT_MA..=SENSOR_MAX_MA).contains(&ma) {
        return 0.0;
    }
    let fraction = (ma - SENSOR_PRESENT_MA) / (SENSOR_MAX_MA - SENSOR_PRESENT_MA);
    match cfg {
        Some(c) => match c.sub_type {
            SensorSubType::Pressure => c.range_min + fraction * (c.range_max - c.range_min),
            SensorSubType::Ultrasonic => {
                let distance = c.range_min + fraction * (c.range_max - c.range_min);
                (c.mount_height - distance).max(0.0)
            }
        },
        None => fraction * 100.0,
    }
}

fn decode_analog(cfg: Option<&TankSensorConfig>, volts: f64) -> f64 {
    let v = volts.clamp(0.0, 12.0);
    match cfg {
        Some(c) if c.v_max > c.v_min => {
            let fraction = ((v - c.v_min) / (c.v_max - c.v_min)).clamp(0.0, 1.0);
            c.range_min + fraction * (c.range_max - c.range_min) + c.mount_height
        }
        _ => v / 10.0 * 100.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pressure_cfg(range_min: f64, range_max: f64, mount_height: f64) -> TankSensorConfig {
        TankSensorConfig {
            sub_type: SensorSubType::Pressure,
            range_min,
            range_max,
            mount_height,
            v_min: 0.0,
            v_max: 0.0,
        }
    }

    fn ultrasonic_cfg(range_min: f64, range_max: f64, mount_height: f64) -> TankSensorConfig {
        TankSensorConfig {
            sub_type: SensorSubType::Ultrasonic,
            range_min,
            range_max,
            mount_height,
            v_min: 0.0,
            v_max: 0.0,
        }
    }

    fn ma(ma: f64) -> RawReading {
        RawReading {
            ma,
            ..RawReading::default()
        }
    }

    #[test]
    fn pressure_midpoint_is_half_of_range() {
        let cfg = pressure_cfg(0.0, 5.0, 0.0);
        let level = decode(Some(&cfg), SensorKind::CurrentLoop, &ma(12.0));
        assert!((level - 2.5).abs() < 1e-9);
    }

    #[test]
    fn pressure_ignores_mount_height() {
        // Mount height is a separate offset; the pure range path must not add it.
        let with_mount = pressure_cfg(0.0, 5.0, 7.5);
        let level = decode(Some(&with_mount), SensorKind::CurrentLoop, &ma(12.0));
        assert!((level - 2.5).abs() < 1e-9);
    }

    #[test]
    fn ultrasonic_subtracts_distance_from_mount_height() {
        let cfg = ultrasonic_cfg(0.0, 4.0, 5.0);
        // 8 mA → 25% of 0..4 = 1.0 distance → level 4.0
        let level = decode(Some(&cfg), SensorKind::CurrentLoop, &ma(8.0));
        assert!((level - 4.0).abs() < 1e-9);
        // Distance beyond mount height clamps at zero.
        let dry = ultrasonic_cfg(0.0, 10.0, 2.0);
        assert_eq!(decode(Some(&dry), SensorKind::CurrentLoop, &ma(20.0)), 0.0);
    }

    #[test]
    fn loop_out_of_range_reads_zero() {
        let cfg = pressure_cfg(0.0, 5.0, 0.0);
        assert_eq!(decode(Some(&cfg), SensorKind::CurrentLoop, &ma(3.2)), 0.0);
        assert_eq!(decode(Some(&cfg), SensorKind::CurrentLoop, &ma(21.0)), 0.0);
        assert_eq!(decode(None, SensorKind::CurrentLoop, &ma(0.0)), 0.0);
    }

    #[test]
    fn loop_without_config_maps_to_percent() {
        assert!((decode(None, SensorKind::CurrentLoop, &ma(12.0)) - 50.0).abs() < 1e-9);
        assert!((decode(None, SensorKind::CurrentLoop, &ma(20.0)) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn analog_maps_through_voltage_window() {
        let cfg = TankSensorConfig {
            sub_type: SensorSubType::Pressure,
            range_min: 0.0,
            range_max: 60.0,
            mount_height: 2.0,
            v_min: 1.0,
            v_max: 5.0,
        };
        // 3V is halfway through 1..5 → 30 + mount 2
        let level = decode(Some(&cfg), SensorKind::Analog, &RawReading {
            volts: 3.0,
            ..RawReading::default()
        });
        assert!((level - 32.0).abs() < 1e-9);
        // Voltage below vMin clamps to range_min + mount.
        let low = decode(Some(&cfg), SensorKind::Analog, &RawReading {
            volts: 0.2,
            ..RawReading::default()
        });
        assert!((low - 2.0).abs() < 1e-9);
    }

    #[test]
    fn analog_without_config_is_percent_of_ten_volts() {
        let level = decode(None, SensorKind::Analog, &RawReading {
            volts: 2.5,
            ..RawReading::default()
        });
        assert!((level - 25.0).abs() < 1e-9);
        // Clamp above 12V.
        let clamped = decode(None, SensorKind::Analog, &RawReading {
            volts: 40.0,
            ..RawReading::default()
        });
        assert!((clamped - 120.0).abs() < 1e-9);
    }

    #[test]
    fn digital_and_pulse_pass_through() {
        let on = RawReading {
            digital: true,
            ..RawReading::default()
        };
        assert_eq!(decode(None, SensorKind::Digital, &on), 1.0);
        let rpm = RawReading {
            pulse: 1780.0,
            ..RawReading::default()
        };
        assert_eq!(decode(None, SensorKind::Pulse, &rpm), 1780.0);
    }

    #[test]
    fn learned_calibration_overrides_config_mapping() {
        let cal = TankCalibration {
            device_uid: "dev:A".to_owned(),
            tank: 1,
            slope: 6.25,
            offset: -25.0,
            r_squared: 1.0,
            sample_count: 2,
            last_calibration_epoch: 0.0,
            config_max_value: 5.0,
            has_learned: true,
        };
        let cfg = pressure_cfg(0.0, 5.0, 0.0);
        let level = derive_level(Some(&cal), Some(&cfg), SensorKind::CurrentLoop, &ma(12.0));
        assert!((level - 50.0).abs() < 1e-9);
        // Out-of-range loop current still reads zero even when trained.
        assert_eq!(
            derive_level(Some(&cal), Some(&cfg), SensorKind::CurrentLoop, &ma(2.0)),
            0.0
        );
    }

    #[test]
    fn untrained_calibration_falls_back_to_config() {
        let cal = TankCalibration {
            device_uid: "dev:A".to_owned(),
            tank: 1,
            slope: 0.0,
            offset: 0.0,
            r_squared: 0.0,
            sample_count: 1,
            last_calibration_epoch: 0.0,
            config_max_value: 5.0,
            has_learned: false,
        };
        let cfg = pressure_cfg(0.0, 5.0, 0.0);
        let level = derive_level(Some(&cal), Some(&cfg), SensorKind::CurrentLoop, &ma(12.0));
        assert!((level - 2.5).abs() < 1e-9);
    }
}
