//! Tunables for the serial link, calibration policy, stop ramp and drive loop.
//!
//! Defaults are the values the robot was tuned with. A JSON document may
//! override any subset of them; missing fields keep their default.

use serde::{Deserialize, Serialize};

/// Link settings and per-operation reply budgets, all in milliseconds.
///
/// Measured board response times: signature ~0.6 ms, battery ~1.3 ms, sensor
/// read ~2.4 ms, auto-calibration ~1000 ms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub poll_interval_ms: u32,
    pub signature_timeout_ms: u32,
    pub battery_timeout_ms: u32,
    pub sensors_timeout_ms: u32,
    pub calibration_timeout_ms: u32,
    /// Reset line held low for this long.
    pub reset_hold_ms: u32,
    /// Time the board needs after reset before it answers.
    pub reset_settle_ms: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            poll_interval_ms: 1,
            signature_timeout_ms: 2,
            battery_timeout_ms: 3,
            sensors_timeout_ms: 4,
            calibration_timeout_ms: 1_100,
            reset_hold_ms: 10,
            reset_settle_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Lowest calibrated sensor value.
    pub min_value: u16,
    /// Highest calibrated sensor value.
    pub max_value: u16,
    /// Faulty frames tolerated before a re-calibration is forced.
    pub error_threshold: u32,
    /// Pause before auto-calibration starts spinning the robot.
    pub settle_ms: u32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_value: 0,
            max_value: 1_000,
            error_threshold: 5,
            settle_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RampConfig {
    /// Speed removed from each side per step.
    pub step: f32,
    pub interval_ms: u32,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            step: 0.05,
            interval_ms: 35,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// An edge sensor above this sees the line.
    pub line_threshold: u16,
    /// Both edge sensors above this mark a junction.
    pub junction_threshold: u16,
    pub turn_speed: f32,
    pub cruise_speed: f32,
    /// Light level above which the headlights are switched on.
    pub light_threshold: u16,
    /// Obstacles closer than this (cm) stop the robot.
    pub stop_distance_cm: u32,
    /// Pause between signature attempts while the board is unreachable.
    pub connect_retry_ms: u32,
    /// Sensor reads before the initial calibration.
    pub priming_reads: u32,
    /// Pause at the end of each drive step.
    pub step_interval_ms: u32,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            line_threshold: 500,
            junction_threshold: 700,
            turn_speed: 0.45,
            cruise_speed: 0.15,
            light_threshold: 500,
            stop_distance_cm: 5,
            connect_retry_ms: 2_000,
            priming_reads: 10,
            step_interval_ms: 50,
        }
    }
}

/// Every tunable of the robot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub serial: SerialConfig,
    pub calibration: CalibrationConfig,
    pub ramp: RampConfig,
    pub drive: DriveConfig,
}

impl RobotConfig {
    /// Parse a JSON document; absent fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
