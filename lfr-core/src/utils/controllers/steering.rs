//! Threshold steering over the two edge sensors, plus the headlight and
//! obstacle decisions of the drive loop.

use crate::utils::{config::DriveConfig, protocol::SensorFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveAction {
    Forward,
    /// Line under the left edge sensor only.
    TurnLeft,
    /// Line under the right edge sensor only.
    TurnRight,
    /// Line under both edge sensors: end of the course.
    Junction,
}

impl DriveAction {
    /// `(left, right)` wheel speeds for this action.
    pub fn speeds(
        self,
        config: &DriveConfig,
    ) -> (f32, f32) {
        match self {
            DriveAction::Forward => (config.cruise_speed, config.cruise_speed),
            DriveAction::TurnLeft => (0.0, config.turn_speed),
            DriveAction::TurnRight => (config.turn_speed, 0.0),
            DriveAction::Junction => (0.0, 0.0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Steering {
    config: DriveConfig,
}

impl Steering {
    pub fn new(config: DriveConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DriveConfig {
        &self.config
    }

    pub fn decide(
        &self,
        frame: &SensorFrame,
    ) -> DriveAction {
        let (left, right) = (frame.leftmost(), frame.rightmost());
        let line = self.config.line_threshold;
        let junction = self.config.junction_threshold;

        if left > line && right < line {
            DriveAction::TurnLeft
        } else if right > line && left < line {
            DriveAction::TurnRight
        } else if left > junction && right > junction {
            DriveAction::Junction
        } else {
            DriveAction::Forward
        }
    }

    pub fn headlights(
        &self,
        light: u16,
    ) -> bool {
        light > self.config.light_threshold
    }

    /// A zero distance means no echo came back, not contact.
    pub fn obstacle(
        &self,
        distance_cm: Option<u32>,
    ) -> bool {
        matches!(distance_cm, Some(d) if d > 0 && d <= self.config.stop_distance_cm)
    }
}
