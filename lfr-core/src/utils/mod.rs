//! Utility re-exports for the line-follower robot.
//!
//! - `serial`: clock and byte-stream seams plus the timeout poller
//! - `protocol`: the board's opcode codec and the request/reply client
//! - `controllers`: calibration policy, motor ramp and the drive loop
//! - `config`: serde-backed tunables with the board's default constants

pub mod config;
pub mod controllers;
pub mod protocol;
pub mod serial;

pub use config::RobotConfig;
pub use controllers::DriveController;
pub use protocol::client::ProtocolClient;
pub use embassy_time::{Delay, Duration, Instant};
