//! Serial protocol driver, calibration policy and drive control for a
//! line-following robot on no-std embedded platforms.
//!
//! For a host run against the simulated board, see `lfr-app/mock-mcu`.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod utils;
