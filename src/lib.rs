// RoboClaw arm runtime
//
// Motor-command safety and telemetry for a two-channel RoboClaw controller:
// command watchdog, encoder telemetry, homing and controller diagnostics,
// exposed over zenoh.

pub mod catalog;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod homing;
pub mod messages;
pub mod motor;
pub mod runtime;
pub mod telemetry;
pub mod watchdog;

pub use error::{Error, Result};
