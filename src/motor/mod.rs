// Motor control module for the two-channel RoboClaw arm controller
//
// Provides:
// - The `MotorLink` trait every control component talks to
// - RoboClaw packet serial protocol implementation
// - A simulated controller for dry runs and tests

pub mod link;
pub mod roboclaw;
pub mod sim;

pub use link::{
    Channel, ConnectionState, EncoderReading, MotorLink, PositionCommand, SharedLink, TempSensor,
};
pub use roboclaw::{Address, Roboclaw};
pub use sim::SimulatedLink;
