// Hardware seam between the control loop and a two-channel motor controller
//
// Everything above this trait (watchdog, telemetry, homing, diagnostics) only
// talks to a `MotorLink`, so the same code drives the real RoboClaw or the
// simulated controller.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::catalog::{HOME_M1, HOME_M2};
use crate::error::Result;

/// One of the two motor outputs of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    M1,
    M2,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::M1, Channel::M2];

    pub fn index(self) -> usize {
        match self {
            Channel::M1 => 0,
            Channel::M2 => 1,
        }
    }

    /// Error-register value reported once this channel sits on its home switch
    pub fn home_code(self) -> u16 {
        match self {
            Channel::M1 => HOME_M1,
            Channel::M2 => HOME_M2,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::M1 => write!(f, "M1"),
            Channel::M2 => write!(f, "M2"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TempSensor {
    Temp1,
    Temp2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// Last transaction failed at the transport level
    Faulted,
}

/// Encoder count plus the controller's encoder status byte (underflow/overflow/direction)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderReading {
    pub ticks: i32,
    pub status: u8,
}

/// Trapezoidal move to an absolute encoder position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionCommand {
    pub accel: u32,
    pub speed: u32,
    pub decel: u32,
    pub target: i32,
    /// 0 = queue behind the running command, 1 = execute immediately
    pub buffer: u8,
}

pub trait MotorLink: Send {
    /// Closed-loop velocity command in encoder ticks per second
    fn send_speed(&mut self, channel: Channel, ticks_per_sec: i32) -> Result<()>;

    /// Open-loop drive, -127 (full backward) ..= 127 (full forward)
    fn send_duty(&mut self, channel: Channel, duty: i8) -> Result<()>;

    fn send_position(&mut self, channel: Channel, command: PositionCommand) -> Result<()>;

    fn read_encoder(&mut self, channel: Channel) -> Result<EncoderReading>;

    fn set_encoder(&mut self, channel: Channel, ticks: i32) -> Result<()>;

    /// Raw 16-bit error/status register
    fn read_error(&mut self) -> Result<u16>;

    /// Main battery voltage in volts
    fn read_main_battery(&mut self) -> Result<f32>;

    /// Logic battery voltage in volts
    fn read_logic_battery(&mut self) -> Result<f32>;

    /// Board temperature in degrees Celsius
    fn read_temperature(&mut self, sensor: TempSensor) -> Result<f32>;

    fn stop(&mut self, channel: Channel) -> Result<()> {
        self.send_speed(channel, 0)
    }
}

/// One link per controller, shared between the control loop and homing tasks
pub type SharedLink<L> = Arc<Mutex<L>>;

pub fn shared<L: MotorLink>(link: L) -> SharedLink<L> {
    Arc::new(Mutex::new(link))
}

/// Lock the link, recovering it if a previous holder panicked mid-transaction.
/// A panicking holder cannot leave the serial framing half-written because
/// every transaction is written and read within a single call.
pub fn lock<L>(link: &SharedLink<L>) -> MutexGuard<'_, L> {
    link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Send zero speed to every channel, retrying a failed channel exactly once.
///
/// Returns the channels that could not be stopped.
pub fn stop_channels<L: MotorLink + ?Sized>(link: &mut L, channels: &[Channel]) -> Vec<Channel> {
    let mut failed = Vec::new();
    for &channel in channels {
        if let Err(first) = link.stop(channel) {
            warn!("Stop on {} failed ({}), trying again", channel, first);
            if let Err(second) = link.stop(channel) {
                error!("Could not stop {}: {}", channel, second);
                failed.push(channel);
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::sim::{SimOp, SimulatedLink};

    #[test]
    fn home_codes_are_single_bits() {
        assert_eq!(Channel::M1.home_code(), 0x4000);
        assert_eq!(Channel::M2.home_code(), 0x8000);
        for channel in Channel::ALL {
            assert_eq!(channel.home_code().count_ones(), 1);
        }
    }

    #[test]
    fn stop_retries_once_then_gives_up() {
        let mut sim = SimulatedLink::new();
        sim.fail_times(SimOp::Speed(Channel::M1), 1);
        sim.fail_times(SimOp::Speed(Channel::M2), 2);

        let failed = stop_channels(&mut sim, &Channel::ALL);

        assert_eq!(failed, vec![Channel::M2]);
        // M1 succeeded on its retry
        assert!(sim.sent().iter().any(|c| c.is_stop(Channel::M1)));
        assert!(!sim.sent().iter().any(|c| c.is_stop(Channel::M2)));
    }
}
