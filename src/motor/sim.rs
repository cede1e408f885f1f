// Simulated two-channel controller
//
// Used for dry runs without hardware (`--simulate`) and as the test double for
// every component above the link. Failures can be injected per operation and
// the error register can be scripted value by value.

use std::collections::{HashMap, VecDeque};
use std::io;

use tracing::debug;

use super::link::{Channel, EncoderReading, MotorLink, PositionCommand, TempSensor};
use crate::error::{Error, Result};

/// Number of error-register polls a backward drive takes to reach the home switch
pub const DEFAULT_POLLS_TO_HOME: u32 = 5;

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Speed(Channel),
    Duty(Channel),
    Position(Channel),
    Encoder(Channel),
    SetEncoder(Channel),
    Error,
    MainBattery,
    LogicBattery,
    Temperature(TempSensor),
}

impl SimOp {
    fn channel(self) -> Option<Channel> {
        match self {
            SimOp::Speed(c)
            | SimOp::Duty(c)
            | SimOp::Position(c)
            | SimOp::Encoder(c)
            | SimOp::SetEncoder(c) => Some(c),
            _ => None,
        }
    }
}

/// What the runtime wrote to the simulated controller
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SentCommand {
    Speed(Channel, i32),
    Duty(Channel, i8),
    Position(Channel, PositionCommand),
    SetEncoder(Channel, i32),
}

impl SentCommand {
    pub fn channel(&self) -> Channel {
        match *self {
            SentCommand::Speed(c, _)
            | SentCommand::Duty(c, _)
            | SentCommand::Position(c, _)
            | SentCommand::SetEncoder(c, _) => c,
        }
    }

    pub fn is_stop(&self, channel: Channel) -> bool {
        *self == SentCommand::Speed(channel, 0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SimChannel {
    ticks: i32,
    /// Polls left before a backward drive hits the home switch
    home_countdown: Option<u32>,
    at_home: bool,
}

#[derive(Debug)]
pub struct SimulatedLink {
    channels: [SimChannel; 2],
    polls_to_home: u32,
    error_script: VecDeque<u16>,
    base_error: u16,
    failures: HashMap<SimOp, Option<usize>>,
    sent: Vec<SentCommand>,
    main_battery: f32,
    logic_battery: f32,
    temps: [f32; 2],
}

impl Default for SimulatedLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedLink {
    pub fn new() -> Self {
        Self {
            channels: [SimChannel::default(); 2],
            polls_to_home: DEFAULT_POLLS_TO_HOME,
            error_script: VecDeque::new(),
            base_error: 0,
            failures: HashMap::new(),
            sent: Vec::new(),
            main_battery: 12.0,
            logic_battery: 5.0,
            temps: [25.0, 25.0],
        }
    }

    pub fn with_polls_to_home(mut self, polls: u32) -> Self {
        self.polls_to_home = polls;
        self
    }

    /// Fail `op` on every call until cleared
    pub fn fail(&mut self, op: SimOp) {
        self.failures.insert(op, None);
    }

    /// Fail `op` on its next `times` calls
    pub fn fail_times(&mut self, op: SimOp, times: usize) {
        self.failures.insert(op, Some(times));
    }

    pub fn clear_failures(&mut self) {
        self.failures.clear();
    }

    /// Queue raw error-register values returned by the next `read_error` calls
    pub fn script_errors(&mut self, values: impl IntoIterator<Item = u16>) {
        self.error_script.extend(values);
    }

    /// Error bits present on every read (after the script runs out)
    pub fn set_base_error(&mut self, bits: u16) {
        self.base_error = bits;
    }

    pub fn set_ticks(&mut self, channel: Channel, ticks: i32) {
        self.channels[channel.index()].ticks = ticks;
    }

    pub fn ticks(&self, channel: Channel) -> i32 {
        self.channels[channel.index()].ticks
    }

    pub fn sent(&self) -> &[SentCommand] {
        &self.sent
    }

    pub fn take_sent(&mut self) -> Vec<SentCommand> {
        std::mem::take(&mut self.sent)
    }

    fn check(&mut self, op: SimOp) -> Result<()> {
        let fail = match self.failures.get_mut(&op) {
            None => false,
            Some(None) => true,
            Some(Some(0)) => false,
            Some(Some(left)) => {
                *left -= 1;
                true
            }
        };
        if fail {
            debug!("Simulated failure on {:?}", op);
            return Err(Error::transient(
                op.channel(),
                io::Error::new(io::ErrorKind::TimedOut, "simulated timeout"),
            ));
        }
        Ok(())
    }

    fn drive(&mut self, channel: Channel, duty: i8) {
        let polls = self.polls_to_home;
        let state = &mut self.channels[channel.index()];
        if duty < 0 {
            if !state.at_home && state.home_countdown.is_none() {
                state.home_countdown = Some(polls);
            }
        } else {
            // the home bit is only latched while pushing against the switch
            state.home_countdown = None;
            state.at_home = false;
        }
    }

    /// Advance backward drives by one poll and return the home bits
    fn poll_home_switches(&mut self) -> u16 {
        let mut bits = 0;
        for channel in Channel::ALL {
            let state = &mut self.channels[channel.index()];
            if let Some(left) = state.home_countdown {
                if left == 0 {
                    state.home_countdown = None;
                    state.at_home = true;
                } else {
                    state.home_countdown = Some(left - 1);
                }
            }
            if state.at_home {
                bits |= channel.home_code();
            }
        }
        bits
    }
}

impl MotorLink for SimulatedLink {
    fn send_speed(&mut self, channel: Channel, ticks_per_sec: i32) -> Result<()> {
        self.check(SimOp::Speed(channel))?;
        self.sent.push(SentCommand::Speed(channel, ticks_per_sec));
        self.drive(channel, ticks_per_sec.signum() as i8);
        Ok(())
    }

    fn send_duty(&mut self, channel: Channel, duty: i8) -> Result<()> {
        self.check(SimOp::Duty(channel))?;
        self.sent.push(SentCommand::Duty(channel, duty));
        self.drive(channel, duty);
        Ok(())
    }

    fn send_position(&mut self, channel: Channel, command: PositionCommand) -> Result<()> {
        self.check(SimOp::Position(channel))?;
        self.sent.push(SentCommand::Position(channel, command));
        // moves are instantaneous in simulation
        self.channels[channel.index()].ticks = command.target;
        Ok(())
    }

    fn read_encoder(&mut self, channel: Channel) -> Result<EncoderReading> {
        self.check(SimOp::Encoder(channel))?;
        Ok(EncoderReading {
            ticks: self.channels[channel.index()].ticks,
            status: 0,
        })
    }

    fn set_encoder(&mut self, channel: Channel, ticks: i32) -> Result<()> {
        self.check(SimOp::SetEncoder(channel))?;
        self.sent.push(SentCommand::SetEncoder(channel, ticks));
        self.channels[channel.index()].ticks = ticks;
        Ok(())
    }

    fn read_error(&mut self) -> Result<u16> {
        self.check(SimOp::Error)?;
        let home = self.poll_home_switches();
        Ok(match self.error_script.pop_front() {
            Some(scripted) => scripted,
            None => self.base_error | home,
        })
    }

    fn read_main_battery(&mut self) -> Result<f32> {
        self.check(SimOp::MainBattery)?;
        Ok(self.main_battery)
    }

    fn read_logic_battery(&mut self) -> Result<f32> {
        self.check(SimOp::LogicBattery)?;
        Ok(self.logic_battery)
    }

    fn read_temperature(&mut self, sensor: TempSensor) -> Result<f32> {
        self.check(SimOp::Temperature(sensor))?;
        Ok(match sensor {
            TempSensor::Temp1 => self.temps[0],
            TempSensor::Temp2 => self.temps[1],
        })
    }
}
