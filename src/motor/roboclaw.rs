// RoboClaw packet serial protocol implementation
//
// Write: [address, command, params..., crc_hi, crc_lo] -> controller answers 0xFF
// Read:  [address, command] -> controller answers [data..., crc_hi, crc_lo]
//
// The CRC is CRC16-CCITT (poly 0x1021, init 0) over every byte of the
// exchange: the address/command sent plus the data received.

use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, info};

use super::link::{
    Channel, ConnectionState, EncoderReading, MotorLink, PositionCommand, TempSensor,
};
use crate::error::{Error, Result};

/// Default serial configuration for RoboClaw controllers
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Valid packet serial addresses
pub const MIN_ADDRESS: u8 = 0x80;
pub const MAX_ADDRESS: u8 = 0x87;

const ACK: u8 = 0xFF;
const MAX_VERSION_LEN: usize = 48;
const MAX_DUTY: i16 = 127;

/// Command set (subset used by the runtime)
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Command {
    ForwardM1 = 0,
    BackwardM1 = 1,
    ForwardM2 = 4,
    BackwardM2 = 5,
    ReadEncoderM1 = 16,
    ReadEncoderM2 = 17,
    ResetEncoders = 20,
    ReadVersion = 21,
    SetEncoderM1 = 22,
    SetEncoderM2 = 23,
    ReadMainBattery = 24,
    ReadLogicBattery = 25,
    SpeedM1 = 35,
    SpeedM2 = 36,
    SpeedAccelDecelPositionM1 = 65,
    SpeedAccelDecelPositionM2 = 66,
    ReadTemp = 82,
    ReadTemp2 = 83,
    ReadError = 90,
}

/// A packet serial address, checked once when the configuration is loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address(u8);

impl Address {
    pub fn new(raw: u8) -> Result<Self> {
        if (MIN_ADDRESS..=MAX_ADDRESS).contains(&raw) {
            Ok(Self(raw))
        } else {
            Err(Error::Configuration(format!(
                "controller address 0x{:02X} out of range 0x{:02X}..=0x{:02X}",
                raw, MIN_ADDRESS, MAX_ADDRESS
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

/// Byte transport under the protocol: a serial port in production,
/// an in-memory script in tests
pub trait Port: Read + Write + Send {
    /// Drop any stale bytes left from a previous, interrupted exchange
    fn discard_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// RoboClaw controller on a serial line
pub struct Roboclaw {
    device: String,
    baudrate: u32,
    address: Address,
    port: Option<Box<dyn Port>>,
    state: ConnectionState,
}

impl Roboclaw {
    pub fn new(device: impl Into<String>, baudrate: u32, address: Address) -> Self {
        Self {
            device: device.into(),
            baudrate,
            address,
            port: None,
            state: ConnectionState::Disconnected,
        }
    }

    /// Wrap an already open transport
    pub fn with_port(address: Address, port: Box<dyn Port>) -> Self {
        Self {
            device: String::from("<attached>"),
            baudrate: DEFAULT_BAUDRATE,
            address,
            port: Some(port),
            state: ConnectionState::Connected,
        }
    }

    /// Open the serial device
    pub fn connect(&mut self) -> Result<()> {
        info!(
            "Opening RoboClaw 0x{:02X} on {} at {} baud",
            self.address.get(),
            self.device,
            self.baudrate
        );
        let port = serialport::new(self.device.as_str(), self.baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()
            .map_err(|source| Error::Connection {
                device: self.device.clone(),
                source,
            })?;

        self.port = Some(Box::new(port));
        self.state = ConnectionState::Connected;
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// CRC16-CCITT as used by the controller
    fn crc(data: &[u8]) -> u16 {
        crc16::State::<crc16::XMODEM>::calculate(data)
    }

    /// Build a write packet with trailing CRC
    fn build_packet(address: u8, command: Command, params: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(4 + params.len());
        packet.push(address);
        packet.push(command as u8);
        packet.extend_from_slice(params);

        let crc = Self::crc(&packet);
        packet.extend_from_slice(&crc.to_be_bytes());
        packet
    }

    fn open_port(&mut self, channel: Option<Channel>) -> Result<&mut Box<dyn Port>> {
        self.port.as_mut().ok_or_else(|| {
            Error::transient(
                channel,
                io::Error::new(io::ErrorKind::NotConnected, "serial port not open"),
            )
        })
    }

    /// Record the outcome of a transaction in the connection state
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => {
                if self.state == ConnectionState::Faulted {
                    info!("RoboClaw link recovered");
                }
                self.state = ConnectionState::Connected;
            }
            Err(Error::TransientIo { .. }) => self.state = ConnectionState::Faulted,
            Err(_) => {}
        }
        result
    }

    /// Send a command and wait for the one-byte acknowledgement
    fn write_command(
        &mut self,
        channel: Option<Channel>,
        command: Command,
        params: &[u8],
    ) -> Result<()> {
        let result = self.exchange_write(channel, command, params);
        self.track(result)
    }

    fn exchange_write(
        &mut self,
        channel: Option<Channel>,
        command: Command,
        params: &[u8],
    ) -> Result<()> {
        let packet = Self::build_packet(self.address.get(), command, params);
        debug!("Write {:?}: {:02X?}", command, packet);

        let port = self.open_port(channel)?;
        send(port.as_mut(), channel, &packet)?;

        let mut ack = [0u8; 1];
        read_response(port.as_mut(), channel, &mut ack)?;
        if ack[0] != ACK {
            return Err(Error::protocol(
                channel,
                format!("{:?}: expected ack 0xFF, got 0x{:02X}", command, ack[0]),
            ));
        }
        Ok(())
    }

    /// Send a read request and return `len` CRC-checked data bytes
    fn read_command(
        &mut self,
        channel: Option<Channel>,
        command: Command,
        len: usize,
    ) -> Result<Vec<u8>> {
        let result = self.exchange_read(channel, command, len);
        self.track(result)
    }

    fn exchange_read(
        &mut self,
        channel: Option<Channel>,
        command: Command,
        len: usize,
    ) -> Result<Vec<u8>> {
        let request = [self.address.get(), command as u8];
        let port = self.open_port(channel)?;
        send(port.as_mut(), channel, &request)?;

        let mut response = vec![0u8; len + 2];
        read_response(port.as_mut(), channel, &mut response)?;

        let (data, crc) = response.split_at(len);
        let mut covered = request.to_vec();
        covered.extend_from_slice(data);
        let expected = Self::crc(&covered);
        let received = u16::from_be_bytes([crc[0], crc[1]]);
        if expected != received {
            return Err(Error::protocol(
                channel,
                format!(
                    "{:?}: crc mismatch (expected 0x{:04X}, got 0x{:04X})",
                    command, expected, received
                ),
            ));
        }

        response.truncate(len);
        Ok(response)
    }

    fn read_u16(&mut self, channel: Option<Channel>, command: Command) -> Result<u16> {
        let data = self.read_command(channel, command, 2)?;
        Ok(u16::from_be_bytes([data[0], data[1]]))
    }

    /// Read the NUL-terminated firmware banner
    pub fn read_version(&mut self) -> Result<String> {
        let result = self.exchange_version();
        self.track(result)
    }

    fn exchange_version(&mut self) -> Result<String> {
        let request = [self.address.get(), Command::ReadVersion as u8];
        let port = self.open_port(None)?;
        send(port.as_mut(), None, &request)?;

        let mut covered = request.to_vec();
        let mut banner = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            read_response(port.as_mut(), None, &mut byte)?;
            covered.push(byte[0]);
            if byte[0] == 0 {
                break;
            }
            banner.push(byte[0]);
            if banner.len() > MAX_VERSION_LEN {
                return Err(Error::protocol(None, "version banner not terminated"));
            }
        }

        let mut crc = [0u8; 2];
        read_response(port.as_mut(), None, &mut crc)?;
        if Self::crc(&covered) != u16::from_be_bytes(crc) {
            return Err(Error::protocol(None, "ReadVersion: crc mismatch"));
        }

        Ok(String::from_utf8_lossy(&banner).trim_end().to_string())
    }

    /// Zero both quadrature encoder counters
    pub fn reset_encoders(&mut self) -> Result<()> {
        self.write_command(None, Command::ResetEncoders, &[])
    }
}

impl MotorLink for Roboclaw {
    fn send_speed(&mut self, channel: Channel, ticks_per_sec: i32) -> Result<()> {
        let command = match channel {
            Channel::M1 => Command::SpeedM1,
            Channel::M2 => Command::SpeedM2,
        };
        self.write_command(Some(channel), command, &ticks_per_sec.to_be_bytes())
    }

    fn send_duty(&mut self, channel: Channel, duty: i8) -> Result<()> {
        let duty = (duty as i16).clamp(-MAX_DUTY, MAX_DUTY);
        let command = match (channel, duty < 0) {
            (Channel::M1, false) => Command::ForwardM1,
            (Channel::M1, true) => Command::BackwardM1,
            (Channel::M2, false) => Command::ForwardM2,
            (Channel::M2, true) => Command::BackwardM2,
        };
        self.write_command(Some(channel), command, &[duty.unsigned_abs() as u8])
    }

    fn send_position(&mut self, channel: Channel, position: PositionCommand) -> Result<()> {
        let command = match channel {
            Channel::M1 => Command::SpeedAccelDecelPositionM1,
            Channel::M2 => Command::SpeedAccelDecelPositionM2,
        };
        let mut params = Vec::with_capacity(17);
        params.extend_from_slice(&position.accel.to_be_bytes());
        params.extend_from_slice(&position.speed.to_be_bytes());
        params.extend_from_slice(&position.decel.to_be_bytes());
        params.extend_from_slice(&position.target.to_be_bytes());
        params.push(position.buffer);
        self.write_command(Some(channel), command, &params)
    }

    fn read_encoder(&mut self, channel: Channel) -> Result<EncoderReading> {
        let command = match channel {
            Channel::M1 => Command::ReadEncoderM1,
            Channel::M2 => Command::ReadEncoderM2,
        };
        let data = self.read_command(Some(channel), command, 5)?;
        Ok(EncoderReading {
            ticks: i32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            status: data[4],
        })
    }

    fn set_encoder(&mut self, channel: Channel, ticks: i32) -> Result<()> {
        let command = match channel {
            Channel::M1 => Command::SetEncoderM1,
            Channel::M2 => Command::SetEncoderM2,
        };
        self.write_command(Some(channel), command, &ticks.to_be_bytes())
    }

    fn read_error(&mut self) -> Result<u16> {
        self.read_u16(None, Command::ReadError)
    }

    fn read_main_battery(&mut self) -> Result<f32> {
        Ok(self.read_u16(None, Command::ReadMainBattery)? as f32 / 10.0)
    }

    fn read_logic_battery(&mut self) -> Result<f32> {
        Ok(self.read_u16(None, Command::ReadLogicBattery)? as f32 / 10.0)
    }

    fn read_temperature(&mut self, sensor: TempSensor) -> Result<f32> {
        let command = match sensor {
            TempSensor::Temp1 => Command::ReadTemp,
            TempSensor::Temp2 => Command::ReadTemp2,
        };
        Ok(self.read_u16(None, command)? as f32 / 10.0)
    }
}

fn send(port: &mut dyn Port, channel: Option<Channel>, bytes: &[u8]) -> Result<()> {
    port.discard_input()
        .and_then(|_| port.write_all(bytes))
        .and_then(|_| port.flush())
        .map_err(|e| Error::transient(channel, e))
}

/// Fill `buf` from the port. Silence before the first byte is a transport
/// failure; a response that stops partway is a malformed frame.
fn read_response(port: &mut dyn Port, channel: Option<Channel>, buf: &mut [u8]) -> Result<()> {
    let expected = buf.len();
    let (first, rest) = buf.split_at_mut(1);
    port.read_exact(first)
        .map_err(|e| Error::transient(channel, e))?;

    port.read_exact(rest).map_err(|e| match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::UnexpectedEof => Error::protocol(
            channel,
            format!("short response, expected {} bytes", expected),
        ),
        _ => Error::transient(channel, e),
    })
}
