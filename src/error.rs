// Error taxonomy for the runtime
//
// Configuration and Connection are fatal and only happen at startup.
// TransientIo and Protocol are recoverable: the affected read/write is
// skipped for this cycle and the next tick tries again.
// Busy is returned synchronously to whoever asked for a conflicting action.

use crate::motor::Channel;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Could not open {device}: {source}")]
    Connection {
        device: String,
        #[source]
        source: serialport::Error,
    },

    #[error("I/O error on {} (code {}): {source}", fmt_channel(.channel), fmt_code(.code))]
    TransientIo {
        channel: Option<Channel>,
        code: Option<i32>,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed response on {}: {reason}", fmt_channel(.channel))]
    Protocol {
        channel: Option<Channel>,
        reason: String,
    },

    #[error("Joints {joints:?} are busy homing")]
    Busy { joints: Vec<u8> },

    #[error("Rejected command: {0}")]
    InvalidCommand(String),
}

impl Error {
    pub(crate) fn transient(channel: Option<Channel>, source: std::io::Error) -> Self {
        Error::TransientIo {
            channel,
            code: source.raw_os_error(),
            source,
        }
    }

    pub(crate) fn protocol(channel: Option<Channel>, reason: impl Into<String>) -> Self {
        Error::Protocol {
            channel,
            reason: reason.into(),
        }
    }

    /// True for errors the tick loop skips over and retries next cycle
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::TransientIo { .. } | Error::Protocol { .. })
    }
}

fn fmt_channel(channel: &Option<Channel>) -> String {
    match channel {
        Some(channel) => channel.to_string(),
        None => "controller".to_string(),
    }
}

fn fmt_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "n/a".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
