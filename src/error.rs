use thiserror::Error;

use crate::protocol::Status;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between the message bus and the serial line.
#[derive(Debug, Error)]
pub enum Error {
    #[error("serial device not found: {0}")]
    DeviceNotFound(String),

    #[error("{0} is not a character device")]
    NotACharacterDevice(String),

    #[error("failed to open {path}: {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: serialport::Error,
    },

    #[error("serial read timed out")]
    ReadTimeout,

    #[error("serial line error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Frame(&'static str),

    #[error("serial line lock timed out")]
    LineBusy,

    #[error("message bus: {0}")]
    Bus(#[from] redis::RedisError),

    /// Device answered with a non-OK generic status.
    #[error("device replied {0}")]
    Device(Status),

    /// COMMAND_NOT_PROCESSED with its command-dependent sub-error byte.
    #[error("command not processed, sub-error {0:#04x}")]
    NotProcessed(u8),

    #[error("key negotiation rejected: {0}")]
    KeyExchange(Status),

    #[error("short or malformed response: {0}")]
    Decode(&'static str),
}

impl Error {
    /// Errors that mean the daemon cannot keep running: the serial device
    /// vanished or the bus connection died. The supervisor restarts us.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Bus(_))
    }
}
