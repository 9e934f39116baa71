//! The SSP wire protocol: framing, session encryption, command catalog and
//! poll-event parsing.

use std::fmt;
use std::time::Duration;

pub mod catalog;
pub mod channel;
pub mod crypto;
pub mod frame;
pub mod keys;
pub mod poll;

/// Protocol version negotiated with every device at startup.
pub const PROTOCOL_VERSION: u8 = 6;

/// The only currency the attached datasets carry.
pub const CURRENCY: &str = "EUR";

/// Vendor default preshared half of the AES session key.
pub const DEFAULT_FIXED_KEY: u64 = 0x0123_4567_0123_4567;

/// SSP command bytes.
pub mod cmd {
    pub const RESET: u8 = 0x01;
    pub const SET_CHANNEL_INHIBITS: u8 = 0x02;
    pub const SETUP_REQUEST: u8 = 0x05;
    pub const HOST_PROTOCOL_VERSION: u8 = 0x06;
    pub const POLL: u8 = 0x07;
    pub const DISABLE: u8 = 0x09;
    pub const ENABLE: u8 = 0x0A;
    pub const CHANNEL_SECURITY_DATA: u8 = 0x0F;
    pub const SYNC: u8 = 0x11;
    pub const LAST_REJECT_CODE: u8 = 0x17;
    pub const GET_FIRMWARE_VERSION: u8 = 0x20;
    pub const GET_DATASET_VERSION: u8 = 0x21;
    pub const GET_ALL_LEVELS: u8 = 0x22;
    pub const SET_REFILL_MODE: u8 = 0x30;
    pub const PAYOUT_AMOUNT: u8 = 0x33;
    pub const SET_DENOMINATION_LEVEL: u8 = 0x34;
    pub const HALT_PAYOUT: u8 = 0x38;
    pub const SET_DENOMINATION_ROUTE: u8 = 0x3B;
    pub const FLOAT_AMOUNT: u8 = 0x3D;
    pub const EMPTY_ALL: u8 = 0x3F;
    pub const SET_COIN_MECH_INHIBITS: u8 = 0x40;
    pub const RUN_CALIBRATION: u8 = 0x47;
    pub const SET_GENERATOR: u8 = 0x4A;
    pub const SET_MODULUS: u8 = 0x4B;
    pub const REQUEST_KEY_EXCHANGE: u8 = 0x4C;
    pub const SET_CASHBOX_PAYOUT_LIMIT: u8 = 0x4E;
    pub const SMART_EMPTY: u8 = 0x52;
    pub const CASHBOX_PAYOUT_OPERATION_DATA: u8 = 0x53;
    pub const CONFIGURE_BEZEL: u8 = 0x54;
    pub const ENABLE_PAYOUT_DEVICE: u8 = 0x5C;
}

/// Generic response status of an SSP exchange.
///
/// [Status::Timeout] is host-side only: it is reported when the retry
/// budget was exhausted without a decodable response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    UnknownCommand,
    IncorrectParameters,
    InvalidParameter,
    CommandNotProcessed,
    SoftwareError,
    ChecksumError,
    Failure,
    HeaderFailure,
    KeyNotSet,
    Timeout,
}

impl Status {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0xF0 => Status::Ok,
            0xF2 => Status::UnknownCommand,
            0xF3 => Status::IncorrectParameters,
            0xF4 => Status::InvalidParameter,
            0xF5 => Status::CommandNotProcessed,
            0xF6 => Status::SoftwareError,
            0xF7 => Status::ChecksumError,
            0xF9 => Status::HeaderFailure,
            0xFA => Status::KeyNotSet,
            _ => Status::Failure,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phrase = match self {
            Status::Ok => "ok",
            Status::UnknownCommand => "unknown command",
            Status::IncorrectParameters => "incorrect number of parameters",
            Status::InvalidParameter => "invalid parameter",
            Status::CommandNotProcessed => "command not processed",
            Status::SoftwareError => "software error",
            Status::ChecksumError => "checksum error",
            Status::Failure => "failure",
            Status::HeaderFailure => "header failure",
            Status::KeyNotSet => "key not set",
            Status::Timeout => "timeout",
        };
        f.write_str(phrase)
    }
}

/// One outbound command, before framing.
#[derive(Debug, Clone)]
pub struct Command {
    pub code: u8,
    pub payload: Vec<u8>,
    /// Attempts before a timeout or checksum failure is surfaced.
    pub retries: u8,
    /// Total per-attempt exchange deadline.
    pub timeout: Duration,
}

impl Command {
    pub const DEFAULT_RETRIES: u8 = 3;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1_000);

    pub fn new(code: u8, payload: Vec<u8>) -> Self {
        Self {
            code,
            payload,
            retries: Self::DEFAULT_RETRIES,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

/// The decoded reply to one [Command].
#[derive(Debug, Clone)]
pub struct Response {
    pub status: Status,
    pub data: Vec<u8>,
}

impl Response {
    pub fn timeout() -> Self {
        Self {
            status: Status::Timeout,
            data: Vec::new(),
        }
    }
}
