//! `payoutd` bridges a Redis PUB/SUB JSON API to a pair of SSP
//! cash-handling peripherals (coin hopper and banknote validator/payout)
//! on one serial line.
//!
//! Requests arrive on `hopper-request` / `validator-request`, responses go
//! out on the matching response topics, and device-originated poll events
//! are published on `hopper-event` / `validator-event`. All hardware
//! access is serialized through a single cooperative loop in [daemon].

pub mod bus;
pub mod daemon;
pub mod device;
pub mod error;
pub mod events;
pub mod handler;
pub mod protocol;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};
