//! The SSP session layer: one `exchange` per command with sequence-bit
//! bookkeeping, retry, and the encryption envelope, plus the per-device
//! session state machine and key negotiation.

use std::time::Instant;

use super::frame::{self, STEX};
use super::keys::KeyExchange;
use super::{cmd, crypto, Command, Response, Status};
use crate::error::{Error, Result};
use crate::transport::SerialLink;

/// Link-layer lifecycle of one device.
///
/// `Fresh → Synced → Protocol6 → SetupKnown → Enabled`; any observed unit
/// reset or KEY_NOT_SET response drops the session back to `Fresh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Fresh,
    Synced,
    Protocol6,
    SetupKnown,
    Enabled,
}

/// Per-device session state: address, sequence bit, encryption key and
/// envelope counter.
#[derive(Debug)]
pub struct Session {
    addr: u8,
    fixed_key: u64,
    pub state: SessionState,
    seq: bool,
    key: Option<[u8; 16]>,
    counter: u32,
}

impl Session {
    pub fn new(addr: u8, fixed_key: u64) -> Self {
        Self {
            addr,
            fixed_key,
            state: SessionState::Fresh,
            seq: false,
            key: None,
            counter: 0,
        }
    }

    pub fn addr(&self) -> u8 {
        self.addr
    }

    pub fn encrypted(&self) -> bool {
        self.key.is_some()
    }

    /// Drops all negotiated state; the device must be re-synced and
    /// re-keyed before it serves commands again.
    pub fn reset(&mut self) {
        self.state = SessionState::Fresh;
        self.seq = false;
        self.key = None;
        self.counter = 0;
    }

    pub fn clear_key(&mut self) {
        self.key = None;
    }

    /// Installs the negotiated variable key next to the preshared half and
    /// restarts the envelope counter.
    pub fn install_key(&mut self, variable: u64) {
        self.key = Some(crypto::session_key(self.fixed_key, variable));
        self.counter = 0;
    }

    /// SYNC landed: the device expects the next frame with sequence bit 0.
    pub fn mark_synced(&mut self) {
        self.state = SessionState::Synced;
        self.seq = false;
    }
}

/// The shared serial line, spoken SSP.
///
/// Both device sessions multiplex over one `SspChannel`; the dispatcher
/// serializes access so a single mutable borrow at a time is enough.
pub struct SspChannel<L> {
    link: L,
}

impl<L: SerialLink> SspChannel<L> {
    pub fn new(link: L) -> Self {
        Self { link }
    }

    #[cfg(test)]
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Sends one command and returns the device's reply.
    ///
    /// Checksum failures (ours or the device's) and read timeouts are
    /// retried up to the command's budget with the SAME sequence bit, so
    /// the device can idempotently re-send its last response. The bit
    /// advances only once a decodable, non-checksum reply arrives; budget
    /// exhaustion surfaces as [Status::Timeout] or
    /// [Status::ChecksumError] without advancing it.
    pub fn exchange(&mut self, session: &mut Session, command: &Command) -> Result<Response> {
        let mut data = Vec::with_capacity(1 + command.payload.len());
        data.push(command.code);
        data.extend_from_slice(&command.payload);

        let wire_data = match session.key {
            Some(key) => {
                let mut enveloped = Vec::with_capacity(data.len() + 24);
                enveloped.push(STEX);
                enveloped.extend(crypto::encrypt(&key, session.counter, &data));
                enveloped
            }
            None => data,
        };

        let wire = frame::build(session.addr, session.seq, &wire_data);
        log::trace!(
            "tx addr {:#04x} cmd {:#04x} seq {}: {:02x?}",
            session.addr,
            command.code,
            session.seq as u8,
            wire
        );

        let attempts = command.retries.max(1);
        let mut timed_out = false;

        for attempt in 1..=attempts {
            self.link.send(&wire)?;

            let deadline = Instant::now() + command.timeout;
            match self.read_response(session, deadline) {
                Ok(response) if response.status == Status::ChecksumError => {
                    log::debug!(
                        "device reported checksum error, attempt {attempt}/{attempts}"
                    );
                    timed_out = false;
                    if attempt == attempts {
                        return Ok(response);
                    }
                }
                Ok(response) => {
                    session.seq = !session.seq;
                    if session.key.is_some() {
                        session.counter = session.counter.wrapping_add(1);
                    }
                    return Ok(response);
                }
                Err(Error::ReadTimeout) => {
                    log::debug!("response timeout, attempt {attempt}/{attempts}");
                    timed_out = true;
                }
                Err(Error::Frame(reason)) => {
                    log::debug!("bad response frame ({reason}), attempt {attempt}/{attempts}");
                    timed_out = false;
                }
                Err(err) => return Err(err),
            }
        }

        if timed_out {
            Ok(Response::timeout())
        } else {
            Ok(Response {
                status: Status::ChecksumError,
                data: Vec::new(),
            })
        }
    }

    fn read_response(&mut self, session: &Session, deadline: Instant) -> Result<Response> {
        let raw = frame::read(&mut self.link, deadline)?;

        if raw.addr() != session.addr {
            return Err(Error::Frame("response address mismatch"));
        }
        if raw.data.is_empty() {
            return Err(Error::Frame("empty response"));
        }

        log::trace!("rx addr {:#04x}: {:02x?}", raw.addr(), raw.data);

        let plain = match session.key {
            Some(key) if raw.data[0] == STEX => {
                let (count, plain) = crypto::decrypt(&key, &raw.data[1..])?;
                if count != session.counter {
                    return Err(Error::Frame("encrypted envelope count mismatch"));
                }
                plain
            }
            _ => raw.data,
        };

        if plain.is_empty() {
            return Err(Error::Frame("empty response payload"));
        }

        Ok(Response {
            status: Status::from_byte(plain[0]),
            data: plain[1..].to_vec(),
        })
    }

    /// Runs the vendor key exchange for `session` and installs the result.
    ///
    /// Called right after SYNC during startup and again whenever a command
    /// comes back KEY_NOT_SET (the device forgot its key, typically after
    /// a power dip).
    pub fn negotiate_keys(&mut self, session: &mut Session) -> Result<()> {
        session.clear_key();

        let exchange = KeyExchange::generate(&mut rand::thread_rng());

        self.key_step(session, cmd::SET_GENERATOR, exchange.generator())?;
        self.key_step(session, cmd::SET_MODULUS, exchange.modulus())?;

        let command = Command::new(
            cmd::REQUEST_KEY_EXCHANGE,
            exchange.host_inter_key().to_le_bytes().to_vec(),
        );
        let response = self.exchange(session, &command)?;
        if !response.status.is_ok() {
            return Err(Error::KeyExchange(response.status));
        }
        if response.data.len() < 8 {
            return Err(Error::Decode("device inter-key too short"));
        }

        let device_inter = response.data[..8]
            .try_into()
            .map(u64::from_le_bytes)
            .map_err(|_| Error::Decode("device inter-key too short"))?;
        session.install_key(exchange.session_key(device_inter));

        log::debug!("session key negotiated for addr {:#04x}", session.addr);
        Ok(())
    }

    fn key_step(&mut self, session: &mut Session, code: u8, value: u64) -> Result<()> {
        let command = Command::new(code, value.to_le_bytes().to_vec());
        let response = self.exchange(session, &command)?;
        if !response.status.is_ok() {
            return Err(Error::KeyExchange(response.status));
        }
        Ok(())
    }
}
