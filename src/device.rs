//! Per-device session: typed commands over the shared SSP line plus the
//! runtime state the daemon tracks for each peripheral.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::bus;
use crate::error::{Error, Result};
use crate::protocol::catalog::{
    self, CashboxOperationData, LevelCounter, PayoutOption, Route, SetupData,
};
use crate::protocol::channel::{Session, SessionState, SspChannel};
use crate::protocol::poll::{self, PollEvent};
use crate::protocol::{cmd, Command, Response, Status, DEFAULT_FIXED_KEY, PROTOCOL_VERSION};
use crate::transport::SerialLink;

/// Budget for grabbing the serial-line mutex.
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Both peripherals hang off one multi-drop serial line.
pub type SharedChannel<L> = Arc<Mutex<SspChannel<L>>>;

/// Which of the two peripherals a session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Hopper,
    Validator,
}

impl DeviceKind {
    pub fn addr(self) -> u8 {
        match self {
            DeviceKind::Hopper => 0x10,
            DeviceKind::Validator => 0x00,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DeviceKind::Hopper => "hopper",
            DeviceKind::Validator => "validator",
        }
    }

    pub fn request_topic(self) -> &'static str {
        match self {
            DeviceKind::Hopper => bus::HOPPER_REQUEST,
            DeviceKind::Validator => bus::VALIDATOR_REQUEST,
        }
    }

    pub fn response_topic(self) -> &'static str {
        match self {
            DeviceKind::Hopper => bus::HOPPER_RESPONSE,
            DeviceKind::Validator => bus::VALIDATOR_RESPONSE,
        }
    }

    pub fn event_topic(self) -> &'static str {
        match self {
            DeviceKind::Hopper => bus::HOPPER_EVENT,
            DeviceKind::Validator => bus::VALIDATOR_EVENT,
        }
    }
}

/// One cash peripheral and everything the host remembers about it.
pub struct Device<L> {
    kind: DeviceKind,
    channel: SharedChannel<L>,
    session: Session,
    /// Set once initialization completed; gates polling and bus commands.
    pub available: bool,
    /// SETUP_REQUEST snapshot, cached after initialization.
    pub setup: Option<SetupData>,
    inhibit_low: u8,
    inhibit_high: u8,
}

impl<L: SerialLink> Device<L> {
    pub fn new(kind: DeviceKind, channel: SharedChannel<L>) -> Self {
        Self {
            kind,
            channel,
            session: Session::new(kind.addr(), DEFAULT_FIXED_KEY),
            available: false,
            setup: None,
            inhibit_low: 0,
            inhibit_high: 0,
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn label(&self) -> &'static str {
        self.kind.label()
    }

    pub fn inhibits(&self) -> (u8, u8) {
        (self.inhibit_low, self.inhibit_high)
    }

    /// Face value of a setup-table channel, if known.
    pub fn channel_value(&self, channel: u8) -> Option<u32> {
        self.setup.as_ref().and_then(|s| s.channel_value(channel))
    }

    // -----------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------

    /// Brings the device from power-on to Enabled: SYNC, key negotiation,
    /// host protocol 6, setup snapshot, ENABLE (+ ENABLE_PAYOUT where the
    /// unit type carries a payout module).
    pub fn initialize(&mut self) -> Result<()> {
        self.sync()?;
        self.negotiate_keys()?;
        self.host_protocol(PROTOCOL_VERSION)?;

        let setup = self.setup_request()?;
        self.enable()?;
        if setup.unit_type.has_payout_module() {
            self.enable_payout(setup.unit_type)?;
        }

        self.session.state = SessionState::Enabled;
        self.available = true;

        log::info!(
            "{}: {} fw {} dataset {} with {} channels",
            self.label(),
            setup.unit_type,
            setup.firmware,
            setup.country,
            setup.channels.len()
        );
        for def in &setup.channels {
            log::debug!(
                "{}: channel {} = {} {}",
                self.label(),
                def.index,
                def.value,
                def.currency
            );
        }

        Ok(())
    }

    /// Follow-up for an observed "unit reset" poll event.
    ///
    /// The device dropped its session key and protocol version, so the
    /// very next command must be HOST_PROTOCOL, then a fresh key
    /// negotiation. The setup snapshot survives; a bus `enable` brings
    /// the unit back into service.
    pub fn recover_after_reset(&mut self) -> Result<()> {
        self.session.reset();
        self.host_protocol(PROTOCOL_VERSION)?;
        self.negotiate_keys()?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.command(cmd::SYNC, Vec::new())?;
        self.session.mark_synced();
        Ok(())
    }

    pub fn host_protocol(&mut self, version: u8) -> Result<()> {
        self.command(cmd::HOST_PROTOCOL_VERSION, catalog::host_protocol(version))?;
        if self.session.state < SessionState::Protocol6 {
            self.session.state = SessionState::Protocol6;
        }
        Ok(())
    }

    pub fn negotiate_keys(&mut self) -> Result<()> {
        let mut chan = Self::lock_channel(&self.channel)?;
        chan.negotiate_keys(&mut self.session)
    }

    pub fn setup_request(&mut self) -> Result<SetupData> {
        let data = self.command(cmd::SETUP_REQUEST, Vec::new())?;
        let setup = catalog::decode_setup(&data)?;
        self.setup = Some(setup.clone());
        if self.session.state < SessionState::SetupKnown {
            self.session.state = SessionState::SetupKnown;
        }
        Ok(setup)
    }

    pub fn enable(&mut self) -> Result<()> {
        self.command(cmd::ENABLE, Vec::new())?;
        if self.setup.is_some() {
            self.session.state = SessionState::Enabled;
        }
        Ok(())
    }

    pub fn disable(&mut self) -> Result<()> {
        self.command(cmd::DISABLE, Vec::new()).map(drop)
    }

    pub fn enable_payout(&mut self, unit_type: catalog::UnitType) -> Result<()> {
        self.command(cmd::ENABLE_PAYOUT_DEVICE, catalog::enable_payout(unit_type))
            .map(drop)
    }

    // -----------------------------------------------------------------
    // Operational commands
    // -----------------------------------------------------------------

    pub fn poll(&mut self) -> Result<Vec<PollEvent>> {
        let data = self.command(cmd::POLL, Vec::new())?;
        poll::parse(&data)
    }

    pub fn payout(&mut self, amount: u32, currency: &str, option: PayoutOption) -> Result<()> {
        self.command(cmd::PAYOUT_AMOUNT, catalog::payout(amount, currency, option))
            .map(drop)
    }

    pub fn float_amount(&mut self, keep: u32, currency: &str, option: PayoutOption) -> Result<()> {
        self.command(
            cmd::FLOAT_AMOUNT,
            catalog::float_amount(keep, currency, option),
        )
        .map(drop)
    }

    pub fn empty(&mut self) -> Result<()> {
        self.command(cmd::EMPTY_ALL, Vec::new()).map(drop)
    }

    pub fn smart_empty(&mut self) -> Result<()> {
        self.command(cmd::SMART_EMPTY, Vec::new()).map(drop)
    }

    pub fn halt_payout(&mut self) -> Result<()> {
        self.command(cmd::HALT_PAYOUT, Vec::new()).map(drop)
    }

    pub fn set_route(&mut self, amount: u32, currency: &str, route: Route) -> Result<()> {
        self.command(
            cmd::SET_DENOMINATION_ROUTE,
            catalog::set_route(amount, currency, route),
        )
        .map(drop)
    }

    pub fn set_denomination_level(
        &mut self,
        level: u16,
        amount: u32,
        currency: &str,
    ) -> Result<()> {
        self.command(
            cmd::SET_DENOMINATION_LEVEL,
            catalog::set_denomination_level(level, amount, currency),
        )
        .map(drop)
    }

    pub fn set_cashbox_payout_limit(
        &mut self,
        limit: u16,
        denomination: u32,
        currency: &str,
    ) -> Result<()> {
        self.command(
            cmd::SET_CASHBOX_PAYOUT_LIMIT,
            catalog::set_cashbox_payout_limit(limit, denomination, currency),
        )
        .map(drop)
    }

    pub fn get_all_levels(&mut self) -> Result<Vec<LevelCounter>> {
        let data = self.command(cmd::GET_ALL_LEVELS, Vec::new())?;
        catalog::decode_levels(&data)
    }

    pub fn cashbox_operation_data(&mut self) -> Result<CashboxOperationData> {
        let data = self.command(cmd::CASHBOX_PAYOUT_OPERATION_DATA, Vec::new())?;
        catalog::decode_cashbox_operation(&data)
    }

    pub fn last_reject_code(&mut self) -> Result<u8> {
        let data = self.command(cmd::LAST_REJECT_CODE, Vec::new())?;
        catalog::decode_reject_code(&data)
    }

    pub fn firmware_version(&mut self) -> Result<String> {
        let data = self.command(cmd::GET_FIRMWARE_VERSION, Vec::new())?;
        Ok(catalog::decode_version(&data))
    }

    pub fn dataset_version(&mut self) -> Result<String> {
        let data = self.command(cmd::GET_DATASET_VERSION, Vec::new())?;
        Ok(catalog::decode_version(&data))
    }

    pub fn configure_bezel(&mut self, r: u8, g: u8, b: u8, bezel_type: u8) -> Result<()> {
        // Volatile storage: the bezel colour does not survive a power cycle.
        self.command(
            cmd::CONFIGURE_BEZEL,
            catalog::configure_bezel(r, g, b, 0x00, bezel_type),
        )
        .map(drop)
    }

    pub fn set_refill_mode(&mut self) -> Result<()> {
        self.command(cmd::SET_REFILL_MODE, catalog::REFILL_MODE_MAGIC.to_vec())
            .map(drop)
    }

    pub fn channel_security(&mut self) -> Result<Vec<u8>> {
        let data = self.command(cmd::CHANNEL_SECURITY_DATA, Vec::new())?;
        catalog::decode_channel_security(&data)
    }

    pub fn run_calibration(&mut self) -> Result<()> {
        self.command(cmd::RUN_CALIBRATION, Vec::new()).map(drop)
    }

    pub fn set_coin_inhibit(&mut self, value: u16, currency: &str, enabled: bool) -> Result<()> {
        self.command(
            cmd::SET_COIN_MECH_INHIBITS,
            catalog::set_coin_inhibits(value, currency, enabled),
        )
        .map(drop)
    }

    // -----------------------------------------------------------------
    // Channel inhibits
    // -----------------------------------------------------------------

    /// Raw SET_CHANNEL_INHIBITS; the host bitmap is committed only after
    /// the device acknowledged, so it always matches the last value the
    /// hardware accepted.
    pub fn set_inhibits(&mut self, low: u8, high: u8) -> Result<()> {
        self.command(cmd::SET_CHANNEL_INHIBITS, catalog::set_inhibits(low, high))?;
        self.inhibit_low = low;
        self.inhibit_high = high;
        Ok(())
    }

    /// Enables the masked channels on top of the current bitmap.
    pub fn enable_channels(&mut self, mask: u8) -> Result<()> {
        let low = self.inhibit_low | mask;
        self.set_inhibits(low, self.inhibit_high)
    }

    /// Disables the masked channels, leaving the rest untouched.
    pub fn disable_channels(&mut self, mask: u8) -> Result<()> {
        let low = self.inhibit_low & !mask;
        self.set_inhibits(low, self.inhibit_high)
    }

    /// Absolute form: every channel enabled except the masked ones.
    pub fn inhibit_channels(&mut self, mask: u8) -> Result<()> {
        self.set_inhibits(0xFF & !mask, 0x00)
    }

    // -----------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------

    fn command(&mut self, code: u8, payload: Vec<u8>) -> Result<Vec<u8>> {
        let response = self.exchange_with_rekey(code, payload)?;
        match response.status {
            Status::Ok => Ok(response.data),
            Status::CommandNotProcessed => {
                Err(Error::NotProcessed(response.data.first().copied().unwrap_or(0)))
            }
            other => Err(Error::Device(other)),
        }
    }

    fn exchange_with_rekey(&mut self, code: u8, payload: Vec<u8>) -> Result<Response> {
        let command = Command::new(code, payload);
        let mut chan = Self::lock_channel(&self.channel)?;

        let response = chan.exchange(&mut self.session, &command)?;
        if response.status != Status::KeyNotSet {
            return Ok(response);
        }

        // The device forgot its key. Renegotiate once and replay the
        // command; the session keeps its configuration if that works.
        log::warn!("{}: key not set, renegotiating", self.kind.label());
        let prev = self.session.state;
        self.session.state = SessionState::Fresh;
        chan.negotiate_keys(&mut self.session)?;

        let response = chan.exchange(&mut self.session, &command)?;
        if response.status != Status::KeyNotSet {
            self.session.state = prev;
        }
        Ok(response)
    }

    fn lock_channel(channel: &SharedChannel<L>) -> Result<parking_lot::MutexGuard<'_, SspChannel<L>>> {
        channel.try_lock_for(LOCK_TIMEOUT).ok_or(Error::LineBusy)
    }

    #[cfg(test)]
    pub fn shared_channel(&self) -> SharedChannel<L> {
        Arc::clone(&self.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame;
    use crate::testutil::MockLink;

    fn hopper() -> Device<MockLink> {
        let channel = Arc::new(Mutex::new(SspChannel::new(MockLink::default())));
        Device::new(DeviceKind::Hopper, channel)
    }

    fn push_status(dev: &mut Device<MockLink>, seq: bool, status: u8) {
        let reply = frame::build(dev.kind.addr(), seq, &[status]);
        dev.channel.lock().link_mut().push_reply(reply);
    }

    fn written(dev: &Device<MockLink>) -> Vec<Vec<u8>> {
        dev.channel.lock().link_mut().written.clone()
    }

    #[test]
    fn enable_channels_ors_into_bitmap() {
        let mut dev = hopper();
        push_status(&mut dev, false, 0xF0);
        dev.enable_channels(0b0000_0101).unwrap();
        assert_eq!(dev.inhibits(), (0b0000_0101, 0));

        push_status(&mut dev, true, 0xF0);
        dev.enable_channels(0b0000_0010).unwrap();
        assert_eq!(dev.inhibits(), (0b0000_0111, 0));
    }

    #[test]
    fn disable_channels_clears_bits() {
        let mut dev = hopper();
        push_status(&mut dev, false, 0xF0);
        dev.enable_channels(0b0000_0111).unwrap();

        push_status(&mut dev, true, 0xF0);
        dev.disable_channels(0b0000_0010).unwrap();
        assert_eq!(dev.inhibits(), (0b0000_0101, 0));
    }

    #[test]
    fn failed_set_inhibits_leaves_bitmap_untouched() {
        let mut dev = hopper();
        push_status(&mut dev, false, 0xF8);
        assert!(dev.enable_channels(0b0000_0001).is_err());
        assert_eq!(dev.inhibits(), (0, 0));
    }

    #[test]
    fn inhibit_channels_is_absolute_and_idempotent() {
        let mut dev = hopper();
        push_status(&mut dev, false, 0xF0);
        dev.inhibit_channels(0b0000_0100).unwrap();
        assert_eq!(dev.inhibits(), (0b1111_1011, 0));

        push_status(&mut dev, true, 0xF0);
        dev.inhibit_channels(0b0000_0100).unwrap();
        assert_eq!(dev.inhibits(), (0b1111_1011, 0));

        // Identical data section on the wire both times (only seq and CRC
        // differ).
        let frames = written(&dev);
        assert_eq!(frames[0][3..6], frames[1][3..6]);
    }

    #[test]
    fn command_not_processed_carries_sub_error() {
        let mut dev = hopper();
        let reply = frame::build(dev.kind.addr(), false, &[0xF5, 0x02]);
        dev.channel.lock().link_mut().push_reply(reply);

        let err = dev
            .payout(1_234, "EUR", PayoutOption::Do)
            .unwrap_err();
        assert!(matches!(err, Error::NotProcessed(0x02)));
    }

    #[test]
    fn key_not_set_triggers_renegotiation_and_replay() {
        let mut dev = hopper();
        let addr = dev.kind.addr();

        // 1: KEY_NOT_SET, 2-4: key negotiation, 5: replayed command OK.
        let chan = dev.channel.clone();
        {
            let mut chan = chan.lock();
            let link = chan.link_mut();
            link.push_reply(frame::build(addr, false, &[0xFA]));
            link.push_reply(frame::build(addr, true, &[0xF0]));
            link.push_reply(frame::build(addr, false, &[0xF0]));
            link.push_reply(frame::build(
                addr,
                true,
                &{
                    let mut d = vec![0xF0];
                    d.extend_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());
                    d
                },
            ));
        }
        // The replay goes out encrypted and gets no reply, surfacing as a
        // timeout after the retry budget; the negotiation frames prove the
        // re-key happened.
        let err = dev.enable().unwrap_err();
        assert!(matches!(err, Error::Device(Status::Timeout)));
        assert!(written(&dev).len() >= 4 + 3);
    }
}
