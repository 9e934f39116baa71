//! Payload encoders and response decoders for every SSP command the daemon
//! issues. Multi-byte integers are little-endian, currencies are 3 ASCII
//! characters, option bytes are vendor constants that must round-trip
//! unchanged.

use std::fmt;

use crate::error::{Error, Result};

/// Payout option byte: dry-run check or actual payout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutOption {
    Test,
    Do,
}

impl PayoutOption {
    pub fn byte(self) -> u8 {
        match self {
            PayoutOption::Test => 0x19,
            PayoutOption::Do => 0x58,
        }
    }
}

/// Destination of a denomination: payout store or the one-way cashbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Storage,
    Cashbox,
}

impl Route {
    pub fn byte(self) -> u8 {
        match self {
            Route::Storage => 0x00,
            Route::Cashbox => 0x01,
        }
    }
}

/// Minimum-payout field of FLOAT_AMOUNT, fixed by the integration.
pub const FLOAT_MINIMUM: u16 = 100;

/// Vendor magic enabling refill mode.
pub const REFILL_MODE_MAGIC: [u8; 8] = [0x05, 0x81, 0x10, 0x11, 0x01, 0x00, 0x00, 0x00];

/// Unit type byte from SETUP_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitType {
    NoteValidator,
    SmartHopper,
    SmartPayout,
    Other(u8),
}

impl UnitType {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => UnitType::NoteValidator,
            0x03 => UnitType::SmartHopper,
            0x06 => UnitType::SmartPayout,
            other => UnitType::Other(other),
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            UnitType::NoteValidator => 0x00,
            UnitType::SmartHopper => 0x03,
            UnitType::SmartPayout => 0x06,
            UnitType::Other(byte) => byte,
        }
    }

    /// Unit types that additionally need ENABLE_PAYOUT_DEVICE.
    pub fn has_payout_module(self) -> bool {
        matches!(self, UnitType::NoteValidator | UnitType::SmartPayout)
    }
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitType::NoteValidator => f.write_str("note validator"),
            UnitType::SmartHopper => f.write_str("smart hopper"),
            UnitType::SmartPayout => f.write_str("smart payout"),
            UnitType::Other(byte) => write!(f, "unit type {byte:#04x}"),
        }
    }
}

/// One entry of a device's channel table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDef {
    pub index: u8,
    pub value: u32,
    pub currency: String,
}

/// Cached SETUP_REQUEST snapshot.
#[derive(Debug, Clone)]
pub struct SetupData {
    pub unit_type: UnitType,
    pub firmware: String,
    pub country: String,
    pub protocol: u8,
    pub channels: Vec<ChannelDef>,
}

impl SetupData {
    pub fn channel_value(&self, channel: u8) -> Option<u32> {
        self.channels
            .iter()
            .find(|def| def.index == channel)
            .map(|def| def.value)
    }
}

/// One counter row of GET_ALL_LEVELS / CASHBOX_PAYOUT_OPERATION_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelCounter {
    pub level: u16,
    pub value: u32,
    pub currency: String,
}

/// CASHBOX_PAYOUT_OPERATION_DATA: counters plus the quantity of coins the
/// device could not attribute to a denomination.
#[derive(Debug, Clone)]
pub struct CashboxOperationData {
    pub counters: Vec<LevelCounter>,
    pub unknown_coins: u32,
}

// ---------------------------------------------------------------------------
// Encoders
// ---------------------------------------------------------------------------

pub fn host_protocol(version: u8) -> Vec<u8> {
    vec![version]
}

pub fn set_inhibits(low: u8, high: u8) -> Vec<u8> {
    vec![low, high]
}

pub fn set_coin_inhibits(value: u16, currency: &str, enabled: bool) -> Vec<u8> {
    let mut payload = Vec::with_capacity(6);
    payload.extend_from_slice(&value.to_le_bytes());
    push_currency(&mut payload, currency);
    payload.push(u8::from(enabled));
    payload
}

pub fn set_route(amount: u32, currency: &str, route: Route) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&amount.to_le_bytes());
    push_currency(&mut payload, currency);
    payload.push(route.byte());
    payload
}

pub fn payout(amount: u32, currency: &str, option: PayoutOption) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&amount.to_le_bytes());
    push_currency(&mut payload, currency);
    payload.push(option.byte());
    payload
}

pub fn float_amount(keep: u32, currency: &str, option: PayoutOption) -> Vec<u8> {
    let mut payload = Vec::with_capacity(10);
    payload.extend_from_slice(&FLOAT_MINIMUM.to_le_bytes());
    payload.extend_from_slice(&keep.to_le_bytes());
    push_currency(&mut payload, currency);
    payload.push(option.byte());
    payload
}

pub fn set_denomination_level(level: u16, amount: u32, currency: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(9);
    payload.extend_from_slice(&level.to_le_bytes());
    payload.extend_from_slice(&amount.to_le_bytes());
    push_currency(&mut payload, currency);
    payload
}

/// Wire order is `{count=1, u16 limit, u32 denomination, cc}`; note the bus
/// request maps `level` to the limit and `amount` to the denomination.
pub fn set_cashbox_payout_limit(limit: u16, denomination: u32, currency: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(10);
    payload.push(0x01);
    payload.extend_from_slice(&limit.to_le_bytes());
    payload.extend_from_slice(&denomination.to_le_bytes());
    push_currency(&mut payload, currency);
    payload
}

pub fn configure_bezel(r: u8, g: u8, b: u8, volatility: u8, bezel_type: u8) -> Vec<u8> {
    vec![r, g, b, volatility, bezel_type]
}

pub fn enable_payout(unit_type: UnitType) -> Vec<u8> {
    vec![unit_type.byte()]
}

fn push_currency(payload: &mut Vec<u8>, currency: &str) {
    let mut chars = currency.bytes().chain(std::iter::repeat(b' '));
    for _ in 0..3 {
        payload.push(chars.next().unwrap_or(b' '));
    }
}

// ---------------------------------------------------------------------------
// Decoders
// ---------------------------------------------------------------------------

pub fn decode_setup(data: &[u8]) -> Result<SetupData> {
    if data.len() < 10 {
        return Err(Error::Decode("setup response too short"));
    }

    let unit_type = UnitType::from_byte(data[0]);
    let firmware = ascii(&data[1..5]);
    let country = ascii(&data[5..8]);
    let protocol = data[8];
    let count = data[9] as usize;

    let values_end = 10 + count * 4;
    let table_end = values_end + count * 3;
    if data.len() < table_end {
        return Err(Error::Decode("setup channel table truncated"));
    }

    let mut channels = Vec::with_capacity(count);
    for i in 0..count {
        let at = 10 + i * 4;
        let value = u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let cc_at = values_end + i * 3;
        channels.push(ChannelDef {
            index: (i + 1) as u8,
            value,
            currency: ascii(&data[cc_at..cc_at + 3]),
        });
    }

    Ok(SetupData {
        unit_type,
        firmware,
        country,
        protocol,
        channels,
    })
}

pub fn decode_levels(data: &[u8]) -> Result<Vec<LevelCounter>> {
    let (counters, _) = decode_counter_block(data)?;
    Ok(counters)
}

pub fn decode_cashbox_operation(data: &[u8]) -> Result<CashboxOperationData> {
    let (counters, rest) = decode_counter_block(data)?;
    if rest.len() < 3 {
        return Err(Error::Decode("missing unknown-coin count"));
    }
    let unknown_coins = u32::from_le_bytes([rest[0], rest[1], rest[2], 0]);

    Ok(CashboxOperationData {
        counters,
        unknown_coins,
    })
}

fn decode_counter_block(data: &[u8]) -> Result<(Vec<LevelCounter>, &[u8])> {
    let Some((&count, mut rest)) = data.split_first() else {
        return Err(Error::Decode("empty counter response"));
    };

    let mut counters = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if rest.len() < 9 {
            return Err(Error::Decode("counter row truncated"));
        }
        counters.push(LevelCounter {
            level: u16::from_le_bytes([rest[0], rest[1]]),
            value: u32::from_le_bytes([rest[2], rest[3], rest[4], rest[5]]),
            currency: ascii(&rest[6..9]),
        });
        rest = &rest[9..];
    }

    Ok((counters, rest))
}

pub fn decode_channel_security(data: &[u8]) -> Result<Vec<u8>> {
    let Some((&count, rest)) = data.split_first() else {
        return Err(Error::Decode("empty security response"));
    };
    if rest.len() < count as usize {
        return Err(Error::Decode("security levels truncated"));
    }
    Ok(rest[..count as usize].to_vec())
}

pub fn decode_reject_code(data: &[u8]) -> Result<u8> {
    data.first()
        .copied()
        .ok_or(Error::Decode("empty reject-code response"))
}

pub fn decode_version(data: &[u8]) -> String {
    ascii(data).trim().to_string()
}

fn ascii(data: &[u8]) -> String {
    data.iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

/// Phrase for a payout/float COMMAND_NOT_PROCESSED sub-error.
pub fn payout_error(sub: u8) -> String {
    match sub {
        0x01 => "not enough value in smart payout".into(),
        0x02 => "can't pay exact amount".into(),
        0x03 => "smart payout busy".into(),
        0x04 => "smart payout disabled".into(),
        other => format!("payout error {other:#04x}"),
    }
}

/// Phrase for a LAST_REJECT_CODE byte.
pub fn reject_reason(code: u8) -> &'static str {
    match code {
        0x00 => "note accepted",
        0x01 => "note length incorrect",
        0x02 => "average fail",
        0x03 => "coastline fail",
        0x04 => "graph fail",
        0x05 => "buried fail",
        0x06 => "channel inhibited",
        0x07 => "second note inserted",
        0x08 => "reject by host",
        0x09 => "strimming attempt detected",
        0x0A => "fraud channel reject",
        0x0B => "no notes inserted",
        0x0C => "peak detect fail",
        0x0D => "twisted note detected",
        0x0E => "escrow time-out",
        0x0F => "bar code scan fail",
        0x10 => "rear sensor 2 fail",
        0x11 => "slot fail 1",
        0x12 => "slot fail 2",
        0x13 => "lens over-sample",
        0x14 => "width detect fail",
        0x15 => "short note detected",
        0x16 => "note payout",
        0x17 => "unable to stack note",
        0x18 => "high doubt level",
        0x19 => "note stacker full",
        0x1A => "incorrect note width",
        0x1B => "note too long",
        0x1C => "disabled by host",
        _ => "undefined reject reason",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_encode_little_endian() {
        let payload = payout(100_000, "EUR", PayoutOption::Do);
        assert_eq!(&payload[..4], &[0xA0, 0x86, 0x01, 0x00]);
        assert_eq!(&payload[4..7], b"EUR");
        assert_eq!(payload[7], 0x58);
    }

    #[test]
    fn test_payout_uses_test_option_byte() {
        let payload = payout(1_234, "EUR", PayoutOption::Test);
        assert_eq!(payload[7], 0x19);
    }

    #[test]
    fn float_carries_fixed_minimum_first() {
        let payload = float_amount(5_000, "EUR", PayoutOption::Do);
        assert_eq!(&payload[..2], &[100, 0]);
        assert_eq!(&payload[2..6], &5_000u32.to_le_bytes());
        assert_eq!(&payload[6..9], b"EUR");
        assert_eq!(payload[9], 0x58);
    }

    #[test]
    fn cashbox_limit_wire_order_is_count_limit_denomination() {
        let payload = set_cashbox_payout_limit(5, 2_000, "EUR");
        assert_eq!(payload[0], 0x01);
        assert_eq!(&payload[1..3], &5u16.to_le_bytes());
        assert_eq!(&payload[3..7], &2_000u32.to_le_bytes());
        assert_eq!(&payload[7..10], b"EUR");
    }

    #[test]
    fn route_bytes_round_trip() {
        assert_eq!(set_route(500, "EUR", Route::Cashbox)[7], 0x01);
        assert_eq!(set_route(5_000, "EUR", Route::Storage)[7], 0x00);
    }

    #[test]
    fn setup_decodes_channel_table() {
        let mut data = vec![0x00];
        data.extend_from_slice(b"0123");
        data.extend_from_slice(b"EUR");
        data.push(0x06);
        data.push(2);
        data.extend_from_slice(&5u32.to_le_bytes());
        data.extend_from_slice(&10u32.to_le_bytes());
        data.extend_from_slice(b"EUREUR");

        let setup = decode_setup(&data).unwrap();
        assert_eq!(setup.unit_type, UnitType::NoteValidator);
        assert_eq!(setup.firmware, "0123");
        assert_eq!(setup.protocol, 6);
        assert_eq!(setup.channels.len(), 2);
        assert_eq!(setup.channel_value(1), Some(5));
        assert_eq!(setup.channel_value(2), Some(10));
        assert_eq!(setup.channels[1].currency, "EUR");
    }

    #[test]
    fn levels_decode_zero_rows() {
        assert!(decode_levels(&[0]).unwrap().is_empty());
    }

    #[test]
    fn cashbox_operation_reads_trailing_u24() {
        let mut data = vec![1];
        data.extend_from_slice(&3u16.to_le_bytes());
        data.extend_from_slice(&200u32.to_le_bytes());
        data.extend_from_slice(b"EUR");
        data.extend_from_slice(&[0x2A, 0x00, 0x00]);

        let op = decode_cashbox_operation(&data).unwrap();
        assert_eq!(op.counters.len(), 1);
        assert_eq!(op.counters[0].level, 3);
        assert_eq!(op.counters[0].value, 200);
        assert_eq!(op.unknown_coins, 42);
    }

    #[test]
    fn truncated_counter_row_is_an_error() {
        assert!(decode_levels(&[1, 0x03, 0x00]).is_err());
    }

    #[test]
    fn reject_table_boundaries() {
        assert_eq!(reject_reason(0x00), "note accepted");
        assert_eq!(reject_reason(0x1C), "disabled by host");
        assert_eq!(reject_reason(0x42), "undefined reject reason");
    }
}
