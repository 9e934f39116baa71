//! Bus request handling: JSON validation, dispatch into the device
//! session, and response document construction.
//!
//! Every accepted request produces exactly one response document carrying
//! a fresh `msgId` and the request's `msgId` echoed as `correlId`.

use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::protocol::catalog::{self, PayoutOption};
use crate::protocol::CURRENCY;
use crate::transport::SerialLink;

/// Outcome of one request: the document to publish and whether the caller
/// asked the daemon to terminate.
pub struct Reply {
    pub doc: Value,
    pub quit: bool,
}

impl Reply {
    fn doc(doc: Value) -> Self {
        Self { doc, quit: false }
    }
}

/// Handles one raw message from a request topic.
///
/// Only fatal conditions (lost serial line, lost bus) surface as `Err`;
/// everything else becomes an error document on the response topic.
pub fn handle<L: SerialLink>(
    dev: &mut Device<L>,
    hardware_available: bool,
    raw: &str,
) -> Result<Reply> {
    let req: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            log::warn!("unparseable request on {}: {err}", dev.label());
            return Ok(Reply::doc(json!({
                "msgId": fresh_msg_id(),
                "error": "could not parse json",
                "reason": err.to_string(),
                "line": err.line(),
            })));
        }
    };

    let Some(correl) = req.get("msgId").and_then(Value::as_str).map(String::from) else {
        return Ok(Reply::doc(property_error(None, "msgId")));
    };
    let Some(cmd) = req.get("cmd").and_then(Value::as_str).map(String::from) else {
        return Ok(Reply::doc(property_error(Some(&correl), "cmd")));
    };

    log::debug!("{}: command {cmd}", dev.label());

    // test and quit work even with no hardware on the line.
    match cmd.as_str() {
        "test" => return Ok(Reply::doc(ok_reply(&correl))),
        "quit" => {
            return Ok(Reply {
                doc: ok_reply(&correl),
                quit: true,
            })
        }
        _ => {}
    }

    if !hardware_available {
        return Ok(Reply::doc(error_reply(&correl, "hardware unavailable")));
    }

    let doc = dispatch(dev, &req, &correl, &cmd)?;
    Ok(Reply::doc(doc))
}

fn dispatch<L: SerialLink>(
    dev: &mut Device<L>,
    req: &Value,
    correl: &str,
    cmd: &str,
) -> Result<Value> {
    match cmd {
        "configure-bezel" => {
            let r = match byte_field(req, correl, "r") {
                Ok(v) => v,
                Err(doc) => return Ok(doc),
            };
            let g = match byte_field(req, correl, "g") {
                Ok(v) => v,
                Err(doc) => return Ok(doc),
            };
            let b = match byte_field(req, correl, "b") {
                Ok(v) => v,
                Err(doc) => return Ok(doc),
            };
            let bezel_type = match byte_field(req, correl, "type") {
                Ok(v) => v,
                Err(doc) => return Ok(doc),
            };
            simple(correl, dev.configure_bezel(r, g, b, bezel_type))
        }

        "empty" => simple(correl, dev.empty()),
        "smart-empty" => simple(correl, dev.smart_empty()),
        "enable" => simple(correl, dev.enable()),
        "disable" => simple(correl, dev.disable()),
        "halt-payout" => simple(correl, dev.halt_payout()),

        "enable-channels" => {
            let mask = match channel_mask(req, correl) {
                Ok(mask) => mask,
                Err(doc) => return Ok(doc),
            };
            simple(correl, dev.enable_channels(mask))
        }
        "disable-channels" => {
            let mask = match channel_mask(req, correl) {
                Ok(mask) => mask,
                Err(doc) => return Ok(doc),
            };
            simple(correl, dev.disable_channels(mask))
        }
        "inhibit-channels" => {
            let mask = match channel_mask(req, correl) {
                Ok(mask) => mask,
                Err(doc) => return Ok(doc),
            };
            simple(correl, dev.inhibit_channels(mask))
        }

        "set-denomination-level" => {
            let (level, amount) = match (
                int_field::<u16>(req, correl, "level"),
                int_field::<u32>(req, correl, "amount"),
            ) {
                (Ok(level), Ok(amount)) => (level, amount),
                (Err(doc), _) | (_, Err(doc)) => return Ok(doc),
            };
            // The command adds to the stored level except when the level is
            // zero, which clears it. Setting an absolute level therefore
            // clears first, then adds.
            let result = dev.set_denomination_level(0, amount, CURRENCY).and_then(|()| {
                if level > 0 {
                    dev.set_denomination_level(level, amount, CURRENCY)
                } else {
                    Ok(())
                }
            });
            simple(correl, result)
        }

        "set-cashbox-payout-limit" => {
            let (level, amount) = match (
                int_field::<u16>(req, correl, "level"),
                int_field::<u32>(req, correl, "amount"),
            ) {
                (Ok(level), Ok(amount)) => (level, amount),
                (Err(doc), _) | (_, Err(doc)) => return Ok(doc),
            };
            simple(correl, dev.set_cashbox_payout_limit(level, amount, CURRENCY))
        }

        "get-all-levels" => match dev.get_all_levels() {
            Ok(counters) => Ok(levels_reply(correl, &counters, None)),
            Err(err) => surface(correl, err),
        },
        "cashbox-payout-operation-data" => match dev.cashbox_operation_data() {
            Ok(op) => Ok(levels_reply(correl, &op.counters, Some(op.unknown_coins))),
            Err(err) => surface(correl, err),
        },

        "get-firmware-version" => match dev.firmware_version() {
            Ok(version) => Ok(version_reply(correl, &version)),
            Err(err) => surface(correl, err),
        },
        "get-dataset-version" => match dev.dataset_version() {
            Ok(version) => Ok(version_reply(correl, &version)),
            Err(err) => surface(correl, err),
        },

        "last-reject-note" => match dev.last_reject_code() {
            Ok(code) => Ok(json!({
                "msgId": fresh_msg_id(),
                "correlId": correl,
                "reason": catalog::reject_reason(code),
                "code": code,
            })),
            Err(err) => surface(correl, err),
        },

        "test-payout" => payout(dev, req, correl, PayoutOption::Test),
        "do-payout" => payout(dev, req, correl, PayoutOption::Do),
        "test-float" => float(dev, req, correl, PayoutOption::Test),
        "do-float" => float(dev, req, correl, PayoutOption::Do),

        "channel-security-data" => match dev.channel_security() {
            Ok(levels) => {
                log::debug!("{}: channel security levels {levels:?}", dev.label());
                Ok(ok_reply(correl))
            }
            Err(err) => surface(correl, err),
        },

        other => Ok(json!({
            "msgId": fresh_msg_id(),
            "correlId": correl,
            "error": "unknown command",
            "cmd": other,
        })),
    }
}

fn payout<L: SerialLink>(
    dev: &mut Device<L>,
    req: &Value,
    correl: &str,
    option: PayoutOption,
) -> Result<Value> {
    let amount = match int_field::<u32>(req, correl, "amount") {
        Ok(amount) => amount,
        Err(doc) => return Ok(doc),
    };
    match dev.payout(amount, CURRENCY, option) {
        Ok(()) => Ok(ok_reply(correl)),
        Err(Error::NotProcessed(sub)) => Ok(error_reply(correl, &catalog::payout_error(sub))),
        Err(err) => surface(correl, err),
    }
}

fn float<L: SerialLink>(
    dev: &mut Device<L>,
    req: &Value,
    correl: &str,
    option: PayoutOption,
) -> Result<Value> {
    let amount = match int_field::<u32>(req, correl, "amount") {
        Ok(amount) => amount,
        Err(doc) => return Ok(doc),
    };
    match dev.float_amount(amount, CURRENCY, option) {
        Ok(()) => Ok(ok_reply(correl)),
        Err(Error::NotProcessed(sub)) => Ok(error_reply(correl, &catalog::payout_error(sub))),
        Err(err) => surface(correl, err),
    }
}

// ---------------------------------------------------------------------------
// Field extraction
// ---------------------------------------------------------------------------

fn int_field<T: TryFrom<i64>>(
    req: &Value,
    correl: &str,
    key: &str,
) -> std::result::Result<T, Value> {
    req.get(key)
        .and_then(Value::as_i64)
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| property_error(Some(correl), key))
}

fn byte_field(req: &Value, correl: &str, key: &str) -> std::result::Result<u8, Value> {
    int_field::<u8>(req, correl, key)
}

fn channel_mask(req: &Value, correl: &str) -> std::result::Result<u8, Value> {
    let channels = req
        .get("channels")
        .and_then(Value::as_str)
        .ok_or_else(|| property_error(Some(correl), "channels"))?;
    Ok(parse_channels(channels))
}

/// Builds the channel bitmask from a digit string: each digit 1..8 selects
/// that channel, anything else is ignored.
pub fn parse_channels(channels: &str) -> u8 {
    channels
        .chars()
        .filter_map(|c| match c {
            '1'..='8' => Some(1u8 << (c as u8 - b'1')),
            _ => None,
        })
        .fold(0, |mask, bit| mask | bit)
}

// ---------------------------------------------------------------------------
// Reply documents
// ---------------------------------------------------------------------------

fn fresh_msg_id() -> String {
    Uuid::new_v4().to_string()
}

fn base(correl: Option<&str>) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("msgId".into(), Value::String(fresh_msg_id()));
    if let Some(correl) = correl {
        map.insert("correlId".into(), Value::String(correl.into()));
    }
    map
}

fn ok_reply(correl: &str) -> Value {
    let mut map = base(Some(correl));
    map.insert("result".into(), "ok".into());
    Value::Object(map)
}

fn error_reply(correl: &str, message: &str) -> Value {
    let mut map = base(Some(correl));
    map.insert("error".into(), message.into());
    Value::Object(map)
}

fn property_error(correl: Option<&str>, key: &str) -> Value {
    let mut map = base(correl);
    map.insert(
        "error".into(),
        format!("Property '{key}' missing or of wrong type").into(),
    );
    Value::Object(map)
}

fn version_reply(correl: &str, version: &str) -> Value {
    let mut map = base(Some(correl));
    map.insert("version".into(), version.into());
    Value::Object(map)
}

fn levels_reply(
    correl: &str,
    counters: &[catalog::LevelCounter],
    unknown_coins: Option<u32>,
) -> Value {
    let mut levels: Vec<Value> = counters
        .iter()
        .map(|c| json!({ "level": c.level, "value": c.value, "cc": c.currency }))
        .collect();
    if let Some(qty) = unknown_coins {
        levels.push(json!({ "value": 0, "level": qty }));
    }

    let mut map = base(Some(correl));
    map.insert("levels".into(), Value::Array(levels));
    Value::Object(map)
}

fn simple(correl: &str, result: Result<()>) -> Result<Value> {
    match result {
        Ok(()) => Ok(ok_reply(correl)),
        Err(err) => surface(correl, err),
    }
}

/// Maps a device failure to a response document, letting fatal errors
/// escape to tear the daemon down.
fn surface(correl: &str, err: Error) -> Result<Value> {
    if err.is_fatal() {
        return Err(err);
    }

    let mut map = base(Some(correl));
    match err {
        Error::Device(status) => {
            map.insert("sspError".into(), status.to_string().into());
        }
        Error::NotProcessed(_) => {
            map.insert("sspError".into(), "command not processed".into());
        }
        other => {
            log::warn!("command failed: {other}");
            map.insert("sspError".into(), other.to_string().into());
        }
    }
    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, SharedChannel};
    use crate::protocol::channel::SspChannel;
    use crate::protocol::{cmd, frame};
    use crate::testutil::MockLink;
    use std::sync::Arc;

    fn device(kind: DeviceKind) -> Device<MockLink> {
        let channel: SharedChannel<MockLink> =
            Arc::new(parking_lot::Mutex::new(SspChannel::new(MockLink::default())));
        let mut dev = Device::new(kind, channel);
        dev.available = true;
        dev
    }

    fn push_reply(dev: &Device<MockLink>, seq: bool, data: &[u8]) {
        let wire = frame::build(dev.kind().addr(), seq, data);
        dev.shared_channel().lock().link_mut().push_reply(wire);
    }

    fn written(dev: &Device<MockLink>) -> Vec<Vec<u8>> {
        dev.shared_channel().lock().link_mut().written.clone()
    }

    fn handle_ok(dev: &mut Device<MockLink>, raw: &str) -> Value {
        handle(dev, true, raw).unwrap().doc
    }

    #[test]
    fn bezel_happy_path_acknowledges() {
        let mut dev = device(DeviceKind::Hopper);
        push_reply(&dev, false, &[0xF0]);

        let doc = handle_ok(
            &mut dev,
            r#"{"cmd":"configure-bezel","msgId":"A","r":255,"g":0,"b":0,"type":1}"#,
        );
        assert_eq!(doc["correlId"], "A");
        assert_eq!(doc["result"], "ok");
        assert!(doc["msgId"].as_str().unwrap().len() == 36);

        // r, g, b, volatility, type on the wire.
        let frames = written(&dev);
        assert_eq!(frames[0][3], cmd::CONFIGURE_BEZEL);
        assert_eq!(&frames[0][4..9], &[0xFF, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn missing_bezel_type_never_touches_the_line() {
        let mut dev = device(DeviceKind::Hopper);
        let doc = handle_ok(
            &mut dev,
            r#"{"cmd":"configure-bezel","msgId":"B","r":255,"g":0,"b":0}"#,
        );
        assert_eq!(doc["correlId"], "B");
        assert_eq!(doc["error"], "Property 'type' missing or of wrong type");
        assert!(written(&dev).is_empty());
    }

    #[test]
    fn out_of_range_bezel_component_is_a_property_error() {
        let mut dev = device(DeviceKind::Hopper);
        let doc = handle_ok(
            &mut dev,
            r#"{"cmd":"configure-bezel","msgId":"B2","r":300,"g":0,"b":0,"type":1}"#,
        );
        assert_eq!(doc["error"], "Property 'r' missing or of wrong type");
        assert!(written(&dev).is_empty());
    }

    #[test]
    fn payout_sub_error_phrase_is_surfaced() {
        let mut dev = device(DeviceKind::Validator);
        push_reply(&dev, false, &[0xF5, 0x02]);

        let doc = handle_ok(&mut dev, r#"{"cmd":"do-payout","msgId":"C","amount":1234}"#);
        assert_eq!(doc["correlId"], "C");
        assert_eq!(doc["error"], "can't pay exact amount");
    }

    #[test]
    fn unknown_command_echoes_cmd() {
        let mut dev = device(DeviceKind::Hopper);
        let doc = handle_ok(&mut dev, r#"{"cmd":"nope","msgId":"D"}"#);
        assert_eq!(doc["correlId"], "D");
        assert_eq!(doc["error"], "unknown command");
        assert_eq!(doc["cmd"], "nope");
    }

    #[test]
    fn unavailable_hardware_rejects_everything_but_test_and_quit() {
        let mut dev = device(DeviceKind::Hopper);

        let doc = handle(&mut dev, false, r#"{"cmd":"empty","msgId":"E"}"#)
            .unwrap()
            .doc;
        assert_eq!(doc["error"], "hardware unavailable");

        let doc = handle(&mut dev, false, r#"{"cmd":"test","msgId":"F"}"#)
            .unwrap()
            .doc;
        assert_eq!(doc["result"], "ok");

        let reply = handle(&mut dev, false, r#"{"cmd":"quit","msgId":"G"}"#).unwrap();
        assert_eq!(reply.doc["result"], "ok");
        assert!(reply.quit);

        assert!(written(&dev).is_empty());
    }

    #[test]
    fn channel_string_selects_bits() {
        assert_eq!(parse_channels("135"), 0b0001_0101);
        assert_eq!(parse_channels(""), 0);
        assert_eq!(parse_channels("9A!2"), 0b0000_0010);
    }

    #[test]
    fn enable_channels_requires_channel_string() {
        let mut dev = device(DeviceKind::Validator);
        let doc = handle_ok(&mut dev, r#"{"cmd":"enable-channels","msgId":"H"}"#);
        assert_eq!(doc["error"], "Property 'channels' missing or of wrong type");
        assert!(written(&dev).is_empty());
    }

    #[test]
    fn enable_channels_sends_mask() {
        let mut dev = device(DeviceKind::Validator);
        push_reply(&dev, false, &[0xF0]);

        let doc = handle_ok(
            &mut dev,
            r#"{"cmd":"enable-channels","msgId":"I","channels":"12"}"#,
        );
        assert_eq!(doc["result"], "ok");

        let frames = written(&dev);
        assert_eq!(frames[0][3], cmd::SET_CHANNEL_INHIBITS);
        assert_eq!(frames[0][4], 0b0000_0011);
        assert_eq!(frames[0][5], 0x00);
    }

    #[test]
    fn set_denomination_level_clears_then_adds() {
        let mut dev = device(DeviceKind::Hopper);
        push_reply(&dev, false, &[0xF0]);
        push_reply(&dev, true, &[0xF0]);

        let doc = handle_ok(
            &mut dev,
            r#"{"cmd":"set-denomination-level","msgId":"J","level":5,"amount":200}"#,
        );
        assert_eq!(doc["result"], "ok");

        let frames = written(&dev);
        assert_eq!(frames.len(), 2);
        // First frame clears (level 0), second sets level 5.
        assert_eq!(&frames[0][4..6], &[0, 0]);
        assert_eq!(&frames[1][4..6], &[5, 0]);
        assert_eq!(&frames[1][6..10], &200u32.to_le_bytes());
    }

    #[test]
    fn zero_level_is_issued_once() {
        let mut dev = device(DeviceKind::Hopper);
        push_reply(&dev, false, &[0xF0]);

        let doc = handle_ok(
            &mut dev,
            r#"{"cmd":"set-denomination-level","msgId":"K","level":0,"amount":200}"#,
        );
        assert_eq!(doc["result"], "ok");
        assert_eq!(written(&dev).len(), 1);
    }

    #[test]
    fn get_all_levels_with_no_counters_is_an_empty_array() {
        let mut dev = device(DeviceKind::Hopper);
        push_reply(&dev, false, &[0xF0, 0x00]);

        let doc = handle_ok(&mut dev, r#"{"cmd":"get-all-levels","msgId":"L"}"#);
        assert_eq!(doc["levels"], json!([]));
    }

    #[test]
    fn cashbox_operation_data_appends_unknown_coin_entry() {
        let mut dev = device(DeviceKind::Hopper);
        let mut data = vec![0xF0, 0x00];
        data.extend_from_slice(&[0x07, 0x00, 0x00]);
        push_reply(&dev, false, &data);

        let doc = handle_ok(
            &mut dev,
            r#"{"cmd":"cashbox-payout-operation-data","msgId":"M"}"#,
        );
        assert_eq!(doc["levels"], json!([{ "value": 0, "level": 7 }]));
    }

    #[test]
    fn last_reject_note_maps_reason_phrase() {
        let mut dev = device(DeviceKind::Validator);
        push_reply(&dev, false, &[0xF0, 0x06]);

        let doc = handle_ok(&mut dev, r#"{"cmd":"last-reject-note","msgId":"N"}"#);
        assert_eq!(doc["reason"], "channel inhibited");
        assert_eq!(doc["code"], 6);
    }

    #[test]
    fn non_ok_status_becomes_ssp_error() {
        let mut dev = device(DeviceKind::Hopper);
        push_reply(&dev, false, &[0xF8]);

        let doc = handle_ok(&mut dev, r#"{"cmd":"empty","msgId":"O"}"#);
        assert_eq!(doc["sspError"], "failure");
    }

    #[test]
    fn unparseable_json_reports_reason_and_line() {
        let mut dev = device(DeviceKind::Hopper);
        let doc = handle_ok(&mut dev, "{nope");
        assert_eq!(doc["error"], "could not parse json");
        assert!(doc["reason"].as_str().is_some());
        assert!(doc["line"].as_i64().is_some());
        assert!(doc.get("correlId").is_none());
    }

    #[test]
    fn missing_msg_id_is_a_property_error() {
        let mut dev = device(DeviceKind::Hopper);
        let doc = handle_ok(&mut dev, r#"{"cmd":"test"}"#);
        assert_eq!(doc["error"], "Property 'msgId' missing or of wrong type");
    }

    #[test]
    fn every_response_carries_fresh_msg_id_and_correl_id() {
        let mut dev = device(DeviceKind::Hopper);
        let a = handle_ok(&mut dev, r#"{"cmd":"test","msgId":"X"}"#);
        let b = handle_ok(&mut dev, r#"{"cmd":"test","msgId":"X"}"#);

        assert_eq!(a["correlId"], "X");
        assert_eq!(b["correlId"], "X");
        assert_ne!(a["msgId"], b["msgId"]);

        let id = a["msgId"].as_str().unwrap();
        assert_eq!(id, id.to_lowercase());
    }
}
