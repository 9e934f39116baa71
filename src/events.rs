//! Translation of SSP poll events into the JSON documents published on the
//! device event topics.
//!
//! Every poll event maps to exactly one document, in device order. Two
//! events additionally trigger hardware follow-ups: a unit reset demands a
//! fresh HOST_PROTOCOL negotiation before any other command reaches the
//! device, and a recalibration request is answered with RUN_CALIBRATION.

use serde_json::{json, Value};

use crate::device::{Device, DeviceKind};
use crate::protocol::poll::{calibration, event, PollEvent};
use crate::transport::SerialLink;

/// Translates one poll cycle's events, running follow-ups inline so they
/// hit the line before any later command.
pub fn translate_poll<L: SerialLink>(dev: &mut Device<L>, events: &[PollEvent]) -> Vec<Value> {
    let mut docs = Vec::with_capacity(events.len());

    for ev in events {
        match ev.code {
            event::SLAVE_RESET => {
                docs.push(json!({ "event": "unit reset" }));
                if let Err(err) = dev.recover_after_reset() {
                    log::error!("{}: reset recovery failed: {err}", dev.label());
                }
            }
            event::CALIBRATION_FAIL if ev.data1 as u8 == calibration::COMMAND_RECAL => {
                docs.push(json!({ "event": "recalibrating" }));
                if let Err(err) = dev.run_calibration() {
                    log::error!("{}: run calibration failed: {err}", dev.label());
                }
            }
            _ => docs.push(translate(dev, ev)),
        }
    }

    docs
}

fn translate<L: SerialLink>(dev: &Device<L>, ev: &PollEvent) -> Value {
    match dev.kind() {
        DeviceKind::Hopper => hopper_event(ev),
        DeviceKind::Validator => validator_event(dev, ev),
    }
}

fn hopper_event(ev: &PollEvent) -> Value {
    match ev.code {
        event::NOTE_READ if ev.data1 == 0 => json!({ "event": "reading" }),
        event::NOTE_READ => json!({ "event": "read", "channel": ev.data1 }),
        event::NOTE_CREDIT => {
            json!({ "event": "credit", "channel": ev.data1, "cc": ev.currency })
        }
        event::DISPENSING => json!({ "event": "dispensing", "amount": ev.data1 }),
        event::DISPENSED => json!({ "event": "dispensed", "amount": ev.data1 }),
        event::COIN_CREDIT => {
            json!({ "event": "coin credit", "amount": ev.data1, "cc": ev.currency })
        }
        event::FLOATING => json!({ "event": "floating", "amount": ev.data1, "cc": ev.currency }),
        event::FLOATED => json!({ "event": "floated", "amount": ev.data1, "cc": ev.currency }),
        event::CASHBOX_PAID => {
            json!({ "event": "cashbox paid", "amount": ev.data1, "cc": ev.currency })
        }
        event::SMART_EMPTYING => {
            json!({ "event": "smart emptying", "amount": ev.data1, "cc": ev.currency })
        }
        event::SMART_EMPTIED => {
            json!({ "event": "smart emptied", "amount": ev.data1, "cc": ev.currency })
        }
        event::EMPTYING => json!({ "event": "emptying" }),
        event::EMPTIED => json!({ "event": "emptied" }),
        event::JAMMED => json!({ "event": "jammed" }),
        event::HALTED => json!({ "event": "halted" }),
        event::TIME_OUT => json!({ "event": "timeout" }),
        event::DISABLED => json!({ "event": "disabled" }),
        event::COIN_MECH_JAMMED => json!({ "event": "coin mech jammed" }),
        event::COIN_MECH_RETURN_PRESSED => json!({ "event": "coin mech return pressed" }),
        event::INCOMPLETE_PAYOUT => json!({
            "event": "incomplete payout",
            "dispensed": ev.data1,
            "requested": ev.data2,
            "cc": ev.currency,
        }),
        event::INCOMPLETE_FLOAT => json!({
            "event": "incomplete float",
            "dispensed": ev.data1,
            "requested": ev.data2,
            "cc": ev.currency,
        }),
        event::FRAUD_ATTEMPT => json!({ "event": "fraud attempt" }),
        event::CALIBRATION_FAIL => json!({
            "event": "calibration fail",
            "error": calibration_error(ev.data1 as u8),
        }),
        code => unknown_event(code),
    }
}

fn validator_event<L: SerialLink>(dev: &Device<L>, ev: &PollEvent) -> Value {
    match ev.code {
        event::NOTE_READ if ev.data1 == 0 => json!({ "event": "reading" }),
        event::NOTE_READ => json!({
            "event": "read",
            "amount": euro_cent(dev, ev.data1),
            "channel": ev.data1,
        }),
        event::NOTE_CREDIT => json!({
            "event": "credit",
            "amount": euro_cent(dev, ev.data1),
            "channel": ev.data1,
        }),
        event::NOTE_STACKING => json!({ "event": "stacking" }),
        event::NOTE_STACKED => json!({ "event": "stacked" }),
        event::NOTE_STORED => json!({ "event": "stored" }),
        event::NOTE_REJECTING => json!({ "event": "rejecting" }),
        event::NOTE_REJECTED => json!({ "event": "rejected" }),
        event::NOTE_HELD_IN_BEZEL => json!({ "event": "note held in bezel" }),
        event::SAFE_JAM => json!({ "event": "safe jam" }),
        event::UNSAFE_JAM => json!({ "event": "unsafe jam" }),
        event::STACKER_FULL => json!({ "event": "stacker full" }),
        event::CASHBOX_REMOVED => json!({ "event": "cashbox removed" }),
        event::CASHBOX_REPLACED => json!({ "event": "cashbox replaced" }),
        event::NOTE_CLEARED_FROM_FRONT => json!({ "event": "cleared from front" }),
        event::NOTE_CLEARED_INTO_CASHBOX => json!({ "event": "cleared into cashbox" }),
        event::EMPTYING => json!({ "event": "emptying" }),
        event::EMPTIED => json!({ "event": "emptied" }),
        event::SMART_EMPTYING => json!({ "event": "smart emptying" }),
        event::SMART_EMPTIED => json!({ "event": "smart emptied" }),
        event::JAMMED => json!({ "event": "jammed" }),
        event::DISABLED => json!({ "event": "disabled" }),
        event::INCOMPLETE_PAYOUT => json!({
            "event": "incomplete payout",
            "dispensed": ev.data1,
            "requested": ev.data2,
            "cc": ev.currency,
        }),
        event::INCOMPLETE_FLOAT => json!({
            "event": "incomplete float",
            "dispensed": ev.data1,
            "requested": ev.data2,
            "cc": ev.currency,
        }),
        event::FRAUD_ATTEMPT => json!({ "event": "fraud attempt", "dispensed": ev.data1 }),
        event::CALIBRATION_FAIL => json!({
            "event": "calibration fail",
            "error": calibration_error(ev.data1 as u8),
        }),
        code => unknown_event(code),
    }
}

// The validator dataset reports channel face values in whole euro; events
// carry euro-cent.
fn euro_cent<L: SerialLink>(dev: &Device<L>, channel: u32) -> u32 {
    dev.channel_value(channel as u8).unwrap_or(0) * 100
}

fn unknown_event(code: u8) -> Value {
    json!({ "event": "unknown", "id": format!("{code:#04x}") })
}

fn calibration_error(sub: u8) -> &'static str {
    match sub {
        calibration::NO_ERROR => "no error",
        calibration::SENSOR_FLAP => "sensor flap",
        calibration::SENSOR_EXIT => "sensor exit",
        calibration::SENSOR_COIL_1 => "sensor coil 1",
        calibration::SENSOR_COIL_2 => "sensor coil 2",
        calibration::NOT_INITIALISED => "not initialized",
        calibration::CHECKSUM_ERROR => "checksum error",
        _ => "unknown",
    }
}
