//! Redis PUB/SUB plumbing.
//!
//! Publishing and subscribing use separate connections so a slow
//! subscription read can never block an outgoing response or event. The
//! subscriber runs on its own thread and forwards raw messages over a
//! crossbeam channel into the dispatcher loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use serde_json::Value;

use crate::error::Result;

pub const HOPPER_REQUEST: &str = "hopper-request";
pub const HOPPER_RESPONSE: &str = "hopper-response";
pub const HOPPER_EVENT: &str = "hopper-event";
pub const VALIDATOR_REQUEST: &str = "validator-request";
pub const VALIDATOR_RESPONSE: &str = "validator-response";
pub const VALIDATOR_EVENT: &str = "validator-event";
pub const PAYOUT_EVENT: &str = "payout-event";
/// Reserved topic; subscribed but carrying no defined behavior.
pub const METACASH: &str = "metacash";

/// One raw message lifted off a subscribed topic.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

/// Publish-side bus handle.
pub struct Bus {
    con: redis::Connection,
}

impl Bus {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let client = redis::Client::open(format!("redis://{host}:{port}/"))?;
        let con = client.get_connection()?;
        log::debug!("bus connected to {host}:{port}");
        Ok(Self { con })
    }

    /// Publishes one JSON document to `topic`.
    pub fn publish(&mut self, topic: &str, doc: &Value) -> Result<()> {
        log::trace!("publish {topic}: {doc}");
        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(doc.to_string())
            .exec(&mut self.con)?;
        Ok(())
    }
}

/// Spawns the subscriber thread.
///
/// Subscribes to the two request topics plus the reserved `metacash`
/// topic, then pumps messages into the returned channel until `shutdown`
/// is raised or the connection dies. The read timeout keeps the thread
/// responsive to shutdown without busy-waiting.
pub fn spawn_subscriber(
    host: &str,
    port: u16,
    shutdown: Arc<AtomicBool>,
) -> Result<(Receiver<BusMessage>, JoinHandle<()>)> {
    let client = redis::Client::open(format!("redis://{host}:{port}/"))?;
    let mut con = client.get_connection()?;

    let (tx, rx) = unbounded();
    let handle = std::thread::Builder::new()
        .name("bus-subscriber".into())
        .spawn(move || subscriber_loop(&mut con, &tx, &shutdown))?;

    Ok((rx, handle))
}

fn subscriber_loop(
    con: &mut redis::Connection,
    tx: &Sender<BusMessage>,
    shutdown: &AtomicBool,
) {
    let mut pubsub = con.as_pubsub();

    if let Err(err) = pubsub.subscribe(&[HOPPER_REQUEST, VALIDATOR_REQUEST, METACASH]) {
        log::error!("bus subscribe failed: {err}");
        return;
    }
    if let Err(err) = pubsub.set_read_timeout(Some(Duration::from_millis(250))) {
        log::error!("bus read timeout rejected: {err}");
        return;
    }

    while !shutdown.load(Ordering::Relaxed) {
        match pubsub.get_message() {
            Ok(msg) => {
                let topic = msg.get_channel_name().to_string();
                let payload: String = msg.get_payload().unwrap_or_default();
                if tx
                    .send(BusMessage { topic, payload })
                    .is_err()
                {
                    // Dispatcher hung up; we are shutting down.
                    break;
                }
            }
            Err(err) if err.is_timeout() => continue,
            Err(err) => {
                log::error!("bus subscription lost: {err}");
                break;
            }
        }
    }

    log::debug!("bus subscriber stopped");
}
