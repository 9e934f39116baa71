//! The daemon context and its cooperative event loop.
//!
//! One thread owns all hardware access and multiplexes three sources: the
//! 1 s poll tick, the 500 ms shutdown tick, and bus ingress. The vendor
//! requires a 300 ms recovery gap before each hardware operation batch,
//! honored before polls and before dispatching bus commands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{tick, Receiver};
use crossbeam::select;
use parking_lot::Mutex;
use serde_json::json;

use crate::bus::{self, Bus, BusMessage};
use crate::device::{Device, DeviceKind};
use crate::error::Result;
use crate::protocol::catalog::Route;
use crate::protocol::channel::SspChannel;
use crate::protocol::CURRENCY;
use crate::transport::TtyLink;
use crate::{events, handler};

/// Recovery gap the peripherals need between operation batches.
const HARDWARE_GAP: Duration = Duration::from_millis(300);
const POLL_PERIOD: Duration = Duration::from_secs(1);
const SHUTDOWN_PERIOD: Duration = Duration::from_millis(500);

/// Note routing applied to the validator at startup: small denominations
/// to the cashbox, the rest to the payout store (amounts in euro-cent).
const STARTUP_ROUTES: [(u32, Route); 7] = [
    (500, Route::Cashbox),
    (1_000, Route::Cashbox),
    (2_000, Route::Cashbox),
    (5_000, Route::Storage),
    (10_000, Route::Storage),
    (20_000, Route::Storage),
    (50_000, Route::Storage),
];

/// Startup parameters, straight from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub device: String,
    pub accept_coins: bool,
}

/// The daemon: bus handles, both device sessions and the shutdown flag,
/// all owned by the loop thread.
pub struct Daemon {
    config: Config,
    bus: Bus,
    ingress: Receiver<BusMessage>,
    subscriber: Option<JoinHandle<()>>,
    hopper: Device<TtyLink>,
    validator: Device<TtyLink>,
    shutdown: Arc<AtomicBool>,
    quit: bool,
}

impl Daemon {
    /// Connects the bus, opens the serial line and builds both device
    /// sessions. Any failure here is fatal; the process exits non-zero.
    pub fn start(config: Config, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let bus = Bus::connect(&config.host, config.port)?;
        let (ingress, subscriber) =
            bus::spawn_subscriber(&config.host, config.port, Arc::clone(&shutdown))?;

        let link = TtyLink::open(&config.device)?;
        log::info!("serial line {} open", config.device);

        let channel = Arc::new(Mutex::new(SspChannel::new(link)));
        let hopper = Device::new(DeviceKind::Hopper, Arc::clone(&channel));
        let validator = Device::new(DeviceKind::Validator, channel);

        Ok(Self {
            config,
            bus,
            ingress,
            subscriber: Some(subscriber),
            hopper,
            validator,
            shutdown,
            quit: false,
        })
    }

    /// Initializes the peripherals and runs the loop until a termination
    /// signal or a `quit` command arrives.
    pub fn run(&mut self) -> Result<()> {
        self.setup_devices()?;

        self.bus.publish(bus::PAYOUT_EVENT, &json!({ "event": "started" }))?;

        let poll_tick = tick(POLL_PERIOD);
        let shutdown_tick = tick(SHUTDOWN_PERIOD);
        let ingress = self.ingress.clone();

        loop {
            select! {
                recv(poll_tick) -> _ => {
                    self.poll_device(DeviceKind::Hopper)?;
                    self.poll_device(DeviceKind::Validator)?;
                }
                recv(shutdown_tick) -> _ => {
                    if self.quit || self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                }
                recv(ingress) -> msg => {
                    match msg {
                        Ok(msg) => self.dispatch(msg)?,
                        Err(_) => {
                            log::error!("bus subscriber hung up");
                            break;
                        }
                    }
                }
            }
        }

        self.bus.publish(bus::PAYOUT_EVENT, &json!({ "event": "exiting" }))?;

        // Stop the subscriber thread before the connections drop.
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.subscriber.take() {
            let _ = handle.join();
        }

        log::info!("daemon stopped");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Startup hardware configuration
    // -----------------------------------------------------------------

    fn setup_devices(&mut self) -> Result<()> {
        let accept_coins = self.config.accept_coins;

        if let Err(err) = Self::bring_up(&mut self.validator, |dev| {
            for (amount, route) in STARTUP_ROUTES {
                dev.set_route(amount, CURRENCY, route)?;
            }
            if let Err(err) = dev.set_refill_mode() {
                log::warn!("validator: refill mode rejected: {err}");
            }
            // Note acceptance starts fully inhibited until a bus command
            // opens channels.
            dev.set_inhibits(0x00, 0x00)
        }) {
            if err.is_fatal() {
                return Err(err);
            }
            log::error!("validator unavailable: {err}");
        }

        if let Err(err) = Self::bring_up(&mut self.hopper, |dev| {
            let channels = dev
                .setup
                .as_ref()
                .map(|setup| setup.channels.clone())
                .unwrap_or_default();
            for def in channels {
                dev.set_coin_inhibit(def.value as u16, &def.currency, accept_coins)?;
            }
            Ok(())
        }) {
            if err.is_fatal() {
                return Err(err);
            }
            log::error!("hopper unavailable: {err}");
        }

        Ok(())
    }

    fn bring_up<F>(dev: &mut Device<TtyLink>, configure: F) -> Result<()>
    where
        F: FnOnce(&mut Device<TtyLink>) -> Result<()>,
    {
        dev.initialize()?;
        configure(dev)?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Loop bodies
    // -----------------------------------------------------------------

    fn poll_device(&mut self, kind: DeviceKind) -> Result<()> {
        let docs = {
            let dev = self.device_mut(kind);
            if !dev.available {
                return Ok(());
            }

            std::thread::sleep(HARDWARE_GAP);
            match dev.poll() {
                Ok(events) if events.is_empty() => return Ok(()),
                Ok(events) => events::translate_poll(dev, &events),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    log::warn!("{} poll failed: {err}", kind.label());
                    return Ok(());
                }
            }
        };

        for doc in docs {
            self.bus.publish(kind.event_topic(), &doc)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, msg: BusMessage) -> Result<()> {
        let kind = match msg.topic.as_str() {
            bus::HOPPER_REQUEST => DeviceKind::Hopper,
            bus::VALIDATOR_REQUEST => DeviceKind::Validator,
            bus::METACASH => {
                // Reserved topic with no defined behavior.
                log::debug!("metacash message ignored: {}", msg.payload);
                return Ok(());
            }
            other => {
                log::warn!("message on unexpected topic {other}");
                return Ok(());
            }
        };

        std::thread::sleep(HARDWARE_GAP);

        let reply = {
            let dev = self.device_mut(kind);
            let available = dev.available;
            handler::handle(dev, available, &msg.payload)?
        };

        self.bus.publish(kind.response_topic(), &reply.doc)?;

        if reply.quit {
            log::info!("quit command received");
            self.quit = true;
        }
        Ok(())
    }

    fn device_mut(&mut self, kind: DeviceKind) -> &mut Device<TtyLink> {
        match kind {
            DeviceKind::Hopper => &mut self.hopper,
            DeviceKind::Validator => &mut self.validator,
        }
    }
}
