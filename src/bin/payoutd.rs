use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;

use payoutd::daemon::{Config, Daemon};

/// Bridge daemon between the Redis message bus and SSP cash peripherals.
#[derive(Parser, Debug)]
#[command(name = "payoutd", version, disable_help_flag = true)]
struct Args {
    /// Message bus host.
    #[arg(short = 'h', long = "host", default_value = "127.0.0.1")]
    host: String,

    /// Message bus port.
    #[arg(short = 'p', long = "port", default_value_t = 6379)]
    port: u16,

    /// Serial device the peripherals are attached to.
    #[arg(short = 'd', long = "device", default_value = "/dev/ttyACM0")]
    device: String,

    /// Permit coin acceptance during setup; coins stay inhibited otherwise.
    #[arg(short = 'c', long = "accept-coins")]
    accept_coins: bool,

    /// Also write diagnostic (debug-level) log to standard error.
    #[arg(short = 'e', long = "debug-log")]
    debug_log: bool,

    #[arg(long, action = clap::ArgAction::HelpLong)]
    help: Option<bool>,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            // Help and version are clean exits; anything else is CLI misuse.
            return ExitCode::from(u8::from(err.use_stderr()));
        }
    };

    let default_filter = if args.debug_log { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            log::error!("failed to register signal handler: {err}");
            return ExitCode::from(1);
        }
    }

    let config = Config {
        host: args.host,
        port: args.port,
        device: args.device,
        accept_coins: args.accept_coins,
    };

    let mut daemon = match Daemon::start(config, shutdown) {
        Ok(daemon) => daemon,
        Err(err) => {
            log::error!("startup failed: {err}");
            return ExitCode::from(1);
        }
    };

    match daemon.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("daemon failed: {err}");
            ExitCode::from(1)
        }
    }
}
