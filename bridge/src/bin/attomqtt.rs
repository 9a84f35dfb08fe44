//! # attomqtt
//!
//! Control a cellular modem through AT commands, bridged to MQTT.
//!
//! The daemon owns one serial tty, publishes modem state (signal,
//! registration, identity, SIM, operators) as retained topics under a
//! per-device prefix, and accepts raw AT commands and scan requests
//! back from the broker. See the library crate for the engine itself.

use clap::Parser;

use netmqtt::at::AtEngine;
use netmqtt::config::{self, AtOptions, FileConfig};
use netmqtt::serial::SerialPort;
use netmqtt::Broker;
use tracing::{error, info};

/// Control a modem using AT commands via MQTT.
#[derive(Parser)]
#[command(name = "attomqtt", version, disable_help_flag = true)]
struct Cli {
    /// Print help.
    #[arg(long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// MQTT host[:port].
    #[arg(short = 'h', long = "host")]
    host: Option<String>,

    /// MQTT topic prefix (default: last component of the tty path).
    #[arg(short = 'p', long = "prefix")]
    prefix: Option<String>,

    /// Tune options: csq[=secs], creg[=secs], cgreg[=secs],
    /// cops[=secs], cnti[=secs], autocsq, simcom, detachedscan, ceer.
    /// Prefix with no- to turn off.
    #[arg(short = 'o', long = "options")]
    options: Vec<String>,

    /// Be more verbose (repeatable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// TTY device for the modem.
    tty: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let file = FileConfig::load();

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| config::log_filter(&file.logging.level, cli.verbose));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut broker_cfg = file.broker.clone();
    if let Some(host) = &cli.host {
        broker_cfg.set_host(host);
    }

    let mut opts = AtOptions::default();
    for arg in &cli.options {
        if let Err(e) = opts.parse(arg) {
            eprintln!("attomqtt: {e}");
            std::process::exit(1);
        }
    }

    let prefix = cli
        .prefix
        .as_deref()
        .map(config::normalize_prefix)
        .unwrap_or_else(|| config::tty_prefix(&cli.tty));
    info!("mqtt prefix {prefix}");

    let port = match SerialPort::open(&cli.tty) {
        Ok(port) => port,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let broker = Broker::connect("attomqtt", &broker_cfg, prefix);

    match AtEngine::new(port, broker, opts).run().await {
        Ok(()) => {}
        Err(e) => {
            error!("fatal: {e}");
            std::process::exit(1);
        }
    }
}
