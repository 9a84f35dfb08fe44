//! # wifitomqtt
//!
//! Control wpa_supplicant through its control socket, bridged to MQTT.
//!
//! The daemon owns one control socket, mirrors scan results and the
//! connection state as retained topics under `net/<iface>/`, and turns
//! broker messages into network configuration commands. See the
//! library crate for the engine itself.

use clap::Parser;

use netmqtt::config::{self, FileConfig, WpaOptions};
use netmqtt::wpa::socket::WpaSocket;
use netmqtt::wpa::WpaEngine;
use netmqtt::Broker;
use tracing::error;

/// Control wpa_supplicant via MQTT.
#[derive(Parser)]
#[command(name = "wifitomqtt", version, disable_help_flag = true)]
struct Cli {
    /// Print help.
    #[arg(long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// MQTT host[:port].
    #[arg(short = 'h', long = "host")]
    host: Option<String>,

    /// Wireless interface to control.
    #[arg(short = 'i', long = "iface", default_value = "wlan0")]
    iface: String,

    /// Tune options: no-ap-bgscan.
    #[arg(short = 'S', long = "suppress")]
    suppress: Vec<String>,

    /// Be more verbose (repeatable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
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

    let mut opts = WpaOptions::default();
    for arg in &cli.suppress {
        if let Err(e) = opts.parse(arg) {
            eprintln!("wifitomqtt: {e}");
            std::process::exit(1);
        }
    }

    let sock = match WpaSocket::connect(&cli.iface) {
        Ok(sock) => sock,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let prefix = format!("net/{}/", cli.iface);
    let broker = Broker::connect("wifitomqtt", &broker_cfg, prefix);

    match WpaEngine::new(sock, broker, opts).run().await {
        Ok(()) => {}
        Err(e) => {
            error!("fatal: {e}");
            std::process::exit(1);
        }
    }
}
