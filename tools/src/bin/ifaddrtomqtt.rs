//! # ifaddrtomqtt
//!
//! Publish interface addresses to MQTT.
//!
//! Every second the interface table is enumerated and each interface's
//! non-link-local addresses are published space-joined and retained on
//! `net/<ifname>/addr`. Interfaces that lose their last address get
//! their topic cleared. On termination everything published is cleared
//! and flushed through the self-sync protocol.

use std::collections::BTreeSet;
use std::time::Duration;

use clap::Parser;

use netmqtt::config::FileConfig;
use netmqtt::Broker;
use netmqtt_tools::addrs::compose;
use tracing::{error, info};

/// Emit interface addresses to MQTT.
#[derive(Parser)]
#[command(name = "ifaddrtomqtt", version, disable_help_flag = true)]
struct Cli {
    /// Print help.
    #[arg(long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// MQTT host[:port].
    #[arg(short = 'h', long = "host")]
    host: Option<String>,

    /// Be more verbose (repeatable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Render the current interface table as `(interface, address)` pairs.
fn interface_addresses() -> Vec<(String, String)> {
    let Ok(table) = nix::ifaddrs::getifaddrs() else {
        return Vec::new();
    };
    let mut pairs = Vec::new();
    for entry in table {
        let Some(addr) = entry.address else { continue };
        let text = if let Some(sin) = addr.as_sockaddr_in() {
            sin.ip().to_string()
        } else if let Some(sin6) = addr.as_sockaddr_in6() {
            sin6.ip().to_string()
        } else {
            continue;
        };
        pairs.push((entry.interface_name, text));
    }
    pairs
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let file = FileConfig::load();

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| netmqtt::config::log_filter(&file.logging.level, cli.verbose));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut broker_cfg = file.broker.clone();
    if let Some(host) = &cli.host {
        broker_cfg.set_host(host);
    }

    // topics are absolute (net/<ifname>/addr), so no prefix
    let mut broker = Broker::connect("ifaddrtomqtt", &broker_cfg, String::new());

    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .expect("signal handler");
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("signal handler");
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut published: BTreeSet<String> = BTreeSet::new();

    loop {
        enum Step {
            Tick,
            Broker,
            Shutdown,
        }
        let step = tokio::select! {
            _ = ticker.tick() => Step::Tick,
            res = broker.poll() => {
                if let Err(e) = res {
                    error!("broker: {e}");
                    std::process::exit(1);
                }
                Step::Broker
            }
            _ = sigint.recv() => Step::Shutdown,
            _ = sigterm.recv() => Step::Shutdown,
        };
        match step {
            Step::Tick => {
                let current = compose(interface_addresses());
                // interfaces that lost their last address get cleared
                let gone: Vec<String> = published
                    .iter()
                    .filter(|name| !current.contains_key(*name))
                    .cloned()
                    .collect();
                for name in gone {
                    let topic = format!("net/{name}/addr");
                    if let Err(e) = broker.publish_if_changed(&topic, None).await {
                        error!("publish {topic}: {e}");
                        std::process::exit(1);
                    }
                    published.remove(&name);
                }
                for (name, value) in &current {
                    let topic = format!("net/{name}/addr");
                    if let Err(e) = broker.publish_if_changed(&topic, Some(value)).await {
                        error!("publish {topic}: {e}");
                        std::process::exit(1);
                    }
                    published.insert(name.clone());
                }
            }
            Step::Broker => {}
            Step::Shutdown => break,
        }
    }

    info!("terminating, clearing addr topics");
    if broker.self_sync_shutdown().await.is_err() {
        std::process::exit(1);
    }
}
