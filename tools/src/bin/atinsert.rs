//! # atinsert
//!
//! Post AT commands through a running attomqtt and print the results.
//!
//! Each ATCMD argument is published to `<prefix>/raw/send`; the tool
//! then waits on `<prefix>/raw/at` for exchanges whose first field
//! echoes the command and prints the full tab-joined line. With `-x`
//! a non-`OK` terminator turns into exit code 1; given twice, later
//! commands are only sent once their predecessor succeeded.

use std::time::Duration;

use clap::Parser;

use netmqtt::config::{self, FileConfig};
use netmqtt::Broker;
use netmqtt_tools::echo::{matches_echo, response_ok};
use tracing::warn;

/// Insert an AT command and wait for its result via the attomqtt muxer.
#[derive(Parser)]
#[command(name = "atinsert", version, disable_help_flag = true)]
struct Cli {
    /// Print help.
    #[arg(long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// MQTT host[:port].
    #[arg(short = 'h', long = "host")]
    host: Option<String>,

    /// Topic prefix; commands go to <prefix>/raw/send.
    #[arg(short = 't', long = "topic", conflicts_with = "iface")]
    topic: Option<String>,

    /// Network device; shorthand for -t net/<iface>.
    #[arg(short = 'i', long = "iface")]
    iface: Option<String>,

    /// Exit with failure on an unsuccessful command; twice to stop at
    /// the first failure.
    #[arg(short = 'x', long = "exitonfailure", action = clap::ArgAction::Count)]
    exit_on_failure: u8,

    /// Abort after this many seconds.
    #[arg(short = 'w', long = "wait", default_value_t = 5)]
    wait: u64,

    /// Commands to send to the modem.
    #[arg(required = true)]
    atcmds: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let file = FileConfig::load();

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| file.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut broker_cfg = file.broker.clone();
    if let Some(host) = &cli.host {
        broker_cfg.set_host(host);
    }

    let base = match (&cli.topic, &cli.iface) {
        (Some(topic), _) => topic.clone(),
        (None, Some(iface)) => format!("net/{iface}"),
        (None, None) => "net/ppp0".to_string(),
    };
    let prefix = config::normalize_prefix(&base);

    let broker = Broker::connect("atinsert", &broker_cfg, prefix);

    let code = match tokio::time::timeout(
        Duration::from_secs(cli.wait),
        run(broker, &cli.atcmds, cli.exit_on_failure),
    )
    .await
    {
        Ok(code) => code,
        Err(_elapsed) => {
            warn!("timed out");
            1
        }
    };
    std::process::exit(code);
}

/// Publish the commands, collect their echoes in order, and return the
/// process exit code.
async fn run(mut broker: Broker, cmds: &[String], exit_on_failure: u8) -> i32 {
    if let Err(e) = broker.subscribe("raw/at").await {
        eprintln!("atinsert: subscribe: {e}");
        return 1;
    }

    // Under -xx commands are pipelined one at a time; otherwise they
    // all go out up front and the echoes are matched in order.
    let upfront = if exit_on_failure > 1 { 1 } else { cmds.len() };
    for cmd in &cmds[..upfront] {
        if let Err(e) = broker.publish_event("raw/send", cmd).await {
            eprintln!("atinsert: publish: {e}");
            return 1;
        }
    }

    let mut index = 0;
    let mut failed = false;
    loop {
        let msg = match broker.poll().await {
            Ok(Some(msg)) => msg,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("atinsert: broker: {e}");
                return 1;
            }
        };
        if msg.retained || !matches_echo(&cmds[index], &msg.payload) {
            continue;
        }

        println!("{}", msg.payload);

        if exit_on_failure > 0 && !response_ok(&msg.payload) {
            failed = true;
            if exit_on_failure > 1 {
                return 1;
            }
        }

        index += 1;
        if index >= cmds.len() {
            return i32::from(failed);
        }
        if exit_on_failure > 1 {
            if let Err(e) = broker.publish_event("raw/send", &cmds[index]).await {
                eprintln!("atinsert: publish: {e}");
                return 1;
            }
        }
    }
}
