#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! netmqtt library — the per-device protocol multiplexer behind the
//! `attomqtt` and `wifitomqtt` daemons.
//!
//! One instance owns one device endpoint (a serial AT port or a
//! wpa_supplicant control socket) and bridges it to an MQTT topic
//! namespace: live status as retained values, one-shot requests and raw
//! command injection as plain messages. Everything runs on a single
//! cooperative event loop; outbound commands go through a FIFO with
//! per-command timeouts, inbound bytes are parsed into frames that are
//! either command responses or unsolicited events.
//!
//! - `broker` — MQTT client wrapper, property cache, self-sync shutdown
//! - `config` — CLI flags + optional TOML file
//! - `timer` — deadline scheduling for the event loop
//! - `queue` — outbound command FIFO
//! - `serial` — raw non-blocking tty plumbing
//! - `at` — AT dialect engine (modems)
//! - `wpa` — wpa_supplicant dialect engine (Wi-Fi)

pub mod at;
pub mod broker;
pub mod config;
pub mod queue;
pub mod serial;
pub mod timer;
pub mod wpa;

pub use broker::Broker;
pub use config::BrokerConfig;

/// Errors that end a daemon. Everything recoverable is handled in place;
/// whatever reaches `main` through this type exits with status 1.
#[derive(Debug)]
pub enum Error {
    /// Low-level I/O on the device or signal descriptors.
    Io(std::io::Error),
    /// The broker rejected a publish/subscribe request.
    Broker(rumqttc::ClientError),
    /// The broker connection failed or was lost.
    Connection(rumqttc::ConnectionError),
    /// The device closed its end (serial EOF, supplicant socket gone).
    DeviceClosed,
    /// Too many consecutive command timeouts — the device is unresponsive.
    Unresponsive,
    /// A single input line outgrew the parser buffer.
    ParserOverflow,
    /// Anything device-specific that cannot be retried.
    Device(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Broker(e) => write!(f, "broker request failed: {e}"),
            Error::Connection(e) => write!(f, "broker connection lost: {e}"),
            Error::DeviceClosed => write!(f, "device closed"),
            Error::Unresponsive => write!(f, "device unresponsive (command timeouts)"),
            Error::ParserOverflow => write!(f, "input line exceeds parser buffer"),
            Error::Device(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<rumqttc::ClientError> for Error {
    fn from(e: rumqttc::ClientError) -> Self {
        Error::Broker(e)
    }
}

impl From<rumqttc::ConnectionError> for Error {
    fn from(e: rumqttc::ConnectionError) -> Self {
        Error::Connection(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Io(e.into())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
