//! Configuration loading and CLI option parsing.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command-line flags** — `-h host[:port]`, `-p prefix`, `-o opt,opt…`
//! 2. **Config file** — `netmqtt.toml` in CWD, if present
//! 3. **Compiled defaults** — see each field below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [broker]
//! host = "localhost"
//! port = 1883
//! keepalive_secs = 10
//!
//! [logging]
//! level = "warn"
//! ```
//!
//! Sub-options given with `-o` follow the original daemon's vocabulary:
//! `csq[=secs]`, `creg[=secs]`, `cgreg[=secs]`, `cops[=secs]`,
//! `cnti[=secs]`, `autocsq`, `simcom`, `detachedscan`, `ceer`. Every
//! option accepts a `no-` prefix to turn it off, which for the quirk
//! flags also pins them against brand/model auto-detection.

use serde::Deserialize;
use std::path::Path;

/// Top-level file configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Broker hostname (default `localhost`).
    #[serde(default = "default_host")]
    pub host: String,
    /// Broker TCP port (default 1883).
    #[serde(default = "default_port")]
    pub port: u16,
    /// MQTT keepalive interval in seconds (default 10).
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    /// QoS for every publish/subscribe. `None` picks 0 for localhost
    /// brokers and 1 otherwise, like the original daemons.
    #[serde(default)]
    pub qos: Option<u8>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `warn`). Overridden by `RUST_LOG`
    /// or by `-v` flags.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    1883
}
fn default_keepalive() -> u64 {
    10
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            keepalive_secs: default_keepalive(),
            qos: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl FileConfig {
    /// Load `netmqtt.toml` from the current directory, falling back to
    /// compiled defaults when absent.
    pub fn load() -> Self {
        if Path::new("netmqtt.toml").exists() {
            let content =
                std::fs::read_to_string("netmqtt.toml").expect("Failed to read netmqtt.toml");
            toml::from_str(&content).expect("Failed to parse netmqtt.toml")
        } else {
            Self::default()
        }
    }
}

impl BrokerConfig {
    /// Apply a `-h host[:port]` override. A trailing `:port` is split
    /// off for `host:1884` and `[::1]:1884` forms; a bare IPv6 address
    /// is left intact.
    pub fn set_host(&mut self, arg: &str) {
        if let Some(idx) = arg.rfind(':') {
            let bracketed = idx > 0 && arg.as_bytes()[idx - 1] == b']';
            let single_colon = !arg[..idx].contains(':');
            if bracketed || single_colon {
                if let Ok(port) = arg[idx + 1..].parse::<u16>() {
                    self.host = arg[..idx].to_string();
                    self.port = port;
                    return;
                }
            }
        }
        self.host = arg.to_string();
    }

    /// Effective QoS: explicit setting, or 0 for localhost / 1 otherwise.
    pub fn effective_qos(&self) -> u8 {
        self.qos
            .unwrap_or(u8::from(self.host != "localhost"))
            .min(2)
    }
}

/// Resolve the tracing filter from the file level and `-v` count.
pub fn log_filter(file_level: &str, verbose: u8) -> String {
    match verbose {
        0 => file_level.to_string(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Normalize a topic prefix to end with exactly one `/`.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    format!("{trimmed}/")
}

/// Default modem prefix: last component of the TTY path.
pub fn tty_prefix(tty: &str) -> String {
    let base = tty.rsplit('/').next().unwrap_or(tty);
    format!("{base}/")
}

/// A periodic poll that can be switched on with an optional interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poll {
    pub enabled: bool,
    pub secs: u64,
}

impl Poll {
    const fn off(secs: u64) -> Self {
        Self {
            enabled: false,
            secs,
        }
    }
}

/// Modem daemon sub-options (`-o`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtOptions {
    /// Periodic `AT+CSQ` signal poll.
    pub csq: Poll,
    /// Periodic `AT+CREG?` registration poll.
    pub creg: Poll,
    /// Periodic `AT+CGREG?` packet-registration poll.
    pub cgreg: Poll,
    /// Periodic `AT+COPS?` current-operator poll.
    pub cops: Poll,
    /// Periodic `AT*CNTI=0` technology poll.
    pub cnti: Poll,
    /// Ask the modem for unsolicited `+CSQ` reports at bootstrap.
    pub autocsq: bool,
    /// SIMCOM quirk override; `None` means auto-detect from brand.
    pub simcom: Option<bool>,
    /// Detached-scan quirk override; `None` means auto-detect from model.
    pub detached_scan: Option<bool>,
    /// Request `AT+CEER` diagnostics after device-level errors.
    pub ceer: bool,
}

impl Default for AtOptions {
    fn default() -> Self {
        Self {
            csq: Poll::off(10),
            creg: Poll::off(10),
            cgreg: Poll::off(10),
            cops: Poll::off(300),
            cnti: Poll::off(10),
            autocsq: false,
            simcom: None,
            detached_scan: None,
            ceer: false,
        }
    }
}

impl AtOptions {
    /// Parse one `-o` argument (comma-separated sub-options).
    pub fn parse(&mut self, arg: &str) -> Result<(), String> {
        for raw in arg.split(',').filter(|s| !s.is_empty()) {
            let (name, on) = match raw.strip_prefix("no-") {
                Some(rest) => (rest, false),
                None => (raw, true),
            };
            let (name, value) = match name.split_once('=') {
                Some((n, v)) => (n, Some(v)),
                None => (name, None),
            };
            let secs = match value {
                Some(v) => Some(
                    v.parse::<u64>()
                        .map_err(|_| format!("option '{raw}': bad interval '{v}'"))?,
                ),
                None => None,
            };
            let poll = |p: &mut Poll| {
                p.enabled = on;
                if let Some(s) = secs {
                    p.secs = s;
                }
            };
            match name {
                "csq" => poll(&mut self.csq),
                "creg" => poll(&mut self.creg),
                "cgreg" => poll(&mut self.cgreg),
                "cops" => poll(&mut self.cops),
                "cnti" => poll(&mut self.cnti),
                "autocsq" => self.autocsq = on,
                "simcom" => self.simcom = Some(on),
                "detachedscan" => self.detached_scan = Some(on),
                "ceer" => self.ceer = on,
                _ => return Err(format!("option '{raw}' unknown")),
            }
        }
        Ok(())
    }
}

/// Wi-Fi daemon sub-options (`-S`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WpaOptions {
    /// Disable background scanning on networks created for AP/mesh use
    /// (buffers `bgscan ""` into new AP/mesh networks).
    pub no_ap_bgscan: bool,
}

impl WpaOptions {
    /// Parse one `-S` argument (comma-separated sub-options).
    pub fn parse(&mut self, arg: &str) -> Result<(), String> {
        for raw in arg.split(',').filter(|s| !s.is_empty()) {
            match raw {
                "no-ap-bgscan" => self.no_ap_bgscan = true,
                "ap-bgscan" => self.no_ap_bgscan = false,
                _ => return Err(format!("option '{raw}' unknown")),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_host_plain() {
        let mut b = BrokerConfig::default();
        b.set_host("broker.lan");
        assert_eq!(b.host, "broker.lan");
        assert_eq!(b.port, 1883);
    }

    #[test]
    fn test_set_host_with_port() {
        let mut b = BrokerConfig::default();
        b.set_host("broker.lan:8883");
        assert_eq!(b.host, "broker.lan");
        assert_eq!(b.port, 8883);
    }

    #[test]
    fn test_set_host_ipv6_bracketed() {
        let mut b = BrokerConfig::default();
        b.set_host("[::1]:1884");
        assert_eq!(b.host, "[::1]");
        assert_eq!(b.port, 1884);
    }

    #[test]
    fn test_set_host_ipv6_bare() {
        let mut b = BrokerConfig::default();
        b.set_host("fe80::1");
        assert_eq!(b.host, "fe80::1");
        assert_eq!(b.port, 1883);
    }

    #[test]
    fn test_qos_defaults() {
        let b = BrokerConfig::default();
        assert_eq!(b.effective_qos(), 0);
        let mut remote = BrokerConfig::default();
        remote.set_host("broker.lan");
        assert_eq!(remote.effective_qos(), 1);
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("net/wlan0"), "net/wlan0/");
        assert_eq!(normalize_prefix("net/wlan0/"), "net/wlan0/");
    }

    #[test]
    fn test_tty_prefix() {
        assert_eq!(tty_prefix("/dev/ttyUSB2"), "ttyUSB2/");
        assert_eq!(tty_prefix("ttyACM0"), "ttyACM0/");
    }

    #[test]
    fn test_at_options_poll_with_interval() {
        let mut o = AtOptions::default();
        o.parse("csq=30,creg").unwrap();
        assert_eq!(
            o.csq,
            Poll {
                enabled: true,
                secs: 30
            }
        );
        assert_eq!(
            o.creg,
            Poll {
                enabled: true,
                secs: 10
            }
        );
        assert!(!o.cgreg.enabled);
    }

    #[test]
    fn test_at_options_negation() {
        let mut o = AtOptions::default();
        o.parse("csq,no-csq").unwrap();
        assert!(!o.csq.enabled);
    }

    #[test]
    fn test_at_options_quirk_override() {
        let mut o = AtOptions::default();
        assert_eq!(o.simcom, None);
        o.parse("no-simcom,detachedscan").unwrap();
        assert_eq!(o.simcom, Some(false));
        assert_eq!(o.detached_scan, Some(true));
    }

    #[test]
    fn test_at_options_unknown() {
        let mut o = AtOptions::default();
        assert!(o.parse("frobnicate").is_err());
    }

    #[test]
    fn test_wpa_options() {
        let mut o = WpaOptions::default();
        o.parse("no-ap-bgscan").unwrap();
        assert!(o.no_ap_bgscan);
    }

    #[test]
    fn test_log_filter() {
        assert_eq!(log_filter("warn", 0), "warn");
        assert_eq!(log_filter("warn", 1), "info");
        assert_eq!(log_filter("warn", 3), "trace");
    }
}
