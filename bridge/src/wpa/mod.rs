//! wpa_supplicant dialect engine: one control socket bridged to the
//! broker.
//!
//! Datagram framing makes the aggregation trivial — every received
//! frame is either an unsolicited event (`<N>` priority tag) or the
//! response to the single outstanding command — but the state kept on
//! top is richer than the modem side: a BSS table reconciled against
//! scan results, a network table with buffered creation, a derived
//! aggregate `wifistate`, and a station counter for AP/mesh roles.
//!
//! Liveness: every 5 s the engine probes the supplicant (`PING`, or
//! `SIGNAL_POLL` when associated as a station, which doubles as the
//! rssi/speed refresh). A command that gets no response within 3 s
//! means the supplicant is gone and the process exits.

pub mod bss;
pub mod network;
pub mod socket;

use std::time::{Duration, Instant};

use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

use crate::broker::{Broker, Incoming};
use crate::config::WpaOptions;
use crate::queue::{CommandClass, CommandQueue};
use crate::serial::{WriteBlockMeter, WriteOutcome};
use crate::timer::TimerWheel;
use crate::{Error, Result};

use bss::{canonical_bssid, format_freq, BssFlags, BssTable};
use network::{derive_wifistate, NetworkMode, NetworkTable, Role};
use socket::WpaSocket;

/// Keepalive probe interval.
const KEEPALIVE: Duration = Duration::from_secs(5);

/// A command unanswered for this long means the supplicant is lost.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Datagram receive buffer (multi-line responses can be large).
const FRAME_BUF: usize = 16 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum WpaTimer {
    CommandTimeout,
    WriteRetry,
    Keepalive,
}

/// Commands whose completion warrants a `SAVE_CONFIG`.
fn is_mutating(text: &str) -> bool {
    text.starts_with("SET_NETWORK ")
        || text.starts_with("ENABLE_NETWORK")
        || text.starts_with("DISABLE_NETWORK")
        || text.starts_with("SELECT_NETWORK")
        || text.starts_with("REMOVE_NETWORK")
        || text.starts_with("ADD_NETWORK")
        || text.starts_with("SET ")
}

/// Split a multi-line payload into `key=value` pairs.
fn kv_pairs(text: &str) -> Vec<(&str, &str)> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .collect()
}

/// Parsed `STATUS` response.
#[derive(Debug, Default, PartialEq, Eq)]
struct Status {
    bssid: Option<String>,
    ssid: Option<String>,
    freq_mhz: Option<u32>,
    mode: Option<String>,
    wpa_state: Option<String>,
    level: Option<i32>,
}

fn parse_status(text: &str) -> Status {
    let mut status = Status::default();
    for (key, value) in kv_pairs(text) {
        match key {
            "bssid" => status.bssid = Some(value.to_string()),
            "ssid" => status.ssid = Some(value.to_string()),
            "freq" => status.freq_mhz = value.parse().ok(),
            "mode" => status.mode = Some(value.to_string()),
            "wpa_state" => status.wpa_state = Some(value.to_string()),
            "level" => status.level = value.parse().ok(),
            _ => {}
        }
    }
    status
}

/// Role inference from a `STATUS` response.
fn status_role(status: &Status) -> Role {
    match status.mode.as_deref() {
        Some("AP") => Role::Ap,
        Some("mesh") => Role::Mesh,
        _ => {
            if status.wpa_state.as_deref() == Some("COMPLETED") {
                Role::Station
            } else {
                Role::None
            }
        }
    }
}

/// Parsed `BSS <bssid>` response.
#[derive(Debug, Default, PartialEq, Eq)]
struct BssInfo {
    bssid: Option<String>,
    freq_mhz: Option<u32>,
    level: Option<i32>,
    caps: Option<String>,
    ssid: Option<String>,
}

fn parse_bss(text: &str) -> BssInfo {
    let mut info = BssInfo::default();
    for (key, value) in kv_pairs(text) {
        match key {
            "bssid" => info.bssid = Some(value.to_string()),
            "freq" => info.freq_mhz = value.parse().ok(),
            "level" => info.level = value.parse().ok(),
            "flags" => info.caps = Some(value.to_string()),
            "ssid" => info.ssid = Some(value.to_string()),
            _ => {}
        }
    }
    info
}

/// Parsed `SIGNAL_POLL` response: (rssi dBm, link speed Mbps).
fn parse_signal_poll(text: &str) -> (Option<i32>, Option<i32>) {
    let mut rssi = None;
    let mut speed = None;
    for (key, value) in kv_pairs(text) {
        match key {
            "RSSI" => rssi = value.parse().ok(),
            "LINKSPEED" => speed = value.parse().ok(),
            _ => {}
        }
    }
    (rssi, speed)
}

/// Parse `LIST_NETWORKS` lines into `(id, ssid, disabled)`.
fn parse_list_networks(text: &str) -> Vec<(i32, String, bool)> {
    text.lines()
        .skip_while(|l| l.starts_with("network id"))
        .filter_map(|line| {
            let mut cols = line.split('\t');
            let id = cols.next()?.trim().parse().ok()?;
            let ssid = cols.next()?.to_string();
            cols.next(); // bssid column
            let disabled = cols.next().is_some_and(|f| f.contains("[DISABLED]"));
            Some((id, ssid, disabled))
        })
        .collect()
}

/// Parse `SCAN_RESULTS` lines into BSSIDs.
fn parse_scan_results(text: &str) -> Vec<String> {
    text.lines()
        .skip_while(|l| l.starts_with("bssid"))
        .filter_map(|line| line.split('\t').next())
        .filter(|b| !b.is_empty())
        .map(canonical_bssid)
        .collect()
}

/// Render a psk payload for `SET_NETWORK`. Quoted payloads are
/// plaintext passphrases; with the `psk-hash` feature they are
/// pre-hashed (PBKDF2-HMAC-SHA1, ssid salt, 4096 rounds) into the
/// 64-digit hex form, otherwise forwarded verbatim.
#[allow(unused_variables)]
fn render_psk(ssid: &str, psk: &str) -> String {
    let quoted = psk.len() >= 2 && psk.starts_with('"') && psk.ends_with('"');
    #[cfg(feature = "psk-hash")]
    if quoted {
        let plain = &psk[1..psk.len() - 1];
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<sha1::Sha1>(plain.as_bytes(), ssid.as_bytes(), 4096, &mut key);
        return hex::encode(key);
    }
    psk.to_string()
}

/// The per-device multiplexer for the wpa dialect.
pub struct WpaEngine {
    sock: WpaSocket,
    broker: Broker,
    opts: WpaOptions,
    queue: CommandQueue,
    timers: TimerWheel<WpaTimer>,
    write_meter: WriteBlockMeter,

    bss: BssTable,
    networks: NetworkTable,
    role: Role,
    current_bssid: Option<String>,
    stations: Option<i64>,
    sta_walk: Option<i64>,
    last_ap: Option<String>,
    last_mesh: Option<String>,
    have_bss_events: bool,
}

impl WpaEngine {
    pub fn new(sock: WpaSocket, broker: Broker, opts: WpaOptions) -> Self {
        Self {
            sock,
            broker,
            opts,
            queue: CommandQueue::new(),
            timers: TimerWheel::new(),
            write_meter: WriteBlockMeter::default(),
            bss: BssTable::new(),
            networks: NetworkTable::new(),
            role: Role::None,
            current_bssid: None,
            stations: None,
            sta_walk: None,
            last_ap: None,
            last_mesh: None,
            have_bss_events: false,
        }
    }

    /// Run until SIGINT/SIGTERM (graceful, exit 0) or a fatal error.
    pub async fn run(mut self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        self.broker.subscribe("ssid/#").await?;
        self.broker.subscribe("wifi/config/#").await?;
        self.broker.subscribe("wifistate/set").await?;

        self.send("ATTACH").await?;
        self.timers.schedule(KEEPALIVE, WpaTimer::Keepalive);

        enum Step {
            Frame(usize),
            Broker(Option<Incoming>),
            Timer,
            Shutdown,
        }

        let mut buf = vec![0u8; FRAME_BUF];
        loop {
            for cause in self.timers.pop_due(Instant::now()) {
                match cause {
                    WpaTimer::CommandTimeout => {
                        warn!("wpa_supplicant lost (command timeout)");
                        return Err(Error::Device("wpa_supplicant lost".into()));
                    }
                    WpaTimer::WriteRetry => self.maybe_write_head().await?,
                    WpaTimer::Keepalive => {
                        let probe = if self.role == Role::Station && self.current_bssid.is_some() {
                            "SIGNAL_POLL"
                        } else {
                            "PING"
                        };
                        self.queue
                            .enqueue_unique(probe.to_string(), CommandClass::Keepalive);
                        self.maybe_write_head().await?;
                        self.timers.schedule(KEEPALIVE, WpaTimer::Keepalive);
                    }
                }
            }
            let wait = self
                .timers
                .time_until_next()
                .unwrap_or(Duration::from_secs(3600));

            let step = {
                let sock = &self.sock;
                let broker = &mut self.broker;
                tokio::select! {
                    n = sock.recv(&mut buf) => Step::Frame(n?),
                    msg = broker.poll() => Step::Broker(msg?),
                    () = tokio::time::sleep(wait) => Step::Timer,
                    _ = sigint.recv() => Step::Shutdown,
                    _ = sigterm.recv() => Step::Shutdown,
                }
            };

            match step {
                Step::Frame(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    self.handle_frame(&text).await?;
                }
                Step::Broker(Some(msg)) => self.on_broker(msg).await?,
                Step::Broker(None) | Step::Timer => {}
                Step::Shutdown => break,
            }
        }

        info!("terminating, flushing retained state");
        self.broker.self_sync_shutdown().await
    }

    /// Queue a command and try to put it on the wire.
    async fn send(&mut self, text: &str) -> Result<()> {
        self.queue.enqueue(text.to_string(), CommandClass::Regular);
        self.maybe_write_head().await
    }

    async fn maybe_write_head(&mut self) -> Result<()> {
        if self.queue.is_pending() {
            return Ok(());
        }
        let Some(head) = self.queue.head() else {
            return Ok(());
        };
        let text = head.text.clone();
        match self.sock.try_send(text.as_bytes()) {
            Ok(WriteOutcome::Done) => {
                debug!("> {text}");
                self.write_meter.reset();
                self.queue.mark_pending();
                self.timers
                    .schedule(COMMAND_TIMEOUT, WpaTimer::CommandTimeout);
                // keepalive counts from the last outbound command
                self.timers.schedule(KEEPALIVE, WpaTimer::Keepalive);
            }
            Ok(WriteOutcome::WouldBlock) => {
                if self.write_meter.note_blocked() {
                    warn!("wpa socket: send keeps blocking");
                    self.broker
                        .publish_event("fail", &format!("{text}: write blocked"))
                        .await?;
                }
                self.timers
                    .schedule(Duration::from_secs(1), WpaTimer::WriteRetry);
            }
            Ok(WriteOutcome::Short(n)) => {
                warn!("wpa socket: short send ({n} bytes)");
                self.broker
                    .publish_event("fail", &format!("{text}: short write"))
                    .await?;
                self.queue.mark_pending();
                self.timers
                    .schedule(COMMAND_TIMEOUT, WpaTimer::CommandTimeout);
            }
            Err(e) => {
                warn!("wpa socket: send: {e}");
                return Err(Error::Io(e));
            }
        }
        Ok(())
    }

    /// One received datagram: URC or the pending command's response.
    async fn handle_frame(&mut self, text: &str) -> Result<()> {
        let trimmed = text.trim_end_matches(['\r', '\n', '\0']);
        if let Some(tagged) = strip_priority_tag(trimmed) {
            return self.handle_event(tagged).await;
        }

        if !self.queue.is_pending() {
            warn!("unsolicited response '{}'", first_line(trimmed));
            return Ok(());
        }
        self.timers.cancel(&WpaTimer::CommandTimeout);
        self.queue.note_success();
        let cmd = self.queue.pop().map(|c| c.text).unwrap_or_default();
        debug!("< [{cmd}] {}", first_line(trimmed));

        if trimmed == "FAIL" || trimmed == "UNKNOWN COMMAND" {
            if cmd.starts_with("STA-") {
                // expected end of the station walk
                self.finish_station_walk().await?;
            } else {
                warn!("'{cmd}': {trimmed}");
                self.broker
                    .publish_event("fail", &format!("{cmd}: {trimmed}"))
                    .await?;
            }
        } else {
            self.handle_response(&cmd, trimmed).await?;
        }

        self.maybe_write_head().await
    }

    async fn handle_event(&mut self, line: &str) -> Result<()> {
        // mirror the supplicant log line to the log topic
        let log_topic = format!("tmp/{}/wpa", self.sock.iface());
        self.broker.publish_abs(&log_topic, line, false).await?;

        let mut words = line.split_whitespace();
        let tag = words.next().unwrap_or("");
        match tag {
            "CTRL-EVENT-CONNECTED" | "CTRL-EVENT-DISCONNECTED" => {
                self.send("STATUS").await?;
            }
            "AP-ENABLED" => {
                self.set_role(Role::Ap).await?;
                self.begin_station_baseline().await?;
                self.send("STATUS").await?;
            }
            "MESH-GROUP-STARTED" => {
                self.set_role(Role::Mesh).await?;
                self.begin_station_baseline().await?;
                self.send("STATUS").await?;
            }
            "AP-DISABLED" | "MESH-GROUP-REMOVED" => {
                self.stations = None;
                self.broker.publish_if_changed("stations", None).await?;
                self.send("STATUS").await?;
            }
            "AP-STA-CONNECTED" | "MESH-PEER-CONNECTED" => {
                let n = self.stations.unwrap_or(0) + 1;
                self.stations = Some(n);
                self.broker
                    .publish_if_changed("stations", Some(n.to_string().as_str()))
                    .await?;
            }
            "AP-STA-DISCONNECTED" | "MESH-PEER-DISCONNECTED" => {
                let n = (self.stations.unwrap_or(0) - 1).max(0);
                self.stations = Some(n);
                self.broker
                    .publish_if_changed("stations", Some(n.to_string().as_str()))
                    .await?;
            }
            "CTRL-EVENT-BSS-ADDED" => {
                self.have_bss_events = true;
                if let Some(bssid) = words.nth(1) {
                    let bssid = canonical_bssid(bssid);
                    self.send(&format!("BSS {bssid}")).await?;
                }
            }
            "CTRL-EVENT-BSS-REMOVED" => {
                self.have_bss_events = true;
                if let Some(bssid) = words.nth(1) {
                    let bssid = canonical_bssid(bssid);
                    self.bss.remove(&bssid);
                    self.clear_bss_topics(&bssid).await?;
                }
            }
            "CTRL-EVENT-SCAN-RESULTS" => {
                if !self.have_bss_events {
                    self.send("SCAN_RESULTS").await?;
                }
            }
            _ => debug!("event {tag}"),
        }
        Ok(())
    }

    async fn handle_response(&mut self, cmd: &str, text: &str) -> Result<()> {
        if cmd == "ATTACH" {
            info!("wpa_supplicant attached");
            self.send("LIST_NETWORKS").await?;
            self.send("SCAN_RESULTS").await?;
            self.send("STATUS").await?;
            self.send("SCAN").await?;
        } else if cmd == "LIST_NETWORKS" {
            self.apply_list_networks(text).await?;
        } else if cmd == "SCAN_RESULTS" {
            self.apply_scan_results(text).await?;
        } else if cmd == "STATUS" {
            self.apply_status(text).await?;
        } else if cmd == "SIGNAL_POLL" {
            let (rssi, speed) = parse_signal_poll(text);
            self.broker
                .publish_if_changed("rssi", rssi.map(|v| v.to_string()).as_deref())
                .await?;
            self.broker
                .publish_if_changed("speed", speed.map(|v| v.to_string()).as_deref())
                .await?;
        } else if let Some(bssid) = cmd.strip_prefix("BSS ") {
            self.apply_bss(bssid, text).await?;
        } else if cmd == "ADD_NETWORK" {
            self.apply_add_network(text).await?;
        } else if let Some(rest) = cmd.strip_prefix("GET_NETWORK ") {
            self.apply_get_network(rest, text).await?;
        } else if cmd.starts_with("STA-") {
            self.apply_station_walk(text).await?;
        } else if is_mutating(cmd) {
            self.apply_mutation_done(cmd).await?;
        } else {
            debug!("'{cmd}' ok");
        }
        Ok(())
    }

    // ── response handlers ───────────────────────────────────────────

    async fn apply_list_networks(&mut self, text: &str) -> Result<()> {
        self.networks.clear_confirmed();
        let mut new_ids = Vec::new();
        for (id, ssid, disabled) in parse_list_networks(text) {
            if self.networks.add_confirmed(id, &ssid) {
                if let Some(rec) = self.networks.by_id_mut(id) {
                    rec.disabled = disabled;
                }
                new_ids.push(id);
            } else {
                // duplicate ssid: cull the later entry
                warn!("duplicate network '{ssid}', removing id {id}");
                self.send(&format!("REMOVE_NETWORK {id}")).await?;
            }
        }
        for id in new_ids {
            self.send(&format!("GET_NETWORK {id} disabled")).await?;
            self.send(&format!("GET_NETWORK {id} mode")).await?;
        }
        self.refresh_derived().await
    }

    async fn apply_scan_results(&mut self, text: &str) -> Result<()> {
        self.bss.begin_reconcile();
        for bssid in parse_scan_results(text) {
            self.send(&format!("BSS {bssid}")).await?;
            self.bss.mark_present(&bssid);
        }
        for bssid in self.bss.drop_absent() {
            self.clear_bss_topics(&bssid).await?;
        }
        Ok(())
    }

    async fn apply_bss(&mut self, queried: &str, text: &str) -> Result<()> {
        let info = parse_bss(text);
        let Some(bssid) = info.bssid.map(|b| canonical_bssid(&b)) else {
            // the BSS vanished between the event and our query
            debug!("BSS {queried}: gone");
            return Ok(());
        };

        let known_flags = info
            .ssid
            .as_deref()
            .and_then(|ssid| self.networks.by_ssid(ssid))
            .map_or(BssFlags::empty(), |net| {
                let mut f = BssFlags::KNOWN;
                if net.disabled {
                    f |= BssFlags::DISABLED;
                }
                f
            });

        let record = self.bss.upsert(&bssid);
        record.ssid = info.ssid.clone();
        record.freq_mhz = info.freq_mhz;
        record.level = info.level;
        let caps = info.caps.as_deref().unwrap_or("");
        record.flags = BssFlags::from_capabilities(caps)
            | known_flags
            | (record.flags & BssFlags::PRESENT);
        let flags_str = record.flags.flags_str();

        self.broker
            .publish_if_changed(&format!("bss/{bssid}/ssid"), info.ssid.as_deref())
            .await?;
        self.broker
            .publish_if_changed(
                &format!("bss/{bssid}/freq"),
                info.freq_mhz.map(format_freq).as_deref(),
            )
            .await?;
        self.broker
            .publish_if_changed(
                &format!("bss/{bssid}/level"),
                info.level.map(|v| v.to_string()).as_deref(),
            )
            .await?;
        self.broker
            .publish_if_changed(&format!("bss/{bssid}/flags"), Some(flags_str.as_str()))
            .await?;

        // refresh the headline level when this is the current AP
        if self.role == Role::Station && self.current_bssid.as_deref() == Some(bssid.as_str()) {
            self.broker
                .publish_if_changed("level", info.level.map(|v| v.to_string()).as_deref())
                .await?;
        }
        Ok(())
    }

    async fn apply_status(&mut self, text: &str) -> Result<()> {
        let status = parse_status(text);
        let role = status_role(&status);
        self.set_role(role).await?;

        self.current_bssid = status.bssid.as_deref().map(canonical_bssid);

        self.broker
            .publish_if_changed("bssid", self.current_bssid.as_deref())
            .await?;
        self.broker
            .publish_if_changed("freq", status.freq_mhz.map(format_freq).as_deref())
            .await?;
        self.broker
            .publish_if_changed("ssid", status.ssid.as_deref())
            .await?;

        let level = match role {
            Role::Station => status.level.or_else(|| {
                self.current_bssid
                    .as_deref()
                    .and_then(|b| self.bss.get(b))
                    .and_then(|r| r.level)
            }),
            _ => None,
        };
        self.broker
            .publish_if_changed("level", level.map(|v| v.to_string()).as_deref())
            .await?;

        match role {
            Role::Ap => {
                if let Some(ssid) = &status.ssid {
                    self.last_ap = Some(ssid.clone());
                    self.broker.publish_if_changed("lastAP", Some(ssid.as_str())).await?;
                }
            }
            Role::Mesh => {
                if let Some(ssid) = &status.ssid {
                    self.last_mesh = Some(ssid.clone());
                    self.broker
                        .publish_if_changed("lastmesh", Some(ssid.as_str()))
                        .await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn apply_add_network(&mut self, text: &str) -> Result<()> {
        let Ok(id) = text.trim().parse::<i32>() else {
            warn!("ADD_NETWORK: unexpected response '{text}'");
            return Ok(());
        };
        let Some(record) = self.networks.confirm_oldest(id) else {
            debug!("ADD_NETWORK {id}: no pending creation");
            return Ok(());
        };

        if record.pending_remove {
            self.networks.remove_id(id);
            self.send(&format!("REMOVE_NETWORK {id}")).await?;
            return Ok(());
        }

        let ssid = record.ssid.clone();
        let pairs = std::mem::take(&mut record.pending_config);
        let mode = record.mode;
        let select = record.pending_select;
        let enable = record.pending_enable;
        record.pending_select = false;
        record.pending_enable = false;

        self.send(&format!("SET_NETWORK {id} ssid \"{ssid}\"")).await?;
        for (key, value) in pairs {
            self.send(&format!("SET_NETWORK {id} {key} {value}")).await?;
        }
        if select {
            self.send(&format!("SELECT_NETWORK {id}")).await?;
        } else if mode == NetworkMode::Station || enable {
            self.send(&format!("ENABLE_NETWORK {id}")).await?;
        }
        // AP/mesh networks stay disabled until selected
        Ok(())
    }

    async fn apply_get_network(&mut self, args: &str, text: &str) -> Result<()> {
        let mut parts = args.split_whitespace();
        let Some(id) = parts.next().and_then(|s| s.parse::<i32>().ok()) else {
            return Ok(());
        };
        let Some(field) = parts.next() else {
            return Ok(());
        };
        let value = first_line(text).trim();
        if let Some(record) = self.networks.by_id_mut(id) {
            match field {
                "disabled" => record.disabled = value == "1",
                "mode" => {
                    if let Some(mode) = value.parse().ok().and_then(NetworkMode::from_raw) {
                        record.mode = mode;
                    }
                }
                _ => {}
            }
        }
        self.refresh_derived().await
    }

    /// A mutating command completed: track its local effect and save
    /// the supplicant config once the queue holds no further mutation.
    async fn apply_mutation_done(&mut self, cmd: &str) -> Result<()> {
        let mut words = cmd.split_whitespace();
        match (words.next().unwrap_or(""), words.next()) {
            ("ENABLE_NETWORK", Some("all")) => {
                for net in self.networks.iter_mut() {
                    net.disabled = false;
                }
            }
            ("ENABLE_NETWORK", Some(id)) => {
                if let Some(net) = id.parse().ok().and_then(|i| self.networks.by_id_mut(i)) {
                    net.disabled = false;
                }
            }
            ("DISABLE_NETWORK", Some("all")) => {
                for net in self.networks.iter_mut() {
                    net.disabled = true;
                }
            }
            ("DISABLE_NETWORK", Some(id)) => {
                if let Some(net) = id.parse().ok().and_then(|i| self.networks.by_id_mut(i)) {
                    net.disabled = true;
                }
            }
            ("SELECT_NETWORK", Some(id)) => {
                if let Ok(id) = id.parse::<i32>() {
                    for net in self.networks.iter_mut() {
                        net.disabled = net.id != Some(id);
                    }
                }
            }
            ("REMOVE_NETWORK", Some(id)) => {
                if let Ok(id) = id.parse::<i32>() {
                    self.networks.remove_id(id);
                }
            }
            ("SET_NETWORK", Some(id)) => {
                // SET_NETWORK <id> <key> <value>
                let key = words.next().unwrap_or("");
                let value = words.next().unwrap_or("");
                if key == "mode" {
                    if let (Ok(id), Some(mode)) =
                        (id.parse::<i32>(), value.parse().ok().and_then(NetworkMode::from_raw))
                    {
                        if let Some(net) = self.networks.by_id_mut(id) {
                            net.mode = mode;
                        }
                    }
                }
            }
            _ => {}
        }

        if !self.queue.iter().any(|c| is_mutating(&c.text)) {
            self.send("SAVE_CONFIG").await?;
        }
        self.refresh_derived().await
    }

    // ── station counting ────────────────────────────────────────────

    /// New AP/mesh group: baseline the station counter and walk the
    /// already-associated stations.
    async fn begin_station_baseline(&mut self) -> Result<()> {
        self.stations = Some(0);
        self.broker.publish_if_changed("stations", Some("0")).await?;
        self.sta_walk = Some(0);
        self.send("STA-FIRST").await?;
        Ok(())
    }

    async fn apply_station_walk(&mut self, text: &str) -> Result<()> {
        let mac = first_line(text).trim().to_string();
        if mac.is_empty() {
            return self.finish_station_walk().await;
        }
        if let Some(count) = self.sta_walk.as_mut() {
            *count += 1;
        }
        self.send(&format!("STA-NEXT {mac}")).await?;
        Ok(())
    }

    /// The walk hit its expected terminal `FAIL`.
    async fn finish_station_walk(&mut self) -> Result<()> {
        if let Some(count) = self.sta_walk.take() {
            self.stations = Some(count);
            self.broker
                .publish_if_changed("stations", Some(count.to_string().as_str()))
                .await?;
        }
        Ok(())
    }

    // ── derived state ───────────────────────────────────────────────

    async fn set_role(&mut self, role: Role) -> Result<()> {
        let was = self.role;
        self.role = role;
        if was == Role::Station && role != Role::Station {
            self.broker.publish_if_changed("speed", None).await?;
            self.broker.publish_if_changed("rssi", None).await?;
        }
        self.publish_wifistate().await
    }

    async fn publish_wifistate(&mut self) -> Result<()> {
        let value = derive_wifistate(self.role, &self.networks);
        self.broker.publish_if_changed("wifistate", Some(value)).await?;
        Ok(())
    }

    /// Re-derive everything that depends on the network table: the
    /// known/disabled overlay on BSS flags and the aggregate wifistate.
    async fn refresh_derived(&mut self) -> Result<()> {
        let mut updates = Vec::new();
        for (bssid, record) in self.bss.iter_mut() {
            let overlay = record
                .ssid
                .as_deref()
                .and_then(|ssid| self.networks.by_ssid(ssid))
                .map_or(BssFlags::empty(), |net| {
                    let mut f = BssFlags::KNOWN;
                    if net.disabled {
                        f |= BssFlags::DISABLED;
                    }
                    f
                });
            let next = (record.flags - (BssFlags::KNOWN | BssFlags::DISABLED)) | overlay;
            if next != record.flags {
                record.flags = next;
                updates.push((bssid.clone(), next.flags_str()));
            }
        }
        for (bssid, flags) in updates {
            self.broker
                .publish_if_changed(&format!("bss/{bssid}/flags"), Some(flags.as_str()))
                .await?;
        }
        self.publish_wifistate().await
    }

    async fn clear_bss_topics(&mut self, bssid: &str) -> Result<()> {
        for field in ["ssid", "freq", "level", "flags"] {
            self.broker
                .publish_if_changed(&format!("bss/{bssid}/{field}"), None)
                .await?;
        }
        Ok(())
    }

    // ── broker commands ─────────────────────────────────────────────

    async fn on_broker(&mut self, msg: Incoming) -> Result<()> {
        // retained topics replay old requests at subscribe time
        if msg.retained {
            return Ok(());
        }
        let Some(suffix) = self.broker.strip_prefix(&msg.topic) else {
            return Ok(());
        };
        let parts: Vec<&str> = suffix.split('/').collect();
        match parts.as_slice() {
            ["ssid", "set"] => self.cmd_ssid_set(&msg.payload).await?,
            ["ssid", "enable"] => self.cmd_enable(&msg.payload, true).await?,
            ["ssid", "disable"] => self.cmd_enable(&msg.payload, false).await?,
            ["ssid", "remove"] => self.cmd_remove(&msg.payload).await?,
            ["ssid", "psk"] => self.cmd_psk(&msg.payload).await?,
            ["ssid", "ap"] => self.cmd_group(&msg.payload, NetworkMode::Ap).await?,
            ["ssid", "mesh"] => self.cmd_group(&msg.payload, NetworkMode::Mesh).await?,
            ["ssid", "create"] => self.cmd_create(&msg.payload).await?,
            ["ssid", "config", key] => {
                let key = (*key).to_string();
                self.cmd_config(&key, &msg.payload).await?;
            }
            ["wifi", "config", key] => {
                let key = (*key).to_string();
                self.send(&format!("SET {key} {}", msg.payload.trim())).await?;
            }
            ["wifistate", "set"] => self.cmd_wifistate(&msg.payload).await?,
            _ => {}
        }
        Ok(())
    }

    async fn cmd_ssid_set(&mut self, payload: &str) -> Result<()> {
        let payload = payload.trim();
        match payload {
            "all" => self.send("ENABLE_NETWORK all").await?,
            "none" => self.send("DISABLE_NETWORK all").await?,
            ssid => {
                if let Some(net) = self.networks.by_ssid(ssid) {
                    if let Some(id) = net.id {
                        self.send(&format!("SELECT_NETWORK {id}")).await?;
                    } else if let Some(net) = self.networks.by_ssid_mut(ssid) {
                        net.pending_select = true;
                    }
                } else {
                    info!("selected unknown network '{ssid}'");
                }
            }
        }
        Ok(())
    }

    async fn cmd_enable(&mut self, payload: &str, enable: bool) -> Result<()> {
        let ssid = payload.trim();
        let Some(net) = self.networks.by_ssid_mut(ssid) else {
            return Ok(());
        };
        match net.id {
            Some(id) => {
                let verb = if enable { "ENABLE_NETWORK" } else { "DISABLE_NETWORK" };
                self.send(&format!("{verb} {id}")).await?;
            }
            None => net.pending_enable = enable,
        }
        Ok(())
    }

    async fn cmd_remove(&mut self, payload: &str) -> Result<()> {
        let ssid = payload.trim();
        // removing what is already gone is a no-op
        let Some(net) = self.networks.by_ssid_mut(ssid) else {
            return Ok(());
        };
        match net.id {
            Some(id) => {
                self.send(&format!("REMOVE_NETWORK {id}")).await?;
            }
            None => net.pending_remove = true,
        }
        Ok(())
    }

    /// Payload: `<ssid>\n<psk-or-quoted-plaintext>`.
    async fn cmd_psk(&mut self, payload: &str) -> Result<()> {
        let Some((ssid, psk)) = payload.split_once('\n') else {
            warn!("ssid/psk: missing psk line");
            return Ok(());
        };
        let (ssid, psk) = (ssid.trim(), psk.trim());
        let rendered = render_psk(ssid, psk);
        match self.networks.by_ssid(ssid).and_then(|n| n.id) {
            Some(id) => {
                self.send(&format!("SET_NETWORK {id} psk {rendered}")).await?;
            }
            None => {
                self.create_buffered(ssid).buffer("psk", &rendered);
                self.flush_creation().await?;
            }
        }
        Ok(())
    }

    /// Payload: `<ssid>[\n<psk>]` — create or convert to AP/mesh.
    async fn cmd_group(&mut self, payload: &str, mode: NetworkMode) -> Result<()> {
        let (ssid, psk) = match payload.split_once('\n') {
            Some((s, p)) => (s.trim(), Some(p.trim())),
            None => (payload.trim(), None),
        };
        let rendered = psk.map(|p| render_psk(ssid, p));
        let no_bgscan = self.opts.no_ap_bgscan;

        match self.networks.by_ssid(ssid).and_then(|n| n.id) {
            Some(id) => {
                self.send(&format!("SET_NETWORK {id} mode {}", mode.as_raw()))
                    .await?;
                if let Some(psk) = &rendered {
                    self.send(&format!("SET_NETWORK {id} psk {psk}")).await?;
                }
                if no_bgscan {
                    self.send(&format!("SET_NETWORK {id} bgscan \"\"")).await?;
                }
            }
            None => {
                let record = self.create_buffered(ssid);
                record.mode = mode;
                record.buffer("mode", &mode.as_raw().to_string());
                if let Some(psk) = &rendered {
                    record.buffer("psk", psk);
                }
                if no_bgscan {
                    record.buffer("bgscan", "\"\"");
                }
                self.flush_creation().await?;
            }
        }
        Ok(())
    }

    async fn cmd_create(&mut self, payload: &str) -> Result<()> {
        let ssid = payload.trim();
        if ssid.is_empty() || self.networks.by_ssid(ssid).is_some() {
            return Ok(());
        }
        self.create_buffered(ssid);
        self.flush_creation().await?;
        Ok(())
    }

    /// Payload: `<ssid>\n<value>` for `SET_NETWORK <id> <key> <value>`.
    async fn cmd_config(&mut self, key: &str, payload: &str) -> Result<()> {
        let Some((ssid, value)) = payload.split_once('\n') else {
            warn!("ssid/config/{key}: missing value line");
            return Ok(());
        };
        let (ssid, value) = (ssid.trim(), value.trim());
        match self.networks.by_ssid(ssid).and_then(|n| n.id) {
            Some(id) => {
                self.send(&format!("SET_NETWORK {id} {key} {value}")).await?;
            }
            None => {
                self.create_buffered(ssid).buffer(key, value);
                self.flush_creation().await?;
            }
        }
        Ok(())
    }

    async fn cmd_wifistate(&mut self, payload: &str) -> Result<()> {
        match payload.trim() {
            "off" => self.send("DISABLE_NETWORK all").await?,
            "station" => {
                let actions: Vec<(i32, bool)> = self
                    .networks
                    .iter()
                    .filter_map(|n| n.id.map(|id| (id, n.mode == NetworkMode::Station)))
                    .collect();
                for (id, enable) in actions {
                    let verb = if enable { "ENABLE_NETWORK" } else { "DISABLE_NETWORK" };
                    self.send(&format!("{verb} {id}")).await?;
                }
            }
            "AP" => {
                if let Some(id) = self
                    .last_ap
                    .clone()
                    .and_then(|ssid| self.networks.by_ssid(&ssid))
                    .and_then(|n| n.id)
                {
                    self.send(&format!("SELECT_NETWORK {id}")).await?;
                }
            }
            "mesh" => {
                if let Some(id) = self
                    .last_mesh
                    .clone()
                    .and_then(|ssid| self.networks.by_ssid(&ssid))
                    .and_then(|n| n.id)
                {
                    self.send(&format!("SELECT_NETWORK {id}")).await?;
                }
            }
            other => warn!("wifistate/set: unknown state '{other}'"),
        }
        Ok(())
    }

    /// Fetch-or-create the buffering record for `ssid`.
    fn create_buffered(&mut self, ssid: &str) -> &mut network::NetworkRecord {
        if self.networks.by_ssid(ssid).is_none() {
            self.networks.create_pending(ssid);
        }
        self.networks.by_ssid_mut(ssid).unwrap()
    }

    /// Issue the `ADD_NETWORK` for the newest buffered creation.
    async fn flush_creation(&mut self) -> Result<()> {
        self.send("ADD_NETWORK").await
    }
}

/// Strip a `<N>` priority tag; `None` when the frame is a response.
fn strip_priority_tag(text: &str) -> Option<&str> {
    let rest = text.strip_prefix('<')?;
    let (prio, rest) = rest.split_once('>')?;
    if prio.len() == 1 && prio.chars().all(|c| c.is_ascii_digit()) {
        Some(rest)
    } else {
        None
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_priority_tag() {
        assert_eq!(
            strip_priority_tag("<3>CTRL-EVENT-CONNECTED ..."),
            Some("CTRL-EVENT-CONNECTED ...")
        );
        assert_eq!(strip_priority_tag("PONG"), None);
        assert_eq!(strip_priority_tag("<10>odd"), None);
    }

    #[test]
    fn test_parse_status_station() {
        let status = parse_status(
            "bssid=00:11:22:33:44:55\nfreq=2437\nssid=home\nmode=station\nwpa_state=COMPLETED\n",
        );
        assert_eq!(status.bssid.as_deref(), Some("00:11:22:33:44:55"));
        assert_eq!(status.freq_mhz, Some(2437));
        assert_eq!(status_role(&status), Role::Station);
    }

    #[test]
    fn test_parse_status_ap() {
        let status = parse_status("ssid=my-ap\nmode=AP\nfreq=5180\nwpa_state=COMPLETED\n");
        assert_eq!(status_role(&status), Role::Ap);
    }

    #[test]
    fn test_parse_status_disconnected() {
        let status = parse_status("wpa_state=SCANNING\n");
        assert_eq!(status_role(&status), Role::None);
    }

    #[test]
    fn test_parse_bss() {
        let info = parse_bss(
            "id=7\nbssid=00:11:22:33:44:55\nfreq=2437\nlevel=-55\nflags=[WPA2-PSK-CCMP][ESS]\nssid=home\n",
        );
        assert_eq!(info.bssid.as_deref(), Some("00:11:22:33:44:55"));
        assert_eq!(info.freq_mhz, Some(2437));
        assert_eq!(info.level, Some(-55));
        assert_eq!(info.ssid.as_deref(), Some("home"));
        assert_eq!(
            BssFlags::from_capabilities(info.caps.as_deref().unwrap()).flags_str(),
            "w----"
        );
    }

    #[test]
    fn test_parse_signal_poll() {
        let (rssi, speed) = parse_signal_poll("RSSI=-61\nLINKSPEED=72\nNOISE=9999\nFREQUENCY=2437\n");
        assert_eq!(rssi, Some(-61));
        assert_eq!(speed, Some(72));
    }

    #[test]
    fn test_parse_list_networks() {
        let text = "network id / ssid / bssid / flags\n0\thome\tany\t[CURRENT]\n1\tguest\tany\t[DISABLED]\n";
        let nets = parse_list_networks(text);
        assert_eq!(
            nets,
            vec![
                (0, "home".to_string(), false),
                (1, "guest".to_string(), true),
            ]
        );
    }

    #[test]
    fn test_parse_scan_results() {
        let text = "bssid / frequency / signal level / flags / ssid\n00:11:22:33:44:55\t2437\t-55\t[WPA2-PSK-CCMP]\thome\n66:77:88:99:AA:BB\t5180\t-70\t[ESS]\tcafe\n";
        assert_eq!(
            parse_scan_results(text),
            vec![
                "00:11:22:33:44:55".to_string(),
                "66:77:88:99:aa:bb".to_string(),
            ]
        );
    }

    #[test]
    fn test_is_mutating() {
        assert!(is_mutating("SET_NETWORK 0 psk \"x\""));
        assert!(is_mutating("ENABLE_NETWORK 0"));
        assert!(is_mutating("SET country DE"));
        assert!(is_mutating("REMOVE_NETWORK 3"));
        assert!(!is_mutating("STATUS"));
        assert!(!is_mutating("SCAN"));
        assert!(!is_mutating("GET_NETWORK 0 mode"));
    }

    #[cfg(not(feature = "psk-hash"))]
    #[test]
    fn test_render_psk_passthrough() {
        assert_eq!(render_psk("home", "\"hunter2\""), "\"hunter2\"");
        assert_eq!(render_psk("home", "deadbeef"), "deadbeef");
    }

    #[cfg(feature = "psk-hash")]
    #[test]
    fn test_render_psk_hashes_plaintext() {
        // IEEE 802.11i test vector: passphrase "password", ssid "IEEE"
        assert_eq!(
            render_psk("IEEE", "\"password\""),
            "f42c6fc52df0ebef9ebb4b90b38a5f902e83fe1b135a70e23aed762e9710a12e"
        );
        // already-hashed keys pass through
        assert_eq!(render_psk("IEEE", "deadbeef"), "deadbeef");
    }
}
