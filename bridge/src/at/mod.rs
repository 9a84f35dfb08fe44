//! AT dialect engine: one serial modem bridged to the broker.
//!
//! The engine owns the serial port, the outbound command FIFO and the
//! per-property state, and runs a single cooperative loop over three
//! event sources: modem bytes, broker messages, and timers. Inbound
//! lines are grouped into request/response pairs terminated by
//! `OK`/`ERROR`/`+CME ERROR`/`NO CARRIER`/`ABORT`; anything arriving
//! outside a response group is an unsolicited result code and is
//! dispatched immediately.
//!
//! Vendor quirks activate themselves from the reported brand/model
//! unless pinned on the command line: SIMCOM modems hold the operator
//! name download until `PB DONE`, and SIM75xx modems detach before a
//! network scan.

pub mod operators;
pub mod parser;
pub mod vocab;

use std::time::{Duration, Instant};

use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

use crate::broker::{Broker, Incoming};
use crate::config::AtOptions;
use crate::queue::{classify_at, CommandQueue};
use crate::serial::{SerialPort, WriteBlockMeter, WriteOutcome};
use crate::timer::TimerWheel;
use crate::{Error, Result};

use operators::OperatorTable;
use parser::LineBuffer;

/// Timeout for ordinary commands; scans and re-registration carry
/// their own budgets (see [`crate::queue::Command::timeout`]).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive command timeouts before the modem is declared dead.
const TIMEOUT_FATAL_STREAK: u32 = 5;

/// Response-group line cap; excess lines collapse into one `"..."`.
const MAX_GROUP_LINES: usize = 32;

/// How long to wait for `PB DONE` before faking it (SIMCOM quirk).
const OPERATOR_LIST_FALLBACK: Duration = Duration::from_secs(10);

/// Everything the timer wheel can fire for this dialect.
#[derive(Debug, PartialEq, Eq)]
pub enum AtTimer {
    /// The pending command's response deadline.
    CommandTimeout,
    /// Re-attempt a blocked device write.
    WriteRetry,
    PollCsq,
    PollCreg,
    PollCgreg,
    PollCops,
    PollCnti,
    /// Fake a `PB DONE` if the modem never sends one.
    OperatorListFallback,
}

/// Priority of the source that last set `lac`/`cellid`/`nt`.
/// CGREG outranks CREG outranks COPS; a cleared slot drops back to the
/// floor so any source may repopulate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Source {
    Floor,
    Cops,
    Creg,
    Cgreg,
}

/// Precedence gate for one multi-source property.
#[derive(Debug)]
pub struct Sourced {
    prio: Source,
    occupied: bool,
}

impl Default for Sourced {
    fn default() -> Self {
        Self {
            prio: Source::Floor,
            occupied: false,
        }
    }
}

impl Sourced {
    /// Record an update attempt from `prio`. Returns whether the update
    /// (value or clear) is accepted.
    pub fn update(&mut self, prio: Source, present: bool) -> bool {
        if prio < self.prio && self.occupied {
            return false;
        }
        self.occupied = present;
        self.prio = if present { prio } else { Source::Floor };
        true
    }
}

/// Whether a parsed line is a URC or (part of) a response.
#[derive(Debug, PartialEq, Eq)]
pub enum LineClass {
    Urc,
    Response,
}

/// Classify a line that arrived while no response group is open.
/// `pending` is the command currently on the wire, if any.
pub fn classify_line(pending: Option<&str>, line: &str) -> LineClass {
    if line == "PB DONE" || line == "SMS DONE" || line.starts_with("RING") {
        return LineClass::Urc;
    }
    if line == "NO CARRIER" {
        return if pending.is_some() {
            LineClass::Response
        } else {
            LineClass::Urc
        };
    }
    if line.starts_with("+CME ERROR") {
        return LineClass::Response;
    }
    if line.starts_with('+') || line.starts_with('*') {
        // The first line of a pending command's response also starts
        // with '+': tell it apart by the command's own prefix.
        if let Some(prefix) = pending.and_then(vocab::expected_prefix) {
            let token = line.split(':').next().unwrap_or(line).trim();
            if token.eq_ignore_ascii_case(&prefix) {
                return LineClass::Response;
            }
        }
        return LineClass::Urc;
    }
    LineClass::Response
}

/// The per-device multiplexer for the AT dialect.
pub struct AtEngine {
    port: SerialPort,
    broker: Broker,
    opts: AtOptions,
    queue: CommandQueue,
    lines: LineBuffer,
    timers: TimerWheel<AtTimer>,
    write_meter: WriteBlockMeter,

    group: Vec<String>,
    group_capped: bool,

    operators: OperatorTable,
    imsi: Option<String>,
    sim_operator_resolved: bool,
    brand: Option<String>,
    model: Option<String>,
    simcom: bool,
    detached_scan: bool,
    pb_done: bool,
    copn_deferred: bool,

    lac: Sourced,
    cellid: Sourced,
    nt: Sourced,
}

impl AtEngine {
    pub fn new(port: SerialPort, broker: Broker, opts: AtOptions) -> Self {
        let simcom = opts.simcom.unwrap_or(false);
        let detached_scan = opts.detached_scan.unwrap_or(false);
        Self {
            port,
            broker,
            opts,
            queue: CommandQueue::new(),
            lines: LineBuffer::new(),
            timers: TimerWheel::new(),
            write_meter: WriteBlockMeter::default(),
            group: Vec::new(),
            group_capped: false,
            operators: OperatorTable::new(),
            imsi: None,
            sim_operator_resolved: false,
            brand: None,
            model: None,
            simcom,
            detached_scan,
            pb_done: false,
            copn_deferred: false,
            lac: Sourced::default(),
            cellid: Sourced::default(),
            nt: Sourced::default(),
        }
    }

    /// Run until SIGINT/SIGTERM (graceful, exit 0) or a fatal error.
    pub async fn run(mut self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        self.bootstrap().await?;

        enum Step {
            Device(usize),
            Broker(Option<Incoming>),
            Timer,
            Shutdown,
        }

        let mut buf = [0u8; 1024];
        loop {
            for cause in self.timers.pop_due(Instant::now()) {
                self.on_timer(cause).await?;
            }
            let wait = self
                .timers
                .time_until_next()
                .unwrap_or(Duration::from_secs(3600));

            let step = {
                let port = &self.port;
                let broker = &mut self.broker;
                tokio::select! {
                    n = port.read(&mut buf) => Step::Device(n?),
                    msg = broker.poll() => Step::Broker(msg?),
                    () = tokio::time::sleep(wait) => Step::Timer,
                    _ = sigint.recv() => Step::Shutdown,
                    _ = sigterm.recv() => Step::Shutdown,
                }
            };

            match step {
                Step::Device(0) => {
                    warn!("{} EOF", self.port.path());
                    return Err(Error::DeviceClosed);
                }
                Step::Device(n) => {
                    for line in self.lines.extend(&buf[..n])? {
                        self.handle_line(line).await?;
                    }
                }
                Step::Broker(Some(msg)) => self.on_broker(msg).await?,
                Step::Broker(None) | Step::Timer => {}
                Step::Shutdown => break,
            }
        }

        info!("terminating, flushing retained state");
        self.broker.self_sync_shutdown().await
    }

    /// Subscribe, send the bootstrap sequence, arm periodic polls.
    async fn bootstrap(&mut self) -> Result<()> {
        self.broker.subscribe("raw/send").await?;
        self.broker.subscribe("ops/scan").await?;

        for cmd in [
            "AT", "ATE0", "AT+CGMI", "AT+CGMM", "AT+CGMR", "AT+CGSN", "AT+CPIN?", "AT+CREG?",
            "AT+CGREG?", "AT+CSQ", "AT+COPS=3,2", "AT+COPS?",
        ] {
            self.enqueue(cmd).await?;
        }
        if self.opts.autocsq {
            self.enqueue("AT+AUTOCSQ=1,1").await?;
        }
        if self.opts.cnti.enabled {
            self.enqueue("AT*CNTI=0").await?;
            self.timers
                .schedule(Duration::from_secs(self.opts.cnti.secs), AtTimer::PollCnti);
        }
        if self.opts.csq.enabled {
            self.timers
                .schedule(Duration::from_secs(self.opts.csq.secs), AtTimer::PollCsq);
        }
        if self.opts.creg.enabled {
            self.timers
                .schedule(Duration::from_secs(self.opts.creg.secs), AtTimer::PollCreg);
        }
        if self.opts.cgreg.enabled {
            self.timers
                .schedule(Duration::from_secs(self.opts.cgreg.secs), AtTimer::PollCgreg);
        }
        if self.opts.cops.enabled {
            self.timers
                .schedule(Duration::from_secs(self.opts.cops.secs), AtTimer::PollCops);
        }
        Ok(())
    }

    async fn enqueue(&mut self, text: &str) -> Result<()> {
        self.queue.enqueue(text.to_string(), classify_at(text));
        self.maybe_write_head().await
    }

    async fn enqueue_unique(&mut self, text: &str) -> Result<()> {
        self.queue.enqueue_unique(text.to_string(), classify_at(text));
        self.maybe_write_head().await
    }

    /// Write the queue head if the wire is idle. One non-blocking
    /// attempt; blocked writes re-arm a 1 s retry and are reported
    /// after ten consecutive misses.
    async fn maybe_write_head(&mut self) -> Result<()> {
        if self.queue.is_pending() {
            return Ok(());
        }
        let Some(head) = self.queue.head() else {
            return Ok(());
        };
        let text = head.text.clone();
        let deadline = head.timeout(DEFAULT_TIMEOUT);

        let mut frame = text.clone().into_bytes();
        frame.push(b'\r');
        match self.port.try_write(&frame) {
            Ok(WriteOutcome::Done) => {
                debug!("> {text}");
                self.write_meter.reset();
                self.queue.mark_pending();
                self.timers.schedule(deadline, AtTimer::CommandTimeout);
            }
            Ok(WriteOutcome::WouldBlock) => {
                if self.write_meter.note_blocked() {
                    warn!("{}: write keeps blocking", self.port.path());
                    self.broker
                        .publish_event("fail", &format!("{text}: write blocked"))
                        .await?;
                }
                self.timers
                    .schedule(Duration::from_secs(1), AtTimer::WriteRetry);
            }
            Ok(WriteOutcome::Short(n)) => {
                warn!("{}: short write ({n} bytes)", self.port.path());
                self.broker
                    .publish_event("fail", &format!("{text}: short write"))
                    .await?;
                self.queue.mark_pending();
                self.timers.schedule(deadline, AtTimer::CommandTimeout);
            }
            Err(e) => {
                warn!("write {}: {e}", self.port.path());
                self.broker
                    .publish_event("fail", &format!("{text}: {e}"))
                    .await?;
                self.queue.mark_pending();
                self.timers.schedule(deadline, AtTimer::CommandTimeout);
            }
        }
        Ok(())
    }

    async fn on_timer(&mut self, cause: AtTimer) -> Result<()> {
        match cause {
            AtTimer::CommandTimeout => {
                let cmd = self.queue.pop();
                let streak = self.queue.note_timeout();
                if let Some(cmd) = cmd {
                    warn!("'{}': timeout", cmd.text);
                    self.broker
                        .publish_event("fail", &format!("{}: timeout", cmd.text))
                        .await?;
                }
                if streak >= TIMEOUT_FATAL_STREAK {
                    return Err(Error::Unresponsive);
                }
                self.maybe_write_head().await?;
            }
            AtTimer::WriteRetry => self.maybe_write_head().await?,
            AtTimer::PollCsq => {
                self.enqueue_unique("AT+CSQ").await?;
                self.timers
                    .schedule(Duration::from_secs(self.opts.csq.secs), AtTimer::PollCsq);
            }
            AtTimer::PollCreg => {
                self.enqueue_unique("AT+CREG?").await?;
                self.timers
                    .schedule(Duration::from_secs(self.opts.creg.secs), AtTimer::PollCreg);
            }
            AtTimer::PollCgreg => {
                self.enqueue_unique("AT+CGREG?").await?;
                self.timers
                    .schedule(Duration::from_secs(self.opts.cgreg.secs), AtTimer::PollCgreg);
            }
            AtTimer::PollCops => {
                self.enqueue_unique("AT+COPS?").await?;
                self.timers
                    .schedule(Duration::from_secs(self.opts.cops.secs), AtTimer::PollCops);
            }
            AtTimer::PollCnti => {
                self.enqueue_unique("AT*CNTI=0").await?;
                self.timers
                    .schedule(Duration::from_secs(self.opts.cnti.secs), AtTimer::PollCnti);
            }
            AtTimer::OperatorListFallback => self.operator_list_ready().await?,
        }
        Ok(())
    }

    /// Feed one parsed line through URC classification and response
    /// aggregation.
    async fn handle_line(&mut self, line: String) -> Result<()> {
        // Operator entries stream into the table as they arrive, so the
        // group cap cannot truncate the name download.
        if let Some(data) = line.strip_prefix("+COPN:") {
            if let Some((id, name)) = vocab::parse_copn(data.trim()) {
                self.operators.insert(id, name);
            }
        }

        if self.group.is_empty() {
            let pending = self
                .queue
                .is_pending()
                .then(|| self.queue.head().map(|c| c.text.clone()))
                .flatten();
            if classify_line(pending.as_deref(), &line) == LineClass::Urc {
                return self.handle_urc(&line).await;
            }
        }

        if vocab::is_terminator(&line) {
            self.group.push(line);
            self.close_group().await?;
        } else if self.group.len() < MAX_GROUP_LINES - 1 {
            self.group.push(line);
        } else if !self.group_capped {
            self.group_capped = true;
            self.group.push("...".to_string());
        }
        Ok(())
    }

    async fn handle_urc(&mut self, line: &str) -> Result<()> {
        debug!("URC {line}");
        if let Some(data) = line.strip_prefix("+CSQ:") {
            self.apply_csq(data.trim()).await?;
        } else if let Some(data) = line.strip_prefix("+CREG:") {
            self.apply_registration("reg", data.trim(), false, Source::Creg)
                .await?;
        } else if let Some(data) = line.strip_prefix("+CGREG:") {
            self.apply_registration("greg", data.trim(), false, Source::Cgreg)
                .await?;
        } else if line == "PB DONE" || line == "SMS DONE" {
            self.operator_list_ready().await?;
        } else if line.starts_with("RING") {
            self.broker.publish_event("raw/at", line).await?;
        } else if line == "NO CARRIER" {
            // call dropped; ask for the extended error report if enabled
            if self.opts.ceer {
                self.enqueue_unique("AT+CEER").await?;
            }
        } else if line.starts_with("+SIMCARD: NOT AVAILABLE") {
            self.sim_removed().await?;
        } else if let Some(data) = line.strip_prefix("+FTPSGET:") {
            self.broker.publish_event("raw/ftpsget", data.trim()).await?;
        } else if let Some(data) = line.strip_prefix("+CEER:") {
            self.broker.publish_event("warn", data.trim()).await?;
        } else if line.starts_with("+CPIN:") && line.contains("READY") {
            self.sim_ready().await?;
        } else if line.starts_with("+COPN:") {
            self.resolve_sim_operator().await?;
        } else if let Some(data) = line.strip_prefix("*CNTI:") {
            self.apply_cnti(data.trim()).await?;
        } else {
            debug!("unhandled URC '{line}'");
        }
        Ok(())
    }

    /// A terminator arrived: pair the group with the queue head,
    /// publish the raw exchange, dispatch the handler, advance.
    async fn close_group(&mut self) -> Result<()> {
        let lines = std::mem::take(&mut self.group);
        self.group_capped = false;
        let terminator = lines.last().cloned().unwrap_or_default();

        let cmd = if self.queue.is_pending() {
            self.timers.cancel(&AtTimer::CommandTimeout);
            self.queue.note_success();
            self.queue.pop().map(|c| c.text)
        } else {
            None
        };

        if terminator == "OK" {
            if let Some(cmd) = &cmd {
                self.handle_response(cmd, &lines).await?;
            }
        } else if let Some(cmd) = &cmd {
            warn!("'{cmd}': {terminator}");
            self.broker
                .publish_event("fail", &format!("{cmd}: {terminator}"))
                .await?;
            if self.opts.ceer {
                self.enqueue_unique("AT+CEER").await?;
            }
        }

        let mut raw = cmd.unwrap_or_default();
        for line in &lines {
            if !raw.is_empty() {
                raw.push('\t');
            }
            raw.push_str(line);
        }
        self.broker.publish_event("raw/at", &raw).await?;

        self.maybe_write_head().await
    }

    async fn handle_response(&mut self, cmd: &str, lines: &[String]) -> Result<()> {
        let upper = cmd.trim().to_ascii_uppercase();
        match upper.as_str() {
            "AT+CSQ" => {
                if let Some(data) = payload(lines, "+CSQ:") {
                    self.apply_csq(&data).await?;
                }
            }
            "AT+CREG?" => {
                if let Some(data) = payload(lines, "+CREG:") {
                    self.apply_registration("reg", &data, true, Source::Creg)
                        .await?;
                }
            }
            "AT+CGREG?" => {
                if let Some(data) = payload(lines, "+CGREG:") {
                    self.apply_registration("greg", &data, true, Source::Cgreg)
                        .await?;
                }
            }
            "AT+COPS?" => {
                if let Some(data) = payload(lines, "+COPS:") {
                    self.apply_current_operator(&data).await?;
                }
            }
            "AT+COPS=?" => {
                if let Some(data) = payload(lines, "+COPS:") {
                    let listing = vocab::parse_cops_listing(&data);
                    self.broker
                        .publish_if_changed("ops", Some(vocab::ops_value(&listing).as_str()))
                        .await?;
                }
            }
            "AT+CPIN?" => {
                if lines.iter().any(|l| l.contains("READY")) {
                    self.sim_ready().await?;
                }
            }
            "AT+CGMI" => {
                if let Some(value) = info_line(lines) {
                    self.broker.publish_if_changed("brand", Some(value.as_str())).await?;
                    self.brand = Some(value);
                    self.evaluate_quirks();
                }
            }
            "AT+CGMM" => {
                if let Some(value) = info_line(lines) {
                    self.broker.publish_if_changed("model", Some(value.as_str())).await?;
                    self.model = Some(value);
                    self.evaluate_quirks();
                }
            }
            "AT+CGMR" => {
                if let Some(value) = info_line(lines) {
                    self.broker.publish_if_changed("rev", Some(value.as_str())).await?;
                }
            }
            "AT+CGSN" => {
                if let Some(value) = info_line(lines) {
                    self.broker.publish_if_changed("imei", Some(value.as_str())).await?;
                }
            }
            "AT+CCID" => {
                let iccid = payload(lines, "+CCID:").or_else(|| info_line(lines));
                if let Some(iccid) = iccid {
                    self.broker
                        .publish_if_changed("iccid", Some(iccid.trim()))
                        .await?;
                }
            }
            "AT+CIMI" => {
                if let Some(imsi) = info_line(lines) {
                    self.broker.publish_if_changed("imsi", Some(imsi.as_str())).await?;
                    self.imsi = Some(imsi);
                    self.sim_operator_resolved = false;
                    self.resolve_sim_operator().await?;
                }
            }
            "AT+CNUM" => {
                if let Some(number) = payload(lines, "+CNUM:").and_then(|d| vocab::parse_cnum(&d)) {
                    self.broker.publish_if_changed("number", Some(number.as_str())).await?;
                }
            }
            "AT+CSPN?" => {
                if let Some(name) = payload(lines, "+CSPN:").and_then(|d| vocab::parse_cspn(&d)) {
                    self.broker.publish_if_changed("simop", Some(name.as_str())).await?;
                }
            }
            "AT+COPN" => {
                debug!("operator table: {} entries", self.operators.len());
                self.resolve_sim_operator().await?;
            }
            "AT+CEER" => {
                if let Some(text) = payload(lines, "+CEER:") {
                    self.broker.publish_event("warn", text.trim()).await?;
                }
            }
            _ if upper.starts_with("AT*CNTI") => {
                if let Some(data) = payload(lines, "*CNTI:") {
                    self.apply_cnti(&data).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn apply_csq(&mut self, data: &str) -> Result<()> {
        let Some((rssi, ber)) = vocab::parse_csq(data) else {
            return Ok(());
        };
        let rssi_value = vocab::rssi_dbm(rssi).map(|v| v.to_string());
        self.broker
            .publish_if_changed("rssi", rssi_value.as_deref())
            .await?;
        self.broker
            .publish_if_changed("ber", vocab::ber_bucket(ber))
            .await?;
        Ok(())
    }

    async fn apply_registration(
        &mut self,
        topic: &str,
        data: &str,
        solicited: bool,
        source: Source,
    ) -> Result<()> {
        let Some(reg) = vocab::parse_registration(data, solicited) else {
            return Ok(());
        };
        self.broker
            .publish_if_changed(topic, vocab::reg_status(reg.stat))
            .await?;
        if self.lac.update(source, reg.lac.is_some()) {
            self.broker
                .publish_if_changed("lac", reg.lac.as_deref())
                .await?;
        }
        if self.cellid.update(source, reg.cellid.is_some()) {
            self.broker
                .publish_if_changed("cellid", reg.cellid.as_deref())
                .await?;
        }
        if let Some(raw) = reg.nt {
            let mapped = vocab::technology(raw, self.simcom);
            if self.nt.update(source, mapped.is_some()) {
                self.broker.publish_if_changed("nt", mapped).await?;
            }
        }
        Ok(())
    }

    async fn apply_current_operator(&mut self, data: &str) -> Result<()> {
        let cur = vocab::parse_cops_current(data);
        match cur.oper {
            Some(oper) if oper.chars().all(|c| c.is_ascii_digit()) => {
                let name = self.operators.name(&oper).map(str::to_string);
                self.broker.publish_if_changed("opid", Some(oper.as_str())).await?;
                self.broker
                    .publish_if_changed("op", Some(name.as_deref().unwrap_or(&oper)))
                    .await?;
            }
            Some(oper) => {
                self.broker.publish_if_changed("op", Some(oper.as_str())).await?;
            }
            None => {
                self.broker.publish_if_changed("opid", None).await?;
                self.broker.publish_if_changed("op", None).await?;
            }
        }
        if let Some(raw) = cur.nt {
            let mapped = vocab::technology(raw, self.simcom);
            if self.nt.update(Source::Cops, mapped.is_some()) {
                self.broker.publish_if_changed("nt", mapped).await?;
            }
        }
        Ok(())
    }

    async fn apply_cnti(&mut self, data: &str) -> Result<()> {
        // *CNTI: 0,<tech> — publish the literal technology string.
        let Some(tech) = data.strip_prefix("0,").map(str::trim) else {
            return Ok(());
        };
        if self.nt.update(Source::Cops, !tech.is_empty()) {
            let value = (!tech.is_empty()).then_some(tech);
            self.broker.publish_if_changed("nt", value).await?;
        }
        Ok(())
    }

    /// `+CPIN: READY` — burst the SIM identity queries.
    async fn sim_ready(&mut self) -> Result<()> {
        self.enqueue_unique("AT+CSPN?").await?;
        self.enqueue_unique("AT+CCID").await?;
        self.enqueue_unique("AT+CIMI").await?;
        self.enqueue_unique("AT+CNUM").await?;
        if self.simcom && !self.pb_done {
            // SIMCOM: the name download fails until the SIM finishes
            // loading; wait for PB DONE, or fake one after 10 s.
            self.copn_deferred = true;
            if !self.timers.is_scheduled(&AtTimer::OperatorListFallback) {
                self.timers
                    .schedule(OPERATOR_LIST_FALLBACK, AtTimer::OperatorListFallback);
            }
        } else {
            self.enqueue_unique("AT+COPN").await?;
        }
        Ok(())
    }

    /// `PB DONE` / `SMS DONE` observed or faked.
    async fn operator_list_ready(&mut self) -> Result<()> {
        self.pb_done = true;
        self.timers.cancel(&AtTimer::OperatorListFallback);
        if self.copn_deferred {
            self.copn_deferred = false;
            self.enqueue_unique("AT+COPN").await?;
        }
        Ok(())
    }

    /// Map the IMSI through the operator table onto simop/simopid.
    async fn resolve_sim_operator(&mut self) -> Result<()> {
        if self.sim_operator_resolved {
            return Ok(());
        }
        let Some(imsi) = self.imsi.clone() else {
            return Ok(());
        };
        if let Some((id, name)) = self.operators.resolve_imsi(&imsi) {
            let (id, name) = (id.to_string(), name.to_string());
            self.broker.publish_if_changed("simopid", Some(id.as_str())).await?;
            self.broker.publish_if_changed("simop", Some(name.as_str())).await?;
            self.sim_operator_resolved = true;
        }
        Ok(())
    }

    /// `+SIMCARD: NOT AVAILABLE` — drop everything the SIM provided.
    async fn sim_removed(&mut self) -> Result<()> {
        warn!("SIM removed");
        for topic in ["iccid", "imsi", "number", "simop", "simopid", "ops"] {
            self.broker.publish_if_changed(topic, None).await?;
        }
        self.operators.clear();
        self.imsi = None;
        self.sim_operator_resolved = false;
        self.pb_done = false;
        Ok(())
    }

    fn evaluate_quirks(&mut self) {
        let auto_simcom = self
            .brand
            .as_deref()
            .is_some_and(|b| b.to_ascii_uppercase().contains("SIMCOM"));
        let auto_detached = self
            .model
            .as_deref()
            .is_some_and(|m| m.to_ascii_uppercase().contains("SIM75"));
        let simcom = self.opts.simcom.unwrap_or(auto_simcom);
        let detached = self.opts.detached_scan.unwrap_or(auto_detached);
        if simcom != self.simcom {
            info!("SIMCOM quirk {}", if simcom { "on" } else { "off" });
            self.simcom = simcom;
        }
        if detached != self.detached_scan {
            info!("detached-scan quirk {}", if detached { "on" } else { "off" });
            self.detached_scan = detached;
        }
    }

    /// `ops/scan` request: network scan, detaching first when the quirk
    /// asks for it.
    async fn request_scan(&mut self) -> Result<()> {
        if self.detached_scan {
            self.enqueue_unique("AT+COPS=2").await?;
            self.enqueue_unique("AT+COPS=?").await?;
            self.enqueue_unique("AT+COPS=0").await?;
        } else {
            self.enqueue_unique("AT+COPS=?").await?;
        }
        Ok(())
    }

    async fn on_broker(&mut self, msg: Incoming) -> Result<()> {
        let Some(suffix) = self.broker.strip_prefix(&msg.topic) else {
            return Ok(());
        };
        match suffix {
            "raw/send" => {
                let cmd = msg.payload.trim();
                if !cmd.is_empty() {
                    self.enqueue(cmd).await?;
                }
            }
            "ops/scan" => self.request_scan().await?,
            _ => {}
        }
        Ok(())
    }
}

/// First line carrying the given `+XXX:` prefix, with the payload
/// trimmed.
fn payload(lines: &[String], prefix: &str) -> Option<String> {
    lines
        .iter()
        .find_map(|l| l.strip_prefix(prefix))
        .map(|d| d.trim().to_string())
}

/// First plain information line: not a terminator, no `+`/`*` lead.
fn info_line(lines: &[String]) -> Option<String> {
    lines
        .iter()
        .map(|l| l.trim())
        .find(|l| {
            !l.is_empty()
                && !vocab::is_terminator(l)
                && !l.starts_with('+')
                && !l.starts_with('*')
        })
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_response_first_line() {
        assert_eq!(
            classify_line(Some("AT+CSQ"), "+CSQ: 12,3"),
            LineClass::Response
        );
        assert_eq!(
            classify_line(Some("AT+CREG?"), "+CREG: 1,5"),
            LineClass::Response
        );
    }

    #[test]
    fn test_classify_foreign_plus_line_is_urc() {
        assert_eq!(classify_line(Some("AT+CSQ"), "+CREG: 2"), LineClass::Urc);
        assert_eq!(classify_line(None, "+CSQ: 12,3"), LineClass::Urc);
    }

    #[test]
    fn test_classify_no_carrier_duality() {
        assert_eq!(classify_line(Some("ATD*99#"), "NO CARRIER"), LineClass::Response);
        assert_eq!(classify_line(None, "NO CARRIER"), LineClass::Urc);
    }

    #[test]
    fn test_classify_vendor_end_markers() {
        assert_eq!(classify_line(Some("AT+COPN"), "PB DONE"), LineClass::Urc);
        assert_eq!(classify_line(None, "SMS DONE"), LineClass::Urc);
        assert_eq!(classify_line(None, "RING"), LineClass::Urc);
    }

    #[test]
    fn test_classify_cme_error_is_response() {
        assert_eq!(
            classify_line(Some("AT+CPIN?"), "+CME ERROR: 10"),
            LineClass::Response
        );
    }

    #[test]
    fn test_classify_plain_text_accumulates() {
        assert_eq!(classify_line(Some("AT+CGMI"), "SIMCOM_Ltd"), LineClass::Response);
        assert_eq!(classify_line(None, "spurious"), LineClass::Response);
    }

    #[test]
    fn test_sourced_precedence() {
        let mut s = Sourced::default();
        assert!(s.update(Source::Creg, true));
        assert!(s.update(Source::Cgreg, true));
        // lower priority rejected while a higher source holds a value
        assert!(!s.update(Source::Creg, true));
        assert!(!s.update(Source::Cops, true));
        // same priority keeps winning
        assert!(s.update(Source::Cgreg, true));
    }

    #[test]
    fn test_sourced_clear_reopens_slot() {
        let mut s = Sourced::default();
        assert!(s.update(Source::Cgreg, true));
        assert!(s.update(Source::Cgreg, false));
        // cleared slot accepts any source again
        assert!(s.update(Source::Cops, true));
        assert!(s.update(Source::Cgreg, true));
    }

    #[test]
    fn test_payload_and_info_line() {
        let lines: Vec<String> = vec![
            "+CSQ: 12,3".into(),
            "OK".into(),
        ];
        assert_eq!(payload(&lines, "+CSQ:").as_deref(), Some("12,3"));
        let id: Vec<String> = vec!["SIMCOM_Ltd".into(), "OK".into()];
        assert_eq!(info_line(&id).as_deref(), Some("SIMCOM_Ltd"));
        assert_eq!(info_line(&lines[1..]), None);
    }
}
