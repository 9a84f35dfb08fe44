//! Outbound command FIFO.
//!
//! Both dialects funnel every device-bound command through one
//! [`CommandQueue`]. The head entry is the only one ever on the wire:
//! it is marked *pending* once written and popped exactly once, on its
//! response terminator or on timeout. Periodic pollers use
//! [`CommandQueue::enqueue_unique`] so a slow modem does not accumulate
//! identical polls.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// How a command behaves once written, mostly its timeout budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Ordinary request/response exchange.
    Regular,
    /// Long-running network scan (`AT+COPS=?`).
    Scan,
    /// Operator re-registration (`AT+COPS=…`).
    Reregister,
    /// Liveness probe (wpa `PING` / `SIGNAL_POLL`).
    Keepalive,
}

/// One queued outbound command.
#[derive(Debug)]
pub struct Command {
    pub text: String,
    pub class: CommandClass,
    pub enqueued_at: Instant,
}

impl Command {
    /// Timeout budget once this command is on the wire.
    pub fn timeout(&self, default: Duration) -> Duration {
        match self.class {
            CommandClass::Scan => Duration::from_secs(180),
            CommandClass::Reregister => Duration::from_secs(60),
            CommandClass::Regular | CommandClass::Keepalive => default,
        }
    }
}

/// Classify an AT command line by its timeout behavior.
pub fn classify_at(text: &str) -> CommandClass {
    let upper = text.trim().to_ascii_uppercase();
    if upper == "AT+COPS=?" {
        CommandClass::Scan
    } else if upper.starts_with("AT+COPS=") {
        CommandClass::Reregister
    } else {
        CommandClass::Regular
    }
}

/// FIFO of pending outbound commands.
#[derive(Debug, Default)]
pub struct CommandQueue {
    entries: VecDeque<Command>,
    head_pending: bool,
    consecutive_timeouts: u32,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command. Returns true when the queue was idle, i.e. the
    /// caller should start writing the head now.
    pub fn enqueue(&mut self, text: String, class: CommandClass) -> bool {
        let was_idle = self.entries.is_empty();
        self.entries.push_back(Command {
            text,
            class,
            enqueued_at: Instant::now(),
        });
        was_idle
    }

    /// Append only when no queued entry carries identical text.
    /// Returns true when the queue was idle and the entry went in.
    pub fn enqueue_unique(&mut self, text: String, class: CommandClass) -> bool {
        if self.entries.iter().any(|c| c.text == text) {
            return false;
        }
        self.enqueue(text, class)
    }

    pub fn head(&self) -> Option<&Command> {
        self.entries.front()
    }

    /// Remove the head. Resets the pending flag; the caller decides
    /// whether this pop was a success (`note_success`) or a timeout
    /// (`note_timeout`).
    pub fn pop(&mut self) -> Option<Command> {
        self.head_pending = false;
        self.entries.pop_front()
    }

    /// Mark the head as written and awaiting its response.
    pub fn mark_pending(&mut self) {
        debug_assert!(!self.entries.is_empty());
        self.head_pending = true;
    }

    /// True when the head has been written and its response is awaited.
    pub fn is_pending(&self) -> bool {
        self.head_pending
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate queued entries, head first.
    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.entries.iter()
    }

    /// Record a completed response; clears the timeout streak.
    pub fn note_success(&mut self) {
        self.consecutive_timeouts = 0;
    }

    /// Record a command timeout; returns the current streak length.
    pub fn note_timeout(&mut self) -> u32 {
        self.consecutive_timeouts += 1;
        self.consecutive_timeouts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut q = CommandQueue::new();
        assert!(q.enqueue("AT".into(), CommandClass::Regular));
        assert!(!q.enqueue("ATE0".into(), CommandClass::Regular));
        assert_eq!(q.pop().unwrap().text, "AT");
        assert_eq!(q.pop().unwrap().text, "ATE0");
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_enqueue_unique_skips_duplicates() {
        let mut q = CommandQueue::new();
        q.enqueue("AT+CSQ".into(), CommandClass::Regular);
        assert!(!q.enqueue_unique("AT+CSQ".into(), CommandClass::Regular));
        assert_eq!(q.len(), 1);
        assert!(!q.enqueue_unique("AT+CREG?".into(), CommandClass::Regular));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_classify_at() {
        assert_eq!(classify_at("AT+COPS=?"), CommandClass::Scan);
        assert_eq!(classify_at("at+cops=?"), CommandClass::Scan);
        assert_eq!(classify_at("AT+COPS=0"), CommandClass::Reregister);
        assert_eq!(classify_at("AT+COPS=2"), CommandClass::Reregister);
        assert_eq!(classify_at("AT+COPS?"), CommandClass::Regular);
        assert_eq!(classify_at("AT+CSQ"), CommandClass::Regular);
    }

    #[test]
    fn test_timeout_classes() {
        let default = Duration::from_secs(5);
        let mk = |text: &str| Command {
            text: text.into(),
            class: classify_at(text),
            enqueued_at: Instant::now(),
        };
        assert_eq!(mk("AT+CSQ").timeout(default), Duration::from_secs(5));
        assert_eq!(mk("AT+COPS=0").timeout(default), Duration::from_secs(60));
        assert_eq!(mk("AT+COPS=?").timeout(default), Duration::from_secs(180));
    }

    #[test]
    fn test_timeout_streak_resets_on_success() {
        let mut q = CommandQueue::new();
        assert_eq!(q.note_timeout(), 1);
        assert_eq!(q.note_timeout(), 2);
        q.note_success();
        assert_eq!(q.note_timeout(), 1);
    }

    #[test]
    fn test_pending_flag() {
        let mut q = CommandQueue::new();
        q.enqueue("PING".into(), CommandClass::Keepalive);
        assert!(!q.is_pending());
        q.mark_pending();
        assert!(q.is_pending());
        q.pop();
        assert!(!q.is_pending());
    }
}
