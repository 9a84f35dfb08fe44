//! Raw serial port plumbing for the AT dialect.
//!
//! The tty is opened non-blocking and configured raw (115200 8N1, no
//! flow control) with `IGNCR` set: the daemon emits `\r`-terminated
//! commands and the kernel strips incoming `\r`, so the line parser
//! only ever deals with `\n`. All I/O goes through a tokio `AsyncFd`;
//! nothing in this module blocks.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, SetArg};
use nix::unistd;
use tokio::io::unix::AsyncFd;
use tracing::info;

use crate::{Error, Result};

/// Outcome of a single non-blocking write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The whole buffer went out.
    Done,
    /// The descriptor is not accepting data right now.
    WouldBlock,
    /// Only `0..len` bytes were accepted.
    Short(usize),
}

/// A non-blocking serial device registered with the tokio reactor.
pub struct SerialPort {
    fd: AsyncFd<OwnedFd>,
    path: String,
}

impl SerialPort {
    /// Open and configure a modem tty.
    pub fn open(path: &str) -> Result<Self> {
        let raw = fcntl::open(
            path,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| Error::Device(format!("open {path}: {e}")))?;
        // SAFETY: raw is a freshly opened, owned descriptor.
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };

        configure_termios(owned.as_fd()).map_err(|e| Error::Device(format!("{path}: {e}")))?;

        // Drop whatever the modem pushed out before we attached.
        termios::tcflush(owned.as_fd(), termios::FlushArg::TCIOFLUSH)
            .map_err(|e| Error::Device(format!("tcflush {path}: {e}")))?;

        info!("Serial {path}: opened (115200 8N1, raw)");

        Ok(Self {
            fd: AsyncFd::new(owned)?,
            path: path.to_string(),
        })
    }

    /// Device path this port was opened from.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read available bytes, waiting for readiness first.
    /// Returns `Ok(0)` on EOF (modem unplugged).
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                unistd::read(inner.get_ref().as_raw_fd(), buf).map_err(io::Error::from)
            }) {
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(res) => return res,
                Err(_would_block) => continue,
            }
        }
    }

    /// One non-blocking write attempt. The caller re-arms a retry timer
    /// on [`WriteOutcome::WouldBlock`] and reports short writes.
    pub fn try_write(&self, data: &[u8]) -> io::Result<WriteOutcome> {
        match unistd::write(self.fd.get_ref().as_fd(), data) {
            Ok(n) if n == data.len() => Ok(WriteOutcome::Done),
            Ok(n) => Ok(WriteOutcome::Short(n)),
            Err(nix::errno::Errno::EAGAIN) => Ok(WriteOutcome::WouldBlock),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

/// Configure termios: raw mode, 115200 baud, 8N1, no flow control,
/// incoming `\r` stripped by the line discipline.
fn configure_termios(fd: BorrowedFd<'_>) -> std::result::Result<(), String> {
    let mut tio = termios::tcgetattr(fd).map_err(|e| format!("tcgetattr: {e}"))?;

    termios::cfmakeraw(&mut tio);

    termios::cfsetispeed(&mut tio, termios::BaudRate::B115200)
        .map_err(|e| format!("cfsetispeed: {e}"))?;
    termios::cfsetospeed(&mut tio, termios::BaudRate::B115200)
        .map_err(|e| format!("cfsetospeed: {e}"))?;

    // 8N1, CLOCAL (ignore modem control), CREAD (enable receiver)
    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS;

    // We write \r line endings and never want to see \r back: stripping
    // it here keeps the parser single-separator.
    tio.input_flags |= termios::InputFlags::IGNCR;

    termios::tcsetattr(fd, SetArg::TCSANOW, &tio).map_err(|e| format!("tcsetattr: {e}"))?;

    Ok(())
}

/// EAGAIN streak accounting for the device writer: the command is
/// retried every second, and after [`WriteBlockMeter::LIMIT`]
/// consecutive blocks the failure is reported (retries continue).
#[derive(Debug, Default)]
pub struct WriteBlockMeter {
    streak: u32,
}

impl WriteBlockMeter {
    /// Consecutive blocked writes before the failure is reported.
    pub const LIMIT: u32 = 10;

    /// Record a blocked write. Returns true exactly when the streak
    /// hits the reporting threshold.
    pub fn note_blocked(&mut self) -> bool {
        self.streak += 1;
        self.streak == Self::LIMIT
    }

    /// Record a successful write.
    pub fn reset(&mut self) {
        self.streak = 0;
    }
}

/// Expose the raw fd for diagnostics.
impl AsRawFd for SerialPort {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_block_meter_reports_once_at_limit() {
        let mut meter = WriteBlockMeter::default();
        for _ in 0..WriteBlockMeter::LIMIT - 1 {
            assert!(!meter.note_blocked());
        }
        assert!(meter.note_blocked());
        assert!(!meter.note_blocked());
    }

    #[test]
    fn test_write_block_meter_reset() {
        let mut meter = WriteBlockMeter::default();
        meter.note_blocked();
        meter.reset();
        for _ in 0..WriteBlockMeter::LIMIT - 1 {
            assert!(!meter.note_blocked());
        }
        assert!(meter.note_blocked());
    }
}
