//! wpa_supplicant control socket.
//!
//! The control interface is a UNIX datagram socket per interface under
//! `/var/run/wpa_supplicant/`. The client binds its own unique path so
//! the supplicant can address replies, connects, and goes non-blocking;
//! the bound path is unlinked again on drop.

use std::io;
use std::path::PathBuf;

use tracing::info;

use crate::serial::WriteOutcome;
use crate::{Error, Result};

/// Where the supplicant exposes its per-interface sockets.
const CTRL_DIR: &str = "/var/run/wpa_supplicant";

/// A connected, non-blocking control socket.
pub struct WpaSocket {
    sock: tokio::net::UnixDatagram,
    local_path: PathBuf,
    iface: String,
}

impl WpaSocket {
    /// Connect to the control socket of `iface`.
    pub fn connect(iface: &str) -> Result<Self> {
        let ctrl = format!("{CTRL_DIR}/{iface}");
        let local_path = std::env::temp_dir().join(format!(
            "wifitomqtt-{iface}-{}",
            std::process::id()
        ));
        // A previous crash may have left the path behind.
        let _ = std::fs::remove_file(&local_path);

        let sock = std::os::unix::net::UnixDatagram::bind(&local_path)
            .map_err(|e| Error::Device(format!("bind {}: {e}", local_path.display())))?;
        sock.connect(&ctrl)
            .map_err(|e| Error::Device(format!("connect {ctrl}: {e}")))?;
        sock.set_nonblocking(true)?;
        let sock = tokio::net::UnixDatagram::from_std(sock)?;

        info!("wpa_supplicant {ctrl}: connected");

        Ok(Self {
            sock,
            local_path,
            iface: iface.to_string(),
        })
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    /// Receive one datagram (= one logical frame).
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.recv(buf).await
    }

    /// One non-blocking send attempt of a whole command frame.
    pub fn try_send(&self, data: &[u8]) -> io::Result<WriteOutcome> {
        match self.sock.try_send(data) {
            Ok(n) if n == data.len() => Ok(WriteOutcome::Done),
            Ok(n) => Ok(WriteOutcome::Short(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(WriteOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }
}

impl Drop for WpaSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.local_path);
    }
}
