//! Byte-stream to line conversion for the AT dialect.
//!
//! The tty strips incoming `\r` (IGNCR), but modems and stale buffers
//! still produce stray carriage returns, so lines are trimmed of `\r`
//! on both ends and empty lines are dropped. Partial trailing data
//! stays buffered until the next read. A single line that outgrows the
//! buffer means the device is spraying garbage — that is fatal.

use crate::{Error, Result};

/// Maximum bytes a single unterminated line may occupy.
const CAPACITY: usize = 16 * 1024;

/// Append-only accumulation buffer producing complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of raw bytes; returns every completed line.
    pub fn extend(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.pop(); // the \n itself
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim_matches('\r');
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }

        if self.buf.len() >= CAPACITY {
            return Err(Error::ParserOverflow);
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_and_trim() {
        let mut lb = LineBuffer::new();
        let lines = lb.extend(b"\r\n+CSQ: 12,3\r\n\r\nOK\r\n").unwrap();
        assert_eq!(lines, vec!["+CSQ: 12,3".to_string(), "OK".to_string()]);
    }

    #[test]
    fn test_partial_line_stays_buffered() {
        let mut lb = LineBuffer::new();
        assert!(lb.extend(b"+CRE").unwrap().is_empty());
        let lines = lb.extend(b"G: 1,5\r\n").unwrap();
        assert_eq!(lines, vec!["+CREG: 1,5".to_string()]);
    }

    #[test]
    fn test_multiple_chunks_multiple_lines() {
        let mut lb = LineBuffer::new();
        let lines = lb.extend(b"A\r\nB\r\nC").unwrap();
        assert_eq!(lines, vec!["A".to_string(), "B".to_string()]);
        let lines = lb.extend(b"\r\n").unwrap();
        assert_eq!(lines, vec!["C".to_string()]);
    }

    #[test]
    fn test_overflow_is_fatal() {
        let mut lb = LineBuffer::new();
        let chunk = vec![b'x'; 16 * 1024];
        assert!(matches!(lb.extend(&chunk), Err(Error::ParserOverflow)));
    }

    #[test]
    fn test_just_under_capacity_survives() {
        let mut lb = LineBuffer::new();
        let chunk = vec![b'x'; 16 * 1024 - 1];
        assert!(lb.extend(&chunk).unwrap().is_empty());
        let lines = lb.extend(b"\r\n").unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), 16 * 1024 - 1);
    }
}
