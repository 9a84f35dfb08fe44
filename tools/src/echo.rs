//! Matching `raw/at` exchanges against the command that caused them.
//!
//! The bridge publishes every completed AT exchange tab-joined:
//! `<command>\t<response line>…\t<terminator>`. atinsert recognizes its
//! own commands by the first field and judges success by the last.

/// True when `payload` is the exchange for exactly `cmd`.
pub fn matches_echo(cmd: &str, payload: &str) -> bool {
    match payload.split_once('\t') {
        Some((first, _)) => first == cmd,
        None => payload == cmd,
    }
}

/// True when the exchange ended in `OK`.
pub fn response_ok(payload: &str) -> bool {
    payload.rsplit('\t').next() == Some("OK")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_echo() {
        assert!(matches_echo("AT+CSQ", "AT+CSQ\t+CSQ: 12,3\tOK"));
        assert!(!matches_echo("AT+CSQ", "AT+CSQX\t+CSQ: 12,3\tOK"));
        assert!(!matches_echo("AT+CSQX", "AT+CSQ\tOK"));
        // a bare RING indication has no tabs
        assert!(!matches_echo("AT+CSQ", "RING"));
    }

    #[test]
    fn test_response_ok() {
        assert!(response_ok("AT+CSQ\t+CSQ: 12,3\tOK"));
        assert!(!response_ok("AT+CSQ\t+CME ERROR: 10"));
        assert!(!response_ok("AT+CSQ\tERROR"));
    }
}
