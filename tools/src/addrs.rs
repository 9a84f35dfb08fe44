//! Interface-address collection for ifaddrtomqtt.
//!
//! Link-local addresses are noise on the `addr` topics: IPv4
//! 169.254/16 and anything IPv6 whose text form starts `fe` (the
//! original daemon's filter) are skipped.

use std::collections::BTreeMap;

/// True when `addr` (already rendered as text) should be published.
pub fn publishable(addr: &str) -> bool {
    if addr.contains(':') {
        !addr.starts_with("fe")
    } else {
        !addr.starts_with("169.254.")
    }
}

/// Fold `(interface, address)` pairs into the per-interface
/// space-joined values the `net/<ifname>/addr` topics carry.
pub fn compose<I>(pairs: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (iface, addr) in pairs {
        if !publishable(&addr) {
            continue;
        }
        let slot = out.entry(iface).or_default();
        if !slot.is_empty() {
            slot.push(' ');
        }
        slot.push_str(&addr);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publishable_filters_link_local() {
        assert!(publishable("192.168.1.10"));
        assert!(!publishable("169.254.12.34"));
        assert!(publishable("2001:db8::1"));
        assert!(!publishable("fe80::1"));
        // the original filter is deliberately broad for v6
        assert!(!publishable("fec0::1"));
    }

    #[test]
    fn test_compose_joins_per_interface() {
        let map = compose(vec![
            ("eth0".to_string(), "192.168.1.10".to_string()),
            ("eth0".to_string(), "2001:db8::1".to_string()),
            ("wlan0".to_string(), "10.0.0.2".to_string()),
            ("wlan0".to_string(), "fe80::2".to_string()),
        ]);
        assert_eq!(map.get("eth0").unwrap(), "192.168.1.10 2001:db8::1");
        assert_eq!(map.get("wlan0").unwrap(), "10.0.0.2");
    }

    #[test]
    fn test_compose_drops_interface_with_only_link_local() {
        let map = compose(vec![("lo".to_string(), "fe80::1".to_string())]);
        assert!(map.is_empty());
    }
}
