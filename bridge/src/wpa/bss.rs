//! BSS (access point) table.
//!
//! Records are keyed by canonical lowercase BSSID. Flags combine what
//! the supplicant reports for the BSS (security) with overlays from the
//! network table (known/disabled); `PRESENT` only exists during a
//! `SCAN_RESULTS` reconciliation pass.

use std::collections::BTreeMap;

use bitflags::bitflags;

bitflags! {
    /// Per-BSS flag set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BssFlags: u8 {
        const WPA      = 1 << 0;
        const WEP      = 1 << 1;
        const EAP      = 1 << 2;
        const KNOWN    = 1 << 3;
        const DISABLED = 1 << 4;
        const PRESENT  = 1 << 5;
    }
}

impl BssFlags {
    /// Derive security flags from the supplicant's capability string,
    /// e.g. `[WPA2-PSK-CCMP][ESS]`.
    pub fn from_capabilities(caps: &str) -> Self {
        let mut flags = Self::empty();
        if caps.contains("WPA") {
            flags |= Self::WPA;
        }
        if caps.contains("WEP") {
            flags |= Self::WEP;
        }
        if caps.contains("EAP") {
            flags |= Self::EAP;
        }
        flags
    }

    /// Published representation: five fixed positions
    /// `[wpa][wep][eap][known][disabled]`, `-` when unset.
    pub fn flags_str(self) -> String {
        let mut out = String::with_capacity(5);
        out.push(if self.contains(Self::WPA) { 'w' } else { '-' });
        out.push(if self.contains(Self::WEP) { 'W' } else { '-' });
        out.push(if self.contains(Self::EAP) { 'e' } else { '-' });
        out.push(if self.contains(Self::KNOWN) { 'k' } else { '-' });
        out.push(if self.contains(Self::DISABLED) { 'd' } else { '-' });
        out
    }
}

/// Format a frequency reported in MHz the way the topics carry it:
/// gigahertz with kHz precision (`2437` → `2.437G`).
pub fn format_freq(mhz: u32) -> String {
    format!("{:.3}G", f64::from(mhz) * 1e-3)
}

/// Canonical BSSID form: lowercase.
pub fn canonical_bssid(bssid: &str) -> String {
    bssid.trim().to_ascii_lowercase()
}

/// One access point.
#[derive(Debug, Default)]
pub struct BssRecord {
    pub ssid: Option<String>,
    pub freq_mhz: Option<u32>,
    pub level: Option<i32>,
    pub flags: BssFlags,
}

/// All currently known access points.
#[derive(Debug, Default)]
pub struct BssTable {
    by_bssid: BTreeMap<String, BssRecord>,
}

impl BssTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bssid: &str) -> Option<&BssRecord> {
        self.by_bssid.get(&canonical_bssid(bssid))
    }

    /// Fetch-or-create the record for `bssid`.
    pub fn upsert(&mut self, bssid: &str) -> &mut BssRecord {
        self.by_bssid.entry(canonical_bssid(bssid)).or_default()
    }

    pub fn remove(&mut self, bssid: &str) -> Option<BssRecord> {
        self.by_bssid.remove(&canonical_bssid(bssid))
    }

    pub fn contains(&self, bssid: &str) -> bool {
        self.by_bssid.contains_key(&canonical_bssid(bssid))
    }

    pub fn len(&self) -> usize {
        self.by_bssid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_bssid.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BssRecord)> {
        self.by_bssid.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut BssRecord)> {
        self.by_bssid.iter_mut()
    }

    /// Start a `SCAN_RESULTS` reconciliation: everything is absent
    /// until listed again.
    pub fn begin_reconcile(&mut self) {
        for record in self.by_bssid.values_mut() {
            record.flags.remove(BssFlags::PRESENT);
        }
    }

    /// Mark one listed BSSID present (creating it if brand new).
    pub fn mark_present(&mut self, bssid: &str) {
        self.upsert(bssid).flags.insert(BssFlags::PRESENT);
    }

    /// Drop everything not re-listed; returns the removed BSSIDs so
    /// their topics can be cleared.
    pub fn drop_absent(&mut self) -> Vec<String> {
        let gone: Vec<String> = self
            .by_bssid
            .iter()
            .filter(|(_, r)| !r.flags.contains(BssFlags::PRESENT))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &gone {
            self.by_bssid.remove(key);
        }
        gone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_from_capabilities() {
        assert_eq!(
            BssFlags::from_capabilities("[WPA2-PSK-CCMP][ESS]"),
            BssFlags::WPA
        );
        assert_eq!(
            BssFlags::from_capabilities("[WEP][ESS]"),
            BssFlags::WEP
        );
        assert_eq!(
            BssFlags::from_capabilities("[WPA2-EAP-CCMP]"),
            BssFlags::WPA | BssFlags::EAP
        );
        assert_eq!(BssFlags::from_capabilities("[ESS]"), BssFlags::empty());
    }

    #[test]
    fn test_flags_str_positions() {
        assert_eq!(BssFlags::WPA.flags_str(), "w----");
        assert_eq!((BssFlags::WPA | BssFlags::KNOWN).flags_str(), "w--k-");
        assert_eq!(
            (BssFlags::WEP | BssFlags::DISABLED).flags_str(),
            "-W--d"
        );
        // PRESENT is bookkeeping, never serialized
        assert_eq!(BssFlags::PRESENT.flags_str(), "-----");
    }

    #[test]
    fn test_format_freq() {
        assert_eq!(format_freq(2437), "2.437G");
        assert_eq!(format_freq(5180), "5.180G");
        assert_eq!(format_freq(0), "0.000G");
    }

    #[test]
    fn test_canonical_bssid() {
        assert_eq!(canonical_bssid("00:11:22:AA:BB:CC"), "00:11:22:aa:bb:cc");
    }

    #[test]
    fn test_reconciliation_closure() {
        let mut table = BssTable::new();
        table.upsert("00:11:22:33:44:55").level = Some(-55);
        table.upsert("66:77:88:99:aa:bb").level = Some(-70);
        table.upsert("cc:dd:ee:ff:00:11").level = Some(-80);

        table.begin_reconcile();
        table.mark_present("00:11:22:33:44:55");
        table.mark_present("cc:dd:ee:ff:00:11");
        let gone = table.drop_absent();

        assert_eq!(gone, vec!["66:77:88:99:aa:bb".to_string()]);
        assert_eq!(table.len(), 2);
        assert!(table.contains("00:11:22:33:44:55"));
        assert!(table.contains("cc:dd:ee:ff:00:11"));
    }

    #[test]
    fn test_reconcile_twice_is_stable() {
        let mut table = BssTable::new();
        table.mark_present("00:11:22:33:44:55");
        table.begin_reconcile();
        table.mark_present("00:11:22:33:44:55");
        assert!(table.drop_absent().is_empty());
        assert_eq!(table.len(), 1);
    }
}
