//! Configured-network table.
//!
//! Confirmed networks are keyed by the id wpa_supplicant assigned. A
//! network created through the broker holds a creation-sequence number
//! instead while its `ADD_NETWORK` is in flight, buffering its config
//! pairs; once the id response arrives the oldest pending record is
//! confirmed and its buffer flushed in insertion order.

/// Network operating mode as wpa_supplicant numbers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    #[default]
    Station,
    Ap,
    Mesh,
}

impl NetworkMode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Station),
            2 => Some(Self::Ap),
            5 => Some(Self::Mesh),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            Self::Station => 0,
            Self::Ap => 2,
            Self::Mesh => 5,
        }
    }
}

/// The live connection role, derived from events and `STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    None,
    Station,
    Ap,
    Mesh,
}

impl Role {
    /// The network mode this role selects when aggregating `wifistate`.
    pub fn mode_filter(self) -> NetworkMode {
        match self {
            Role::Ap => NetworkMode::Ap,
            Role::Mesh => NetworkMode::Mesh,
            Role::Station | Role::None => NetworkMode::Station,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::None => "none",
            Role::Station => "station",
            Role::Ap => "AP",
            Role::Mesh => "mesh",
        }
    }
}

/// One configured (or in-flight) network.
#[derive(Debug, Default)]
pub struct NetworkRecord {
    /// wpa-assigned id once confirmed.
    pub id: Option<i32>,
    /// Creation order while `ADD_NETWORK` is outstanding.
    pub seq: Option<u64>,
    pub ssid: String,
    pub mode: NetworkMode,
    pub disabled: bool,
    /// Buffered `SET_NETWORK` pairs, flushed in insertion order.
    pub pending_config: Vec<(String, String)>,
    pub pending_select: bool,
    pub pending_enable: bool,
    pub pending_remove: bool,
}

impl NetworkRecord {
    /// Buffer a config pair, replacing an earlier value for the key.
    pub fn buffer(&mut self, key: &str, value: &str) {
        if let Some(slot) = self.pending_config.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value.to_string();
        } else {
            self.pending_config
                .push((key.to_string(), value.to_string()));
        }
    }
}

/// All networks the supplicant (or our buffer) knows.
#[derive(Debug, Default)]
pub struct NetworkTable {
    records: Vec<NetworkRecord>,
    next_seq: u64,
}

impl NetworkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every confirmed record (pending creations survive a
    /// `LIST_NETWORKS` rebuild).
    pub fn clear_confirmed(&mut self) {
        self.records.retain(|r| r.id.is_none());
    }

    /// Add a confirmed network from a `LIST_NETWORKS` line. Returns
    /// false when the ssid already exists (duplicate to be culled).
    pub fn add_confirmed(&mut self, id: i32, ssid: &str) -> bool {
        if self.by_ssid(ssid).is_some() {
            return false;
        }
        self.records.push(NetworkRecord {
            id: Some(id),
            ssid: ssid.to_string(),
            ..NetworkRecord::default()
        });
        true
    }

    /// Create a buffering record for a network that does not exist yet.
    pub fn create_pending(&mut self, ssid: &str) -> &mut NetworkRecord {
        self.next_seq += 1;
        self.records.push(NetworkRecord {
            seq: Some(self.next_seq),
            ssid: ssid.to_string(),
            disabled: true,
            ..NetworkRecord::default()
        });
        self.records.last_mut().unwrap()
    }

    /// Confirm the oldest pending creation with the id wpa assigned.
    pub fn confirm_oldest(&mut self, id: i32) -> Option<&mut NetworkRecord> {
        let idx = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.id.is_none() && r.seq.is_some())
            .min_by_key(|(_, r)| r.seq)?
            .0;
        let record = &mut self.records[idx];
        record.id = Some(id);
        record.seq = None;
        Some(record)
    }

    pub fn by_ssid(&self, ssid: &str) -> Option<&NetworkRecord> {
        self.records.iter().find(|r| r.ssid == ssid)
    }

    pub fn by_ssid_mut(&mut self, ssid: &str) -> Option<&mut NetworkRecord> {
        self.records.iter_mut().find(|r| r.ssid == ssid)
    }

    pub fn by_id(&self, id: i32) -> Option<&NetworkRecord> {
        self.records.iter().find(|r| r.id == Some(id))
    }

    pub fn by_id_mut(&mut self, id: i32) -> Option<&mut NetworkRecord> {
        self.records.iter_mut().find(|r| r.id == Some(id))
    }

    pub fn remove_id(&mut self, id: i32) {
        self.records.retain(|r| r.id != Some(id));
    }

    pub fn remove_ssid(&mut self, ssid: &str) {
        self.records.retain(|r| r.ssid != ssid);
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkRecord> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NetworkRecord> {
        self.records.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Aggregate `wifistate`: `off` exactly when every network matching the
/// role's mode filter is disabled; otherwise the live role.
pub fn derive_wifistate(role: Role, networks: &NetworkTable) -> &'static str {
    let filter = role.mode_filter();
    let all_disabled = networks
        .iter()
        .filter(|n| n.mode == filter)
        .all(|n| n.disabled);
    if all_disabled {
        "off"
    } else {
        role.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_confirmed_rejects_duplicate_ssid() {
        let mut t = NetworkTable::new();
        assert!(t.add_confirmed(0, "home"));
        assert!(!t.add_confirmed(3, "home"));
        assert_eq!(t.iter().count(), 1);
    }

    #[test]
    fn test_pending_confirm_flushes_oldest_first() {
        let mut t = NetworkTable::new();
        t.create_pending("first").buffer("psk", "\"a\"");
        t.create_pending("second").buffer("psk", "\"b\"");

        let confirmed = t.confirm_oldest(0).unwrap();
        assert_eq!(confirmed.ssid, "first");
        assert_eq!(confirmed.id, Some(0));
        assert_eq!(confirmed.pending_config, vec![("psk".to_string(), "\"a\"".to_string())]);

        let confirmed = t.confirm_oldest(1).unwrap();
        assert_eq!(confirmed.ssid, "second");

        assert!(t.confirm_oldest(2).is_none());
    }

    #[test]
    fn test_buffer_replaces_key() {
        let mut r = NetworkRecord::default();
        r.buffer("psk", "\"old\"");
        r.buffer("mode", "2");
        r.buffer("psk", "\"new\"");
        assert_eq!(
            r.pending_config,
            vec![
                ("psk".to_string(), "\"new\"".to_string()),
                ("mode".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn test_wifistate_off_when_all_matching_disabled() {
        let mut t = NetworkTable::new();
        t.add_confirmed(0, "home");
        t.by_id_mut(0).unwrap().disabled = true;
        assert_eq!(derive_wifistate(Role::None, &t), "off");
        assert_eq!(derive_wifistate(Role::Station, &t), "off");

        t.by_id_mut(0).unwrap().disabled = false;
        assert_eq!(derive_wifistate(Role::None, &t), "none");
        assert_eq!(derive_wifistate(Role::Station, &t), "station");
    }

    #[test]
    fn test_wifistate_mode_filter() {
        let mut t = NetworkTable::new();
        t.add_confirmed(0, "home");
        t.add_confirmed(1, "my-ap");
        t.by_id_mut(1).unwrap().mode = NetworkMode::Ap;
        t.by_id_mut(0).unwrap().disabled = true;

        // as AP, only the AP-mode network counts, and it is enabled
        assert_eq!(derive_wifistate(Role::Ap, &t), "AP");
        // as (would-be) station, the only station network is disabled
        assert_eq!(derive_wifistate(Role::Station, &t), "off");
    }

    #[test]
    fn test_wifistate_empty_table_is_off() {
        let t = NetworkTable::new();
        assert_eq!(derive_wifistate(Role::None, &t), "off");
    }

    #[test]
    fn test_mode_roundtrip() {
        assert_eq!(NetworkMode::from_raw(0), Some(NetworkMode::Station));
        assert_eq!(NetworkMode::from_raw(2), Some(NetworkMode::Ap));
        assert_eq!(NetworkMode::from_raw(5), Some(NetworkMode::Mesh));
        assert_eq!(NetworkMode::from_raw(1), None);
        assert_eq!(NetworkMode::Mesh.as_raw(), 5);
    }
}
