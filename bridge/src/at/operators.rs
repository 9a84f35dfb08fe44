//! Operator-name table built from `AT+COPN`.
//!
//! Keys are numeric operator ids (MCC+MNC). The SIM operator is
//! resolved from the IMSI by longest-prefix match — the id's own length
//! decides how many IMSI digits take part in the comparison.

use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct OperatorTable {
    by_id: BTreeMap<String, String>,
}

impl OperatorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an operator entry.
    pub fn insert(&mut self, id: String, name: String) {
        self.by_id.insert(id, name);
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Drop every entry (SIM removed).
    pub fn clear(&mut self) {
        self.by_id.clear();
    }

    /// Name for an exact operator id.
    pub fn name(&self, id: &str) -> Option<&str> {
        self.by_id.get(id).map(String::as_str)
    }

    /// Resolve an IMSI to `(id, name)` of the operator whose id is the
    /// longest prefix of the IMSI.
    pub fn resolve_imsi(&self, imsi: &str) -> Option<(&str, &str)> {
        self.by_id
            .iter()
            .filter(|(id, _)| imsi.starts_with(id.as_str()))
            .max_by_key(|(id, _)| id.len())
            .map(|(id, name)| (id.as_str(), name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> OperatorTable {
        let mut t = OperatorTable::new();
        t.insert("310".to_string(), "US generic".to_string());
        t.insert("310260".to_string(), "T-Mobile".to_string());
        t.insert("31026".to_string(), "Shorter".to_string());
        t.insert("26201".to_string(), "Telekom.de".to_string());
        t
    }

    #[test]
    fn test_longest_prefix_wins() {
        let t = table();
        let (id, name) = t.resolve_imsi("310260123456789").unwrap();
        assert_eq!(id, "310260");
        assert_eq!(name, "T-Mobile");
    }

    #[test]
    fn test_shorter_prefix_fallback() {
        let t = table();
        let (id, name) = t.resolve_imsi("310410123456789").unwrap();
        assert_eq!(id, "310");
        assert_eq!(name, "US generic");
    }

    #[test]
    fn test_no_match() {
        let t = table();
        assert_eq!(t.resolve_imsi("901700000000000"), None);
    }

    #[test]
    fn test_clear() {
        let mut t = table();
        t.clear();
        assert!(t.is_empty());
        assert_eq!(t.resolve_imsi("310260123456789"), None);
    }
}
