//! Breakpoint resolution against the debug-info label table.

use std::collections::{HashMap, HashSet};

use fj_spec::DebugInfo;

/// Breakpoints resolved to absolute addresses, remembering the label
/// that produced each one for display.
#[derive(Debug, Clone, Default)]
pub struct Breakpoints {
    by_address: HashMap<u64, Option<String>>,
    /// Labels requested but absent from the debug info.
    pub unknown_labels: Vec<String>,
}

impl Breakpoints {
    pub fn new() -> Self {
        Breakpoints::default()
    }

    pub fn add_address(&mut self, address: u64) {
        self.by_address.entry(address).or_insert(None);
    }

    /// Break at an exactly-named label.
    pub fn add_label(&mut self, label: &str, debug: &DebugInfo) {
        match debug.labels.get(label) {
            Some(&address) => {
                self.by_address.insert(address, Some(label.to_string()));
            }
            None => self.unknown_labels.push(label.to_string()),
        }
    }

    /// Break at every label containing the given substring.
    pub fn add_label_containing(&mut self, fragment: &str, debug: &DebugInfo) {
        let mut any = false;
        for (label, &address) in &debug.labels {
            if label.contains(fragment) {
                self.by_address.insert(address, Some(label.clone()));
                any = true;
            }
        }
        if !any {
            self.unknown_labels.push(fragment.to_string());
        }
    }

    pub fn addresses(&self) -> HashSet<u64> {
        self.by_address.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// Human name for a hit breakpoint.
    pub fn describe(&self, address: u64, debug: &DebugInfo) -> String {
        if let Some(Some(label)) = self.by_address.get(&address) {
            return format!("{:#x} ({})", address, label);
        }
        match debug.nearest_label(address) {
            Some((label, 0)) => format!("{:#x} ({})", address, label),
            Some((label, offset)) => format!("{:#x} ({} + {:#x})", address, label, offset),
            None => format!("{:#x}", address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debug() -> DebugInfo {
        let mut info = DebugInfo::new(64);
        info.labels.insert("start".to_string(), 0);
        info.labels.insert("main_loop".to_string(), 512);
        info.labels.insert("io.write_byte".to_string(), 1024);
        info
    }

    #[test]
    fn test_exact_label() {
        let mut breakpoints = Breakpoints::new();
        breakpoints.add_label("main_loop", &debug());
        assert_eq!(breakpoints.addresses(), HashSet::from([512]));
        assert!(breakpoints.unknown_labels.is_empty());
    }

    #[test]
    fn test_missing_label_is_reported_not_fatal() {
        let mut breakpoints = Breakpoints::new();
        breakpoints.add_label("nope", &debug());
        assert!(breakpoints.is_empty());
        assert_eq!(breakpoints.unknown_labels, vec!["nope".to_string()]);
    }

    #[test]
    fn test_substring_match() {
        let mut breakpoints = Breakpoints::new();
        breakpoints.add_label_containing("loop", &debug());
        breakpoints.add_label_containing("io.", &debug());
        assert_eq!(breakpoints.addresses(), HashSet::from([512, 1024]));
    }

    #[test]
    fn test_describe_prefers_breakpoint_label() {
        let mut breakpoints = Breakpoints::new();
        breakpoints.add_label("main_loop", &debug());
        assert_eq!(breakpoints.describe(512, &debug()), "0x200 (main_loop)");
    }

    #[test]
    fn test_describe_falls_back_to_nearest_label() {
        let breakpoints = Breakpoints::new();
        assert_eq!(
            breakpoints.describe(640, &debug()),
            "0x280 (main_loop + 0x80)"
        );
    }
}
