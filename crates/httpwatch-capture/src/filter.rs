//! Process filtering for entry hooks

use std::collections::HashSet;

/// Filter configuration
#[derive(Debug, Clone, Default)]
pub struct PidFilter {
    /// PIDs to include (empty = all)
    pub include_pids: HashSet<u32>,

    /// PIDs to exclude
    pub exclude_pids: HashSet<u32>,
}

impl PidFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_include(pids: &[u32]) -> Self {
        Self {
            include_pids: pids.iter().copied().collect(),
            ..Default::default()
        }
    }

    /// Check if a process should be traced
    pub fn should_trace(&self, pid: u32) -> bool {
        if !self.include_pids.is_empty() && !self.include_pids.contains(&pid) {
            return false;
        }
        !self.exclude_pids.contains(&pid)
    }

    pub fn include_pid(mut self, pid: u32) -> Self {
        self.include_pids.insert(pid);
        self
    }

    pub fn exclude_pid(mut self, pid: u32) -> Self {
        self.exclude_pids.insert(pid);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.include_pids.is_empty() && self.exclude_pids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_traces_everything() {
        let filter = PidFilter::new();
        assert!(filter.is_empty());
        assert!(filter.should_trace(1));
        assert!(filter.should_trace(u32::MAX));
    }

    #[test]
    fn test_include_and_exclude() {
        let filter = PidFilter::from_include(&[10, 20]).exclude_pid(20);
        assert!(filter.should_trace(10));
        assert!(!filter.should_trace(20));
        assert!(!filter.should_trace(30));

        let filter = PidFilter::new().exclude_pid(5).include_pid(6);
        assert!(!filter.should_trace(5));
        assert!(filter.should_trace(6));
    }
}
