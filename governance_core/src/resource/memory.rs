//! Process memory measurement used by the memory quota

use std::fmt::Debug;

/// Source of the current process memory usage
pub trait MemoryProbe: Send + Sync + Debug {
    /// Current resident memory in megabytes
    fn current_usage_mb(&self) -> f64;
}

/// Reads the resident set size of the running process.
///
/// On Linux this parses `VmRSS` from `/proc/self/status`. Elsewhere, or when
/// the file cannot be read, it reports zero so that the memory quota never
/// blocks registrations on platforms it cannot measure.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemoryProbe;

impl ProcessMemoryProbe {
    fn parse_vm_rss_kb(status: &str) -> Option<u64> {
        status
            .lines()
            .find(|line| line.starts_with("VmRSS:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse().ok())
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn current_usage_mb(&self) -> f64 {
        match std::fs::read_to_string("/proc/self/status") {
            Ok(status) => Self::parse_vm_rss_kb(&status)
                .map(|kb| kb as f64 / 1024.0)
                .unwrap_or(0.0),
            Err(_) => 0.0,
        }
    }
}

/// Probe reporting a fixed value, for tests and for callers that account
/// memory themselves
#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryProbe(pub f64);

impl MemoryProbe for FixedMemoryProbe {
    fn current_usage_mb(&self) -> f64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tgovernance\nVmPeak:\t  20000 kB\nVmRSS:\t   10240 kB\nThreads:\t4\n";
        assert_eq!(ProcessMemoryProbe::parse_vm_rss_kb(status), Some(10240));
        assert_eq!(ProcessMemoryProbe::parse_vm_rss_kb("Name:\tx\n"), None);
    }

    #[test]
    fn test_process_probe_is_non_negative() {
        assert!(ProcessMemoryProbe.current_usage_mb() >= 0.0);
    }
}
