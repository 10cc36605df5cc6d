//! Process Memory Probe
//!
//! Reads the resident set size from `/proc/self/status`. The total it is
//! compared against is, in order of preference: an explicit limit, the
//! cgroup v2 `memory.max`, then `MemTotal` from `/proc/meminfo`.

use std::path::PathBuf;

use tracing::trace;

use crate::domain::{MemoryProbe, MemoryReading};
use crate::error::{Error, Result};

const STATUS_PATH: &str = "/proc/self/status";
const CGROUP_MAX_PATH: &str = "/sys/fs/cgroup/memory.max";
const MEMINFO_PATH: &str = "/proc/meminfo";

/// Memory probe backed by procfs
#[derive(Debug, Clone)]
pub struct ProcMemoryProbe {
    limit_bytes: Option<u64>,
    status_path: PathBuf,
    cgroup_max_path: PathBuf,
    meminfo_path: PathBuf,
}

impl ProcMemoryProbe {
    pub fn new(limit_bytes: Option<u64>) -> Self {
        Self {
            limit_bytes,
            status_path: STATUS_PATH.into(),
            cgroup_max_path: CGROUP_MAX_PATH.into(),
            meminfo_path: MEMINFO_PATH.into(),
        }
    }

    /// Read from alternative files (tests, non-standard mounts)
    pub fn with_paths(
        limit_bytes: Option<u64>,
        status: impl Into<PathBuf>,
        cgroup_max: impl Into<PathBuf>,
        meminfo: impl Into<PathBuf>,
    ) -> Self {
        Self {
            limit_bytes,
            status_path: status.into(),
            cgroup_max_path: cgroup_max.into(),
            meminfo_path: meminfo.into(),
        }
    }

    fn total_bytes(&self) -> Result<u64> {
        if let Some(limit) = self.limit_bytes.filter(|l| *l > 0) {
            return Ok(limit);
        }
        if let Ok(raw) = std::fs::read_to_string(&self.cgroup_max_path) {
            if let Some(limit) = parse_cgroup_max(&raw) {
                return Ok(limit);
            }
        }
        let meminfo = std::fs::read_to_string(&self.meminfo_path)?;
        parse_kib_field(&meminfo, "MemTotal:")
            .ok_or_else(|| Error::Parse(format!("no MemTotal in {}", self.meminfo_path.display())))
    }
}

impl MemoryProbe for ProcMemoryProbe {
    fn sample(&self) -> Result<MemoryReading> {
        let status = std::fs::read_to_string(&self.status_path)?;
        let used = parse_kib_field(&status, "VmRSS:")
            .ok_or_else(|| Error::Parse(format!("no VmRSS in {}", self.status_path.display())))?;
        let total = self.total_bytes()?;
        trace!(used_bytes = used, total_bytes = total, "Memory sampled");
        Ok(MemoryReading::new(used, total))
    }
}

/// Parse a `Name:   1234 kB` line into bytes
fn parse_kib_field(contents: &str, field: &str) -> Option<u64> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix(field))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kib| kib.parse::<u64>().ok())
        .map(|kib| kib * 1024)
}

/// `max` means unlimited
fn parse_cgroup_max(raw: &str) -> Option<u64> {
    match raw.trim() {
        "max" | "" => None,
        value => value.parse().ok(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STATUS: &str = "Name:\tsymbol-cache\nVmPeak:\t  900 kB\nVmRSS:\t  512 kB\nThreads:\t4\n";
    const MEMINFO: &str = "MemTotal:       2048 kB\nMemFree:        1024 kB\n";

    fn fixture(cgroup: &str) -> (TempDir, ProcMemoryProbe) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("status"), STATUS).unwrap();
        std::fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();
        std::fs::write(dir.path().join("memory.max"), cgroup).unwrap();
        let probe = ProcMemoryProbe::with_paths(
            None,
            dir.path().join("status"),
            dir.path().join("memory.max"),
            dir.path().join("meminfo"),
        );
        (dir, probe)
    }

    #[test]
    fn test_parse_fields() {
        assert_eq!(parse_kib_field(STATUS, "VmRSS:"), Some(512 * 1024));
        assert_eq!(parse_kib_field(STATUS, "VmSwap:"), None);
        assert_eq!(parse_cgroup_max("max\n"), None);
        assert_eq!(parse_cgroup_max("4096\n"), Some(4096));
    }

    #[test]
    fn test_cgroup_limit_preferred_over_meminfo() {
        let (_dir, probe) = fixture("1048576\n");
        let reading = probe.sample().unwrap();
        assert_eq!(reading.used_bytes, 512 * 1024);
        assert_eq!(reading.total_bytes, 1_048_576);
        assert_eq!(reading.usage_percent(), 50.0);
    }

    #[test]
    fn test_unlimited_cgroup_falls_back_to_meminfo() {
        let (_dir, probe) = fixture("max\n");
        assert_eq!(probe.sample().unwrap().total_bytes, 2048 * 1024);
    }

    #[test]
    fn test_explicit_limit_wins() {
        let (dir, _) = fixture("max\n");
        let probe = ProcMemoryProbe::with_paths(
            Some(4 * 1024 * 1024),
            dir.path().join("status"),
            dir.path().join("memory.max"),
            dir.path().join("meminfo"),
        );
        assert_eq!(probe.sample().unwrap().total_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn test_missing_status_is_error() {
        let probe = ProcMemoryProbe::with_paths(None, "/nonexistent", "/nonexistent", "/nonexistent");
        assert!(probe.sample().is_err());
    }
}
