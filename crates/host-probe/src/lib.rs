//! # host-probe
//!
//! Point-in-time host readings for schedulers that need to back off under
//! load: system memory, the 1-minute load average, the current process's
//! memory footprint, and free space on the volume holding a path.
//!
//! ## How it works
//!
//! A [`HostProbe`] owns one [`sysinfo::System`] behind a mutex. Each call
//! refreshes only the counters it reads (memory, or the current process), so
//! sampling every few seconds stays cheap. Readings are returned as plain,
//! serialisable value types; the probe keeps no history of its own.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use host_probe::HostProbe;
//!
//! let probe = HostProbe::new().expect("current pid unavailable");
//! let system = probe.sample_system();
//! let process = probe.sample_process(system.memory.total).expect("process gone");
//! println!(
//!     "memory {:.1}% used, load {:.1}% of {} cores, rss {:.1}%",
//!     system.memory.pct, system.cpu.pct, system.cpu.cores, process.heap_pct
//! );
//! ```
//!
//! ## Platform support
//!
//! | OS      | Memory | Load average | Process | Disk |
//! |---------|--------|--------------|---------|------|
//! | Linux   | ✓      | ✓            | ✓       | ✓    |
//! | macOS   | ✓      | ✓            | ✓       | ✓    |
//! | Windows | ✓      | always 0     | ✓       | ✓    |
//!
//! On Windows the load average is reported as zero, so CPU pressure never
//! triggers there; memory-based signals still work.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, Pid, ProcessesToUpdate, System};
use thiserror::Error;

/// Bytes per mebibyte.
pub const BYTES_PER_MB: u64 = 1024 * 1024;

// ── Error type ───────────────────────────────────────────────────────────────

/// Errors returned by host-probe operations.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// The platform did not report an id for the running process.
    #[error("Current process id unavailable: {0}")]
    CurrentPid(&'static str),

    /// The running process disappeared from the process table.
    #[error("Process {pid} not found in the process table")]
    ProcessNotFound { pid: u32 },

    /// The internal `System` mutex was poisoned by a panicking sampler.
    #[error("Probe state poisoned")]
    Poisoned,
}

// ── Samples ──────────────────────────────────────────────────────────────────

/// System memory at a point in time, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub used: u64,
    /// Memory available to new allocations (includes reclaimable cache).
    pub free: u64,
    pub total: u64,
    /// `used / total × 100`.
    pub pct: f64,
}

impl MemoryUsage {
    /// Build from a total and a free figure; `used` and `pct` are derived.
    pub fn from_total_and_free(total: u64, free: u64) -> Self {
        let free = free.min(total);
        let used = total - free;
        Self {
            used,
            free,
            total,
            pct: percent(used, total),
        }
    }

    /// Free memory in whole mebibytes.
    pub fn free_mb(&self) -> u64 {
        self.free / BYTES_PER_MB
    }
}

/// CPU pressure derived from the 1-minute load average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuLoad {
    /// 1-minute load average.
    pub avg: f64,
    /// Logical cores available to this process.
    pub cores: usize,
    /// `avg / cores × 100`. Exceeds 100 when the run queue is oversubscribed.
    pub pct: f64,
}

impl CpuLoad {
    pub fn from_load_average(avg: f64, cores: usize) -> Self {
        let cores = cores.max(1);
        Self {
            avg,
            cores,
            pct: avg / cores as f64 * 100.0,
        }
    }
}

/// One system-wide reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemSample {
    pub memory: MemoryUsage,
    pub cpu: CpuLoad,
}

/// Memory held by the running process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    /// Resident set size.
    pub resident_bytes: u64,
    /// Virtual address space reserved.
    pub virtual_bytes: u64,
    /// `resident_bytes / total system memory × 100`.
    pub heap_pct: f64,
}

impl ProcessSample {
    pub fn new(resident_bytes: u64, virtual_bytes: u64, total_system_memory: u64) -> Self {
        Self {
            resident_bytes,
            virtual_bytes,
            heap_pct: percent(resident_bytes, total_system_memory),
        }
    }
}

/// Free space on the volume that holds a given path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpace {
    pub mount_point: PathBuf,
    pub available_bytes: u64,
    pub total_bytes: u64,
}

// ── Probe ────────────────────────────────────────────────────────────────────

/// Reads host counters on demand.
pub struct HostProbe {
    system: Mutex<System>,
    pid: Pid,
    cores: usize,
}

impl std::fmt::Debug for HostProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProbe")
            .field("pid", &self.pid.as_u32())
            .field("cores", &self.cores)
            .finish()
    }
}

impl HostProbe {
    /// Create a probe bound to the current process.
    pub fn new() -> Result<Self, ProbeError> {
        let pid = sysinfo::get_current_pid().map_err(ProbeError::CurrentPid)?;
        Ok(Self {
            system: Mutex::new(System::new()),
            pid,
            cores: logical_cores(),
        })
    }

    /// Logical cores visible to this process.
    pub fn cores(&self) -> usize {
        self.cores
    }

    /// Refresh and read system memory and load average.
    pub fn sample_system(&self) -> SystemSample {
        let (total, free) = match self.system.lock() {
            Ok(mut sys) => {
                sys.refresh_memory();
                (sys.total_memory(), sys.available_memory())
            }
            // A poisoned lock still guards a usable `System`.
            Err(poisoned) => {
                let mut sys = poisoned.into_inner();
                sys.refresh_memory();
                (sys.total_memory(), sys.available_memory())
            }
        };

        SystemSample {
            memory: MemoryUsage::from_total_and_free(total, free),
            cpu: CpuLoad::from_load_average(System::load_average().one, self.cores),
        }
    }

    /// Refresh and read the current process's memory.
    ///
    /// `total_system_memory` is the denominator for `heap_pct`; pass the
    /// `total` from a fresh [`SystemSample`].
    pub fn sample_process(&self, total_system_memory: u64) -> Result<ProcessSample, ProbeError> {
        let mut sys = self.system.lock().map_err(|_| ProbeError::Poisoned)?;
        sys.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        let process = sys.process(self.pid).ok_or(ProbeError::ProcessNotFound {
            pid: self.pid.as_u32(),
        })?;

        Ok(ProcessSample::new(
            process.memory(),
            process.virtual_memory(),
            total_system_memory,
        ))
    }

    /// Free space on the volume holding `path`, if the platform reports it.
    ///
    /// Picks the mount point with the longest prefix match, so `/home/x` on a
    /// separate `/home` volume is not attributed to `/`.
    pub fn disk_space(&self, path: &Path) -> Option<DiskSpace> {
        let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();

        disks
            .list()
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().components().count())
            .map(|d| DiskSpace {
                mount_point: d.mount_point().to_path_buf(),
                available_bytes: d.available_space(),
                total_bytes: d.total_space(),
            })
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn logical_cores() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * BYTES_PER_MB;

    #[test]
    fn memory_usage_derives_used_and_pct() {
        let m = MemoryUsage::from_total_and_free(8 * GB, 2 * GB);
        assert_eq!(m.used, 6 * GB);
        assert!((m.pct - 75.0).abs() < 1e-9);
        assert_eq!(m.free_mb(), 2048);
    }

    #[test]
    fn memory_usage_clamps_free_to_total() {
        let m = MemoryUsage::from_total_and_free(GB, 2 * GB);
        assert_eq!(m.free, GB);
        assert_eq!(m.used, 0);
    }

    #[test]
    fn zero_total_memory_reports_zero_pct() {
        let m = MemoryUsage::from_total_and_free(0, 0);
        assert_eq!(m.pct, 0.0);
        let p = ProcessSample::new(1024, 2048, 0);
        assert_eq!(p.heap_pct, 0.0);
    }

    #[test]
    fn cpu_load_is_relative_to_cores() {
        let c = CpuLoad::from_load_average(6.0, 4);
        assert!((c.pct - 150.0).abs() < 1e-9);
        let c = CpuLoad::from_load_average(1.0, 0);
        assert_eq!(c.cores, 1);
    }

    #[test]
    fn live_probe_reads_plausible_values() {
        let probe = HostProbe::new().expect("pid");
        let sys = probe.sample_system();
        assert!(sys.memory.total > 0);
        assert!(sys.memory.pct >= 0.0 && sys.memory.pct <= 100.0);
        let proc_sample = probe.sample_process(sys.memory.total).expect("self");
        assert!(proc_sample.resident_bytes > 0);
    }
}
