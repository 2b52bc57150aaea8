//! Environment-variable configuration (spec.md §6).
//!
//! The teacher parses its configuration with `clap` + `serde`
//! (`src/main/core/configuration.rs`), but that machinery is built around a
//! CLI and a config file, neither of which this crate has: it's a library,
//! not a binary. So configuration here is just the documented environment
//! variables, read once at `Runtime::init` time into a plain struct —
//! matching the spirit of the teacher's option structs (one field per
//! option, documented default) without pulling in a parser this crate
//! doesn't need.

use std::str::FromStr;

/// `CALIBRATE` (§6): drives performance-model calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Calibrate {
    #[default]
    Off,
    On,
    Force,
}

impl FromStr for Calibrate {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "0" => Ok(Self::Off),
            "1" => Ok(Self::On),
            "force" => Ok(Self::Force),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// `LIMIT_CPU_MEM`: cap on the host allocator, in bytes (converted from
    /// the MiB the environment variable is expressed in).
    pub limit_cpu_mem: Option<usize>,
    /// `LIMIT_CPU_NUMA_<idx>_MEM`: per-NUMA-node cap, in bytes, indexed by
    /// NUMA node index as it appeared in the variable name.
    pub limit_cpu_numa_mem: Vec<(usize, usize)>,
    /// `SCHED`: policy name for the default scheduling context.
    pub sched: Option<String>,
    /// `NCPU`: number of CPU workers to create.
    pub ncpu: Option<usize>,
    /// `NCUDA`: number of CUDA workers to create.
    pub ncuda: Option<usize>,
    /// `NOPENCL`: number of OpenCL workers to create.
    pub nopencl: Option<usize>,
    /// `CALIBRATE`: performance-model calibration mode.
    pub calibrate: Calibrate,
}

const MIB: usize = 1024 * 1024;

impl RuntimeConfig {
    /// Reads the environment variables named in spec.md §6. Unset or
    /// unparsable variables fall back to their documented defaults rather
    /// than erroring, matching the teacher's preference
    /// (`core/configuration.rs` doc comment) for configuration parsing that
    /// does not become environment-dependent.
    pub fn from_env() -> Self {
        Self {
            limit_cpu_mem: env_usize("LIMIT_CPU_MEM").map(|mib| mib * MIB),
            limit_cpu_numa_mem: numa_mem_limits(),
            sched: std::env::var("SCHED").ok(),
            ncpu: env_usize("NCPU"),
            ncuda: env_usize("NCUDA"),
            nopencl: env_usize("NOPENCL"),
            calibrate: std::env::var("CALIBRATE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            limit_cpu_mem: None,
            limit_cpu_numa_mem: Vec::new(),
            sched: None,
            ncpu: None,
            ncuda: None,
            nopencl: None,
            calibrate: Calibrate::Off,
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn numa_mem_limits() -> Vec<(usize, usize)> {
    let prefix = "LIMIT_CPU_NUMA_";
    let suffix = "_MEM";
    std::env::vars()
        .filter_map(|(k, v)| {
            let idx_str = k.strip_prefix(prefix)?.strip_suffix(suffix)?;
            let idx: usize = idx_str.parse().ok()?;
            let mib: usize = v.parse().ok()?;
            Some((idx, mib * MIB))
        })
        .collect()
}
