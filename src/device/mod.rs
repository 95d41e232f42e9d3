//! Compute device discovery and accounting
//!
//! The compute device is the host compute pool. [`probe`] reports whether it
//! can be used and how many logical devices ring participants may bind to;
//! the answer is cached for the life of the process, like CPU feature
//! detection.
//!
//! # Example
//!
//! ```rust
//! use ringforge::device;
//!
//! let cap = device::probe();
//! if !cap.available {
//!     eprintln!("no accelerator: {}", cap.reason.as_deref().unwrap_or("unknown"));
//! }
//! ```

pub mod memory;

pub use memory::{
    bytes_to_mib, max_memory_allocated, memory_stats, reset_peak_memory_stats, MemoryCalculator,
    MemoryLease, MemoryStats,
};

use crate::distributed::env::EnvSnapshot;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::fmt;

/// Overrides the number of logical devices (0 marks the accelerator unavailable)
pub const DEVICE_COUNT_ENV: &str = "RINGFORGE_DEVICE_COUNT";

static CAPABILITY: Lazy<Capability> = Lazy::new(|| Capability::detect(&EnvSnapshot::capture()));

/// Logical device a participant is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceId(pub usize);

impl DeviceId {
    /// Bind a local rank round-robin over the visible devices
    pub fn for_local_rank(local_rank: usize, device_count: usize) -> Self {
        DeviceId(local_rank % device_count.max(1))
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host:{}", self.0)
    }
}

/// Result of the accelerator probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub available: bool,
    pub device_count: usize,
    /// Worker threads in the compute pool
    pub compute_threads: usize,
    /// Why the accelerator is unavailable
    pub reason: Option<String>,
}

impl Capability {
    /// Probe the host, honouring `RINGFORGE_DEVICE_COUNT`
    pub fn detect(env: &EnvSnapshot) -> Self {
        let compute_threads = rayon::current_num_threads();

        let device_count = match env.get(DEVICE_COUNT_ENV) {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(0) => {
                    return Self::unavailable(format!("{}=0", DEVICE_COUNT_ENV));
                }
                Ok(n) => n,
                Err(_) => {
                    return Self::unavailable(format!(
                        "{} is not a device count: '{}'",
                        DEVICE_COUNT_ENV, raw
                    ));
                }
            },
            None => match std::thread::available_parallelism() {
                Ok(n) => n.get(),
                Err(e) => return Self::unavailable(format!("cannot query host parallelism: {}", e)),
            },
        };

        if compute_threads == 0 {
            return Self::unavailable("compute pool has no worker threads".to_string());
        }

        Self {
            available: true,
            device_count,
            compute_threads,
            reason: None,
        }
    }

    pub fn unavailable(reason: String) -> Self {
        Self {
            available: false,
            device_count: 0,
            compute_threads: 0,
            reason: Some(reason),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.available {
            write!(
                f,
                "Capability(devices={}, threads={})",
                self.device_count, self.compute_threads
            )
        } else {
            write!(
                f,
                "Capability(unavailable: {})",
                self.reason.as_deref().unwrap_or("unknown")
            )
        }
    }
}

/// Cached probe of the process environment
pub fn probe() -> &'static Capability {
    &CAPABILITY
}
