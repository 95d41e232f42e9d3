//! Device memory accounting
//!
//! Every tensor buffer holds a [`MemoryLease`] that registers its size with a
//! process-wide tracker on creation and releases it on drop. The tracker keeps
//! the current total and a high-water mark, which the perf check reads the
//! same way one would read an allocator's peak statistics.
//!
//! Ring participants run as threads of one process, so the numbers are shared
//! by all of them.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicUsize, Ordering};

static TRACKER: Lazy<MemoryTracker> = Lazy::new(MemoryTracker::new);

#[derive(Debug)]
struct MemoryTracker {
    allocated: AtomicUsize,
    peak: AtomicUsize,
    live: AtomicUsize,
}

impl MemoryTracker {
    fn new() -> Self {
        Self {
            allocated: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        }
    }

    fn acquire(&self, bytes: usize) {
        let now = self.allocated.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.live.fetch_add(1, Ordering::AcqRel);
        self.peak.fetch_max(now, Ordering::AcqRel);
    }

    fn release(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::AcqRel);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Snapshot of the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub allocated_bytes: usize,
    pub peak_bytes: usize,
    pub live_allocations: usize,
}

pub fn memory_stats() -> MemoryStats {
    MemoryStats {
        allocated_bytes: TRACKER.allocated.load(Ordering::Acquire),
        peak_bytes: TRACKER.peak.load(Ordering::Acquire),
        live_allocations: TRACKER.live.load(Ordering::Acquire),
    }
}

/// Highest number of bytes held at once since the last reset
pub fn max_memory_allocated() -> usize {
    TRACKER.peak.load(Ordering::Acquire)
}

/// Lower the high-water mark to what is currently allocated
pub fn reset_peak_memory_stats() {
    let current = TRACKER.allocated.load(Ordering::Acquire);
    TRACKER.peak.store(current, Ordering::Release);
}

/// Registration of one buffer with the tracker; releases on drop
#[derive(Debug)]
pub struct MemoryLease {
    bytes: usize,
}

impl MemoryLease {
    pub fn acquire(bytes: usize) -> Self {
        TRACKER.acquire(bytes);
        Self { bytes }
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        TRACKER.release(self.bytes);
    }
}

/// Calculate memory requirements ahead of a run
///
/// Used by the perf check to print the expected footprint of a configuration
/// next to the measured peak.
///
/// # Example
/// ```ignore
/// let mut calc = MemoryCalculator::new();
/// calc.add_tensor("q".to_string(), 2 * 8 * 1024 * 64, 4);
/// println!("Need {} MB", calc.total_bytes() / 1024 / 1024);
/// ```
#[derive(Debug, Clone)]
pub struct MemoryCalculator {
    tensor_sizes: Vec<(String, usize)>,
    alignment: usize,
}

impl MemoryCalculator {
    /// Host cache-line alignment
    pub const DEFAULT_ALIGNMENT: usize = 64;

    pub fn new() -> Self {
        Self {
            tensor_sizes: Vec::new(),
            alignment: Self::DEFAULT_ALIGNMENT,
        }
    }

    /// Create a new calculator with custom alignment (must be a power of two)
    pub fn with_alignment(alignment: usize) -> Self {
        Self {
            tensor_sizes: Vec::new(),
            alignment,
        }
    }

    /// Footprint of one attention forward + backward over f32 BHSD tensors:
    /// q, k, v, out, dout, dq, dk, dv and the lse rows.
    pub fn for_attention(batch: usize, heads: usize, seq_len: usize, head_dim: usize) -> Self {
        let mut calc = Self::new();
        let bhsd = batch * heads * seq_len * head_dim;
        for name in ["q", "k", "v", "out", "dout", "dq", "dk", "dv"] {
            calc.add_tensor(name.to_string(), bhsd, std::mem::size_of::<f32>());
        }
        calc.add_tensor(
            "lse".to_string(),
            batch * heads * seq_len,
            std::mem::size_of::<f32>(),
        );
        calc
    }

    /// Add a tensor; its size is rounded up to the alignment boundary
    pub fn add_tensor(&mut self, name: String, element_count: usize, element_size: usize) {
        let bytes = element_count.saturating_mul(element_size);
        let aligned = (bytes + self.alignment - 1) & !(self.alignment - 1);
        self.tensor_sizes.push((name, aligned));
    }

    pub fn total_bytes(&self) -> usize {
        self.tensor_sizes.iter().map(|(_, size)| size).sum()
    }

    pub fn tensor_count(&self) -> usize {
        self.tensor_sizes.len()
    }

    pub fn tensor_sizes(&self) -> &[(String, usize)] {
        &self.tensor_sizes
    }
}

impl Default for MemoryCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes to MiB for reporting
pub fn bytes_to_mib(bytes: usize) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}
