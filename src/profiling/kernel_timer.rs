//! Kernel timer for measuring attention kernel execution time
//!
//! # Example
//!
//! ```rust
//! use ringforge::profiling::KernelTimer;
//!
//! let mut timer = KernelTimer::for_kernel("flash_fwd");
//! timer.start();
//! // ... run kernel ...
//! timer.stop();
//!
//! if let Some(ms) = timer.elapsed() {
//!     println!("Kernel '{}' took {:.2} ms", timer.name(), ms);
//! }
//! ```

use std::time::{Duration, Instant};

/// Timer for measuring kernel execution time
///
/// Kernels run synchronously on the calling thread (their rayon work is
/// joined before they return), so wall-clock time around the call is the
/// kernel time.
#[derive(Debug)]
pub struct KernelTimer {
    name: String,
    start: Option<Instant>,
    stop: Option<Instant>,
    /// Elapsed time in milliseconds (after stop() is called)
    elapsed_ms: Option<f32>,
}

impl KernelTimer {
    pub fn for_kernel(name: impl Into<String>) -> Self {
        KernelTimer {
            name: name.into(),
            start: None,
            stop: None,
            elapsed_ms: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start (or restart) timing; clears any previous measurement
    pub fn start(&mut self) {
        self.start = Some(Instant::now());
        self.stop = None;
        self.elapsed_ms = None;
    }

    /// Stop timing; a timer that was never started stays unmeasured
    pub fn stop(&mut self) {
        let stop_instant = Instant::now();
        self.stop = Some(stop_instant);

        if let Some(start) = self.start {
            let duration = stop_instant.duration_since(start);
            self.elapsed_ms = Some(duration.as_secs_f64() as f32 * 1000.0);
        }
    }

    /// Elapsed time in milliseconds, `None` until stopped
    pub fn elapsed(&self) -> Option<f32> {
        self.elapsed_ms
    }

    pub fn elapsed_duration(&self) -> Option<Duration> {
        match (self.start, self.stop) {
            (Some(start), Some(stop)) => Some(stop.duration_since(start)),
            _ => None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.start.is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_some()
    }
}

/// Scoped timer that logs its elapsed time when dropped
///
/// ```rust
/// use ringforge::profiling::ScopedTimer;
///
/// {
///     let _timer = ScopedTimer::new("ring_step");
///     // ... code to time ...
/// } // logs elapsed time here
/// ```
#[derive(Debug)]
pub struct ScopedTimer {
    name: String,
    start: Instant,
}

impl ScopedTimer {
    pub fn new(name: impl Into<String>) -> Self {
        ScopedTimer {
            name: name.into(),
            start: Instant::now(),
        }
    }

    /// Elapsed time in milliseconds
    pub fn elapsed(&self) -> f32 {
        self.start.elapsed().as_secs_f64() as f32 * 1000.0
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        let elapsed = self.elapsed();
        tracing::debug!(timer = %self.name, elapsed_ms = elapsed, "ScopedTimer '{}': {:.3} ms", self.name, elapsed);
    }
}
