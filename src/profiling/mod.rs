//! Profiling utilities
//!
//! - [`kernel_timer`] - timers for kernel calls and scoped regions
//! - [`throughput`] - FLOP counts and TFLOP/s for attention
//!
//! ```rust
//! use ringforge::profiling::{attention_flops, tflops, KernelTimer};
//!
//! let mut timer = KernelTimer::for_kernel("flash_fwd");
//! timer.start();
//! // ... run kernel ...
//! timer.stop();
//!
//! let elapsed = timer.elapsed_duration().unwrap_or_default();
//! println!("{:.3} TFLOPS", tflops(attention_flops(1, 16, 1024, 64), elapsed));
//! ```

pub mod kernel_timer;
pub mod throughput;

pub use kernel_timer::{KernelTimer, ScopedTimer};
pub use throughput::{attention_flops, tflops};
