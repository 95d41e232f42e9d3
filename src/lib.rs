//! RingForge - ring-parallel flash attention
//!
//! Blockwise (online-softmax) flash attention on the host compute pool, a
//! ring coordinator that spreads one sequence over several participants, and
//! a verification harness that checks both against a naive reference.
//!
//! ```rust
//! use ringforge::attention::{flash_attention_forward, AttentionConfig};
//! use ringforge::Tensor;
//!
//! let q = Tensor::randn(&[1, 2, 16, 8], 0);
//! let k = Tensor::randn(&[1, 2, 16, 8], 1);
//! let v = Tensor::randn(&[1, 2, 16, 8], 2);
//! let res = flash_attention_forward(&q, &k, &v, &AttentionConfig::causal()).unwrap();
//! assert_eq!(res.lse.dims(), &[1, 2, 16]);
//! ```

#![allow(clippy::manual_slice_size_calculation)] // Common in kernel code
#![allow(clippy::needless_range_loop)] // Clearer for row/column loops
#![allow(clippy::collapsible_else_if)] // Sometimes clearer for control flow
#![allow(clippy::collapsible_if)] // Sometimes clearer for control flow
#![allow(clippy::type_complexity)] // Per-slab gradient tuples

pub mod attention;
pub mod device;
pub mod distributed;
pub mod error;
pub mod harness;
pub mod logging;
pub mod profiling;
pub mod ring;
pub mod tensor;

pub use error::{ErrorCategory, ForgeResult, RingForgeError};
pub use profiling::{KernelTimer, ScopedTimer};
pub use tensor::Tensor;
