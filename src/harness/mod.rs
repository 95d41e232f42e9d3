//! Verification harness
//!
//! Five named checks, run in order:
//!
//! 1. Basic Flash Attention: causal forward/backward shapes, finiteness, gradients
//! 2. Flash vs Reference: blockwise kernel against the naive computation
//! 3. Memory and Performance: timing, TFLOP/s and peak memory over a length sweep
//! 4. Distributed Ring Attention: ring forward/backward against single-device results
//! 5. Ring Attention Variants: every ring entry point on rank-local data
//!
//! The distributed checks run on in-process participants when
//! `world_size > 1`, and are skipped for a single participant.

pub mod checks;
pub mod config;
pub mod runner;

pub use config::{HarnessConfig, ShapeConfig};
pub use runner::{run_check, Harness, SuiteReport, TestOutcome};
