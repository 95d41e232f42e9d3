//! Shared fixtures for the integration tests
//!
//! - [`RING_FIXTURE`]: one full-sequence problem with its single-device
//!   forward and backward results, computed once and sliced per rank
//! - [`test_capability`]: an available capability that ignores the host
//!   environment
//! - tempfile helpers for reports and config files
//!
//! Tests that touch process environment variables must be `#[serial]`.

#![allow(dead_code)]

mod fixtures;
mod tempfile_helpers;

pub use fixtures::*;
pub use serial_test::serial;
pub use tempfile_helpers::*;

use once_cell::sync::Lazy;

/// (1, 512, 8, 64) causal problem shared by the ring tests
pub static RING_FIXTURE: Lazy<RingFixture> = Lazy::new(|| RingFixture::new(1, 512, 8, 64, 7));
