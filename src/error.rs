//! Unified error handling for ringforge
//!
//! This module provides a centralized error type for every layer of the crate.
//! Errors are grouped into categories that drive how the verification harness
//! reacts to them:
//! - Environment errors (accelerator or backend unavailable)
//! - User errors (invalid shapes, invalid configuration)
//! - Numerical errors (non-finite values, missing gradients, tolerance exceeded)
//! - Distributed errors (setup failures, collective timeouts, lost peers)
//! - Internal errors (bugs, poisoned locks)

use std::fmt;
use std::time::Duration;

// Re-export thiserror for convenience
pub use thiserror;

use crate::logging::LoggingError;

/// Unified error type for ringforge
#[derive(Debug, thiserror::Error)]
pub enum RingForgeError {
    // ========== Environment Errors ==========
    /// No compute device could be brought up
    #[error("Accelerator unavailable: {0}")]
    AcceleratorUnavailable(String),

    /// Requested communication backend is not compiled in / not reachable
    #[error("Communication backend unavailable: {0}")]
    BackendUnavailable(String),

    // ========== Shape / Configuration Errors ==========
    /// Tensor dimensions do not agree
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Tensor shape is not valid for the operation
    #[error("Invalid tensor shape: {0}")]
    InvalidTensorShape(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Numerical Errors ==========
    /// Tensor contains NaN or Inf
    #[error("{what} contains {count} non-finite value(s)")]
    NonFiniteValues { what: String, count: usize },

    /// A tensor that required a gradient did not receive one
    #[error("No gradient for {0}")]
    MissingGradient(String),

    /// Result differs from the reference by more than the allowed bound
    #[error("Tolerance exceeded: {0}")]
    ToleranceExceeded(String),

    // ========== Distributed Errors ==========
    /// Process group could not be formed
    #[error("Distributed setup failed: {0}")]
    DistributedSetupFailed(String),

    /// Rank outside of [0, world_size)
    #[error("Invalid rank {rank} for world size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// A blocking collective did not complete in time
    #[error("[rank {rank}] {op} timed out after {:.1}s", .waited.as_secs_f64())]
    CollectiveTimeout {
        op: String,
        rank: usize,
        waited: Duration,
    },

    /// The other side of a point-to-point exchange went away
    #[error("[rank {rank}] peer {peer} disconnected during {op}")]
    PeerDisconnected { op: String, rank: usize, peer: usize },

    /// A receive of an exchange that was abandoned after a timeout
    #[error("[rank {rank}] {op} cancelled")]
    ExchangeCancelled { op: String, rank: usize },

    /// Collective used after the process group was torn down
    #[error("Process group not initialized: {0}")]
    ProcessGroupNotInitialized(String),

    // ========== I/O Errors ==========
    /// File I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Logging could not be initialized
    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Lock poisoned (a participant panicked while holding it)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl RingForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            RingForgeError::AcceleratorUnavailable(_) | RingForgeError::BackendUnavailable(_) => {
                ErrorCategory::Environment
            }

            RingForgeError::ShapeMismatch(_)
            | RingForgeError::InvalidTensorShape(_)
            | RingForgeError::InvalidConfiguration(_)
            | RingForgeError::IoError(_)
            | RingForgeError::Serialization(_) => ErrorCategory::User,

            RingForgeError::NonFiniteValues { .. }
            | RingForgeError::MissingGradient(_)
            | RingForgeError::ToleranceExceeded(_) => ErrorCategory::Numerical,

            RingForgeError::DistributedSetupFailed(_)
            | RingForgeError::InvalidRank { .. }
            | RingForgeError::CollectiveTimeout { .. }
            | RingForgeError::PeerDisconnected { .. }
            | RingForgeError::ExchangeCancelled { .. }
            | RingForgeError::ProcessGroupNotInitialized(_) => ErrorCategory::Distributed,

            RingForgeError::Logging(_)
            | RingForgeError::InternalError(_)
            | RingForgeError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// True for a collective wait that ran out of time
    pub fn is_timeout(&self) -> bool {
        matches!(self, RingForgeError::CollectiveTimeout { .. })
    }

    /// Check if this is a user-facing error (actionable by users)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this error came from the distributed fabric
    pub fn is_distributed(&self) -> bool {
        matches!(self.category(), ErrorCategory::Distributed)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
///
/// - Environment: skip or abort early, nothing is wrong with the code
/// - User: fix the input or configuration
/// - Numerical: a correctness check failed
/// - Distributed: rendezvous or exchange failed, see rank diagnostics
/// - Internal: report as bug
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Environment,
    User,
    Numerical,
    Distributed,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Environment => write!(f, "Environment"),
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Numerical => write!(f, "Numerical"),
            ErrorCategory::Distributed => write!(f, "Distributed"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for RingForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        RingForgeError::LockPoisoned(err.to_string())
    }
}

/// Helper type alias for Results using RingForgeError
pub type ForgeResult<T> = std::result::Result<T, RingForgeError>;

/// Create a configuration error with context
///
/// # Examples
/// ```ignore
/// return Err(config_error!("seq_len {} not divisible by world size {}", s, p));
/// ```
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::RingForgeError::InvalidConfiguration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RingForgeError::InvalidConfiguration(format!($fmt, $($arg)*))
    };
}

/// Create a shape error with context
#[macro_export]
macro_rules! shape_error {
    ($msg:expr) => {
        $crate::error::RingForgeError::ShapeMismatch($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RingForgeError::ShapeMismatch(format!($fmt, $($arg)*))
    };
}

/// Create an internal error with context
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::RingForgeError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RingForgeError::InternalError(format!($fmt, $($arg)*))
    };
}

/// Wrap an IO error with context
///
/// # Examples
/// ```ignore
/// let file = File::open(path).map_err(|e| io_context(e, "opening report"))?;
/// ```
pub fn io_context(err: std::io::Error, msg: &str) -> RingForgeError {
    RingForgeError::IoError(std::io::Error::new(err.kind(), format!("{}: {}", msg, err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            RingForgeError::AcceleratorUnavailable("none".to_string()).category(),
            ErrorCategory::Environment
        );
        assert_eq!(
            RingForgeError::ShapeMismatch("q vs k".to_string()).category(),
            ErrorCategory::User
        );
        assert_eq!(
            RingForgeError::NonFiniteValues {
                what: "output".to_string(),
                count: 3
            }
            .category(),
            ErrorCategory::Numerical
        );
        assert_eq!(
            RingForgeError::CollectiveTimeout {
                op: "barrier".to_string(),
                rank: 1,
                waited: Duration::from_secs(10)
            }
            .category(),
            ErrorCategory::Distributed
        );
        let cancelled = RingForgeError::ExchangeCancelled {
            op: "ring forward at step 1".to_string(),
            rank: 0,
        };
        assert!(cancelled.is_distributed());
        assert!(!cancelled.is_timeout());
        assert_eq!(
            RingForgeError::LockPoisoned("pending".to_string()).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_is_timeout_only_for_collective_timeouts() {
        let timeout = RingForgeError::CollectiveTimeout {
            op: "ring recv".to_string(),
            rank: 0,
            waited: Duration::from_millis(250),
        };
        assert!(timeout.is_timeout());
        assert!(timeout.is_distributed());

        let lost = RingForgeError::PeerDisconnected {
            op: "ring recv".to_string(),
            rank: 0,
            peer: 1,
        };
        assert!(!lost.is_timeout());
        assert!(lost.is_distributed());
    }

    #[test]
    fn test_timeout_message_is_rank_qualified() {
        let err = RingForgeError::CollectiveTimeout {
            op: "barrier".to_string(),
            rank: 3,
            waited: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "[rank 3] barrier timed out after 1.5s");
    }

    #[test]
    fn test_macros() {
        let err = config_error!("seq_len {} not divisible by {}", 10, 4);
        assert!(err.is_user_error());
        assert!(err.to_string().contains("seq_len 10"));

        let err = internal_error!("bad state");
        assert!(err.is_internal_error());
    }

    #[test]
    fn test_poison_error_conversion() {
        let lock = std::sync::Arc::new(std::sync::Mutex::new(0));
        let cloned = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison");
        })
        .join();

        let err: RingForgeError = lock.lock().unwrap_err().into();
        assert!(matches!(err, RingForgeError::LockPoisoned(_)));
    }
}
