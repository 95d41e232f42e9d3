//! Numerical comparison of attention results

use crate::error::{ForgeResult, RingForgeError};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Acceptance bound for comparing two tensors
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Tolerance {
    /// allclose: `|a - b| <= atol + rtol * |b|` elementwise
    Close { rtol: f32, atol: f32 },
    /// Bounds on the largest and the mean absolute difference
    Loose { max_abs: f32, mean_abs: f32 },
}

impl Tolerance {
    /// Same-precision comparisons
    pub const CLOSE: Tolerance = Tolerance::Close {
        rtol: 1e-3,
        atol: 1e-3,
    };

    /// Comparisons across differently-optimized kernels
    pub const LOOSE: Tolerance = Tolerance::Loose {
        max_abs: 0.1,
        mean_abs: 0.01,
    };

    pub fn close(rtol: f32, atol: f32) -> Self {
        Tolerance::Close { rtol, atol }
    }

    pub fn loose(max_abs: f32, mean_abs: f32) -> Self {
        Tolerance::Loose { max_abs, mean_abs }
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Tolerance::LOOSE
    }
}

impl fmt::Display for Tolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tolerance::Close { rtol, atol } => write!(f, "allclose(rtol={}, atol={})", rtol, atol),
            Tolerance::Loose { max_abs, mean_abs } => {
                write!(f, "max_abs<{}, mean_abs<{}", max_abs, mean_abs)
            }
        }
    }
}

/// What to do when a comparison is out of tolerance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TolerancePolicy {
    #[default]
    Fail,
    /// Log a warning and continue
    Warn,
}

/// Outcome of comparing `actual` against `expected`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Comparison {
    pub max_abs_diff: f32,
    pub mean_abs_diff: f32,
    pub tolerance: Tolerance,
    pub within: bool,
}

impl Comparison {
    /// Apply the policy: out-of-tolerance is an error under `Fail`, a warning under `Warn`
    pub fn enforce(&self, what: &str, policy: TolerancePolicy) -> ForgeResult<()> {
        if self.within {
            return Ok(());
        }
        match policy {
            TolerancePolicy::Fail => Err(RingForgeError::ToleranceExceeded(format!(
                "{}: {} (bound {})",
                what, self, self.tolerance
            ))),
            TolerancePolicy::Warn => {
                tracing::warn!(
                    what,
                    max_abs_diff = self.max_abs_diff,
                    mean_abs_diff = self.mean_abs_diff,
                    "{} outside {}, continuing",
                    what,
                    self.tolerance
                );
                Ok(())
            }
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "max_abs_diff={:.3e}, mean_abs_diff={:.3e}",
            self.max_abs_diff, self.mean_abs_diff
        )
    }
}

pub fn compare(actual: &Tensor, expected: &Tensor, tolerance: Tolerance) -> ForgeResult<Comparison> {
    let max_abs_diff = actual.max_abs_diff(expected)?;
    let mean_abs_diff = actual.mean_abs_diff(expected)?;
    let within = match tolerance {
        Tolerance::Close { rtol, atol } => actual.allclose(expected, rtol, atol)?,
        Tolerance::Loose { max_abs, mean_abs } => {
            max_abs_diff < max_abs && mean_abs_diff < mean_abs
        }
    };
    Ok(Comparison {
        max_abs_diff,
        mean_abs_diff,
        tolerance,
        within,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(delta: f32) -> (Tensor, Tensor) {
        let a = Tensor::from_vec(&[4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = Tensor::from_vec(&[4], vec![1.0, 2.0, 3.0, 4.0 + delta]).unwrap();
        (a, b)
    }

    #[test]
    fn test_close_tolerance() {
        let (a, b) = pair(1e-4);
        assert!(compare(&a, &b, Tolerance::CLOSE).unwrap().within);

        let (a, b) = pair(0.5);
        assert!(!compare(&a, &b, Tolerance::CLOSE).unwrap().within);
    }

    #[test]
    fn test_loose_tolerance_uses_mean() {
        // max 0.08 < 0.1, mean 0.02 >= 0.01
        let (a, b) = pair(0.08);
        let cmp = compare(&a, &b, Tolerance::LOOSE).unwrap();
        assert!((cmp.max_abs_diff - 0.08).abs() < 1e-6);
        assert!(!cmp.within);

        assert!(compare(&a, &b, Tolerance::loose(0.1, 0.05)).unwrap().within);
    }

    #[test]
    fn test_nan_never_within() {
        let (a, b) = pair(f32::NAN);
        let cmp = compare(&a, &b, Tolerance::loose(1e3, 1e3)).unwrap();
        assert!(cmp.max_abs_diff.is_nan());
        assert!(!cmp.within);
    }

    #[test]
    fn test_policy() {
        let (a, b) = pair(1.0);
        let cmp = compare(&a, &b, Tolerance::LOOSE).unwrap();

        let err = cmp.enforce("output", TolerancePolicy::Fail).unwrap_err();
        assert!(matches!(err, RingForgeError::ToleranceExceeded(_)));
        assert!(err.to_string().contains("output"));

        assert!(cmp.enforce("output", TolerancePolicy::Warn).is_ok());
    }

    #[test]
    fn test_tolerance_serde() {
        let json = serde_json::to_string(&Tolerance::close(1e-3, 1e-3)).unwrap();
        assert!(json.contains("\"kind\":\"close\""));
        let back: Tolerance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Tolerance::close(1e-3, 1e-3));

        let policy: TolerancePolicy = serde_json::from_str("\"warn\"").unwrap();
        assert_eq!(policy, TolerancePolicy::Warn);
    }
}
