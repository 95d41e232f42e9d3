//! Tensor shapes with row-major strides

use std::fmt;

/// Stable tensor shape with stride computation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorShape {
    dims: Vec<usize>,
    strides: Vec<usize>,
}

impl TensorShape {
    /// Create tensor shape from dimensions, computing row-major strides
    pub fn from_dims(dims: &[usize]) -> Self {
        let mut strides = vec![1usize; dims.len()];

        // Last dimension varies fastest
        for i in (0..dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1]
                .checked_mul(dims[i + 1])
                .unwrap_or(usize::MAX);
        }

        Self {
            dims: dims.to_vec(),
            strides,
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Compute total number of elements
    pub fn numel(&self) -> usize {
        self.dims
            .iter()
            .copied()
            .fold(1usize, |acc, x| acc.checked_mul(x).unwrap_or(usize::MAX))
    }

    /// Product of the dimensions before `axis`
    pub fn outer(&self, axis: usize) -> usize {
        self.dims[..axis].iter().product()
    }

    /// Product of the dimensions after `axis`
    pub fn inner(&self, axis: usize) -> usize {
        self.dims[axis + 1..].iter().product()
    }

    /// Same shape with one dimension replaced
    pub fn with_dim(&self, axis: usize, size: usize) -> Self {
        let mut dims = self.dims.clone();
        dims[axis] = size;
        Self::from_dims(&dims)
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, ")")
    }
}
