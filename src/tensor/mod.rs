//! Dense f32 tensors
//!
//! Row-major host tensors used by the attention kernels, the ring protocol and
//! the harness. Each buffer is registered with the device memory tracker for
//! as long as it lives.

pub mod packed;
pub mod shape;

pub use packed::{PackedKv, PackedQkv};
pub use shape::TensorShape;

use crate::device::MemoryLease;
use crate::error::{ForgeResult, RingForgeError};
use crate::shape_error;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::ops::Range;

/// Row-major f32 tensor
#[derive(Debug)]
pub struct Tensor {
    shape: TensorShape,
    data: Vec<f32>,
    requires_grad: bool,
    _lease: MemoryLease,
}

impl Clone for Tensor {
    fn clone(&self) -> Self {
        Self::build(self.shape.clone(), self.data.clone(), self.requires_grad)
    }
}

impl Tensor {
    fn build(shape: TensorShape, data: Vec<f32>, requires_grad: bool) -> Self {
        let lease = MemoryLease::acquire(data.len() * std::mem::size_of::<f32>());
        Self {
            shape,
            data,
            requires_grad,
            _lease: lease,
        }
    }

    pub fn zeros(dims: &[usize]) -> Self {
        Self::full(dims, 0.0)
    }

    pub fn full(dims: &[usize], value: f32) -> Self {
        let shape = TensorShape::from_dims(dims);
        let data = vec![value; shape.numel()];
        Self::build(shape, data, false)
    }

    /// Wrap an existing buffer; its length must match the shape
    pub fn from_vec(dims: &[usize], data: Vec<f32>) -> ForgeResult<Self> {
        let shape = TensorShape::from_dims(dims);
        if shape.numel() != data.len() {
            return Err(RingForgeError::InvalidTensorShape(format!(
                "shape {} needs {} elements, got {}",
                shape,
                shape.numel(),
                data.len()
            )));
        }
        Ok(Self::build(shape, data, false))
    }

    /// Standard-normal values from a seeded generator
    pub fn randn(dims: &[usize], seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::randn_with(dims, &mut rng)
    }

    pub fn randn_with<R: Rng + ?Sized>(dims: &[usize], rng: &mut R) -> Self {
        let shape = TensorShape::from_dims(dims);
        let data = (0..shape.numel())
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect();
        Self::build(shape, data, false)
    }

    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.dims())
    }

    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Size of the buffer in bytes
    pub fn nbytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    /// Dimensions of a rank-3 tensor
    pub fn dims3(&self) -> ForgeResult<(usize, usize, usize)> {
        match *self.dims() {
            [a, b, c] => Ok((a, b, c)),
            _ => Err(RingForgeError::InvalidTensorShape(format!(
                "expected rank 3, got {}",
                self.shape
            ))),
        }
    }

    /// Dimensions of a rank-4 tensor
    pub fn dims4(&self) -> ForgeResult<(usize, usize, usize, usize)> {
        match *self.dims() {
            [a, b, c, d] => Ok((a, b, c, d)),
            _ => Err(RingForgeError::InvalidTensorShape(format!(
                "expected rank 4, got {}",
                self.shape
            ))),
        }
    }

    fn check_axis(&self, axis: usize) -> ForgeResult<()> {
        if axis >= self.shape.rank() {
            return Err(RingForgeError::InvalidTensorShape(format!(
                "axis {} out of range for {}",
                axis, self.shape
            )));
        }
        Ok(())
    }

    /// Copy of `len` entries along `axis` starting at `start`
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> ForgeResult<Tensor> {
        self.gather(axis, &[start..start + len])
    }

    /// Concatenation of several ranges along `axis`, in the given order
    pub fn gather(&self, axis: usize, ranges: &[Range<usize>]) -> ForgeResult<Tensor> {
        self.check_axis(axis)?;
        let extent = self.dims()[axis];
        for r in ranges {
            if r.start > r.end || r.end > extent {
                return Err(shape_error!(
                    "range {:?} out of bounds for axis {} of {}",
                    r,
                    axis,
                    self.shape
                ));
            }
        }

        let outer = self.shape.outer(axis);
        let inner = self.shape.inner(axis);
        let total: usize = ranges.iter().map(|r| r.len()).sum();
        let mut data = Vec::with_capacity(outer * total * inner);

        for o in 0..outer {
            let base = o * extent * inner;
            for r in ranges {
                data.extend_from_slice(&self.data[base + r.start * inner..base + r.end * inner]);
            }
        }

        Ok(Self::build(
            self.shape.with_dim(axis, total),
            data,
            self.requires_grad,
        ))
    }

    /// Split into `chunks` equal parts along `axis`
    pub fn chunk(&self, chunks: usize, axis: usize) -> ForgeResult<Vec<Tensor>> {
        self.check_axis(axis)?;
        let extent = self.dims()[axis];
        if chunks == 0 || extent % chunks != 0 {
            return Err(shape_error!(
                "axis {} of {} does not split into {} chunks",
                axis,
                self.shape,
                chunks
            ));
        }
        let len = extent / chunks;
        (0..chunks)
            .map(|i| self.narrow(axis, i * len, len))
            .collect()
    }

    /// Concatenate tensors along `axis`; all other dimensions must agree
    pub fn cat(tensors: &[&Tensor], axis: usize) -> ForgeResult<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| shape_error!("cat of zero tensors"))?;
        first.check_axis(axis)?;

        let mut extent = 0;
        for t in tensors {
            let same_rank = t.shape.rank() == first.shape.rank();
            let others_match = same_rank
                && t.dims()
                    .iter()
                    .zip(first.dims())
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !others_match {
                return Err(shape_error!(
                    "cannot cat {} with {} along axis {}",
                    first.shape,
                    t.shape,
                    axis
                ));
            }
            extent += t.dims()[axis];
        }

        let outer = first.shape.outer(axis);
        let inner = first.shape.inner(axis);
        let mut data = Vec::with_capacity(outer * extent * inner);
        for o in 0..outer {
            for t in tensors {
                let len = t.dims()[axis] * inner;
                data.extend_from_slice(&t.data[o * len..(o + 1) * len]);
            }
        }

        Ok(Self::build(
            first.shape.with_dim(axis, extent),
            data,
            first.requires_grad,
        ))
    }

    fn check_same_shape(&self, other: &Tensor) -> ForgeResult<()> {
        if self.shape != other.shape {
            return Err(shape_error!("{} vs {}", self.shape, other.shape));
        }
        Ok(())
    }

    /// Elementwise `self += other`
    pub fn add_assign(&mut self, other: &Tensor) -> ForgeResult<()> {
        self.check_same_shape(other)?;
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += *b;
        }
        Ok(())
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().map(|&x| x as f64).sum()
    }

    pub fn non_finite_count(&self) -> usize {
        self.data.iter().filter(|x| !x.is_finite()).count()
    }

    pub fn has_non_finite(&self) -> bool {
        self.data.iter().any(|x| !x.is_finite())
    }

    /// Error with the count of NaN/Inf entries, if any
    pub fn ensure_finite(&self, what: &str) -> ForgeResult<()> {
        let count = self.non_finite_count();
        if count > 0 {
            return Err(RingForgeError::NonFiniteValues {
                what: what.to_string(),
                count,
            });
        }
        Ok(())
    }

    /// Largest elementwise |a - b|; infinities of equal sign count as equal
    /// Largest elementwise difference; NaN if any pair differs by NaN
    pub fn max_abs_diff(&self, other: &Tensor) -> ForgeResult<f32> {
        self.check_same_shape(other)?;
        Ok(self
            .data
            .iter()
            .zip(&other.data)
            .map(|(&a, &b)| abs_diff(a, b))
            .fold(0.0f32, |max, d| if max.is_nan() || d.is_nan() { f32::NAN } else { max.max(d) }))
    }

    pub fn mean_abs_diff(&self, other: &Tensor) -> ForgeResult<f32> {
        self.check_same_shape(other)?;
        if self.data.is_empty() {
            return Ok(0.0);
        }
        let total: f64 = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(&a, &b)| abs_diff(a, b) as f64)
            .sum();
        Ok((total / self.data.len() as f64) as f32)
    }

    /// `|a - b| <= atol + rtol * |b|` for every element
    pub fn allclose(&self, other: &Tensor, rtol: f32, atol: f32) -> ForgeResult<bool> {
        self.check_same_shape(other)?;
        Ok(self
            .data
            .iter()
            .zip(&other.data)
            .all(|(&a, &b)| abs_diff(a, b) <= atol + rtol * b.abs()))
    }
}

fn abs_diff(a: f32, b: f32) -> f32 {
    if a == b {
        // covers matching infinities
        0.0
    } else {
        (a - b).abs()
    }
}
