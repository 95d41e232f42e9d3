//! Packed attention inputs
//!
//! `PackedQkv` holds q, k and v interleaved as `(batch, seq, 3, heads, head_dim)`,
//! `PackedKv` holds k and v as `(batch, seq, 2, heads, head_dim)`. Both unpack
//! into the `(batch, heads, seq, head_dim)` layout the kernels consume.

use super::Tensor;
use crate::error::{ForgeResult, RingForgeError};
use crate::shape_error;

/// Extract slot `slot` of a packed `(b, s, n, h, d)` tensor as `(b, h, s, d)`
fn unpack_slot(packed: &Tensor, slot: usize) -> ForgeResult<Tensor> {
    let (b, s, n, h, d) = dims5(packed)?;
    if slot >= n {
        return Err(shape_error!("slot {} out of range for {} packed slots", slot, n));
    }

    let src = packed.data();
    let mut out = Vec::with_capacity(b * h * s * d);
    for bi in 0..b {
        for hi in 0..h {
            for si in 0..s {
                let at = (((bi * s + si) * n + slot) * h + hi) * d;
                out.extend_from_slice(&src[at..at + d]);
            }
        }
    }
    Ok(Tensor::from_vec(&[b, h, s, d], out)?.with_requires_grad(packed.requires_grad()))
}

/// Interleave `(b, h, s, d)` tensors into `(b, s, n, h, d)`
fn pack_slots(parts: &[&Tensor]) -> ForgeResult<Tensor> {
    let first = parts
        .first()
        .ok_or_else(|| shape_error!("nothing to pack"))?;
    let (b, h, s, d) = first.dims4()?;
    for p in parts {
        if p.dims() != first.dims() {
            return Err(shape_error!(
                "cannot pack {} with {}",
                first.shape(),
                p.shape()
            ));
        }
    }

    let n = parts.len();
    let mut out = vec![0.0f32; b * s * n * h * d];
    for (slot, part) in parts.iter().enumerate() {
        let src = part.data();
        for bi in 0..b {
            for hi in 0..h {
                for si in 0..s {
                    let from = ((bi * h + hi) * s + si) * d;
                    let to = (((bi * s + si) * n + slot) * h + hi) * d;
                    out[to..to + d].copy_from_slice(&src[from..from + d]);
                }
            }
        }
    }
    let requires_grad = parts.iter().any(|p| p.requires_grad());
    Ok(Tensor::from_vec(&[b, s, n, h, d], out)?.with_requires_grad(requires_grad))
}

fn dims5(t: &Tensor) -> ForgeResult<(usize, usize, usize, usize, usize)> {
    match *t.dims() {
        [b, s, n, h, d] => Ok((b, s, n, h, d)),
        _ => Err(RingForgeError::InvalidTensorShape(format!(
            "packed tensor must be (batch, seq, n, heads, head_dim), got {}",
            t.shape()
        ))),
    }
}

fn check_slots(t: &Tensor, expected: usize, what: &str) -> ForgeResult<()> {
    let (_, _, n, _, _) = dims5(t)?;
    if n != expected {
        return Err(RingForgeError::InvalidTensorShape(format!(
            "{} needs {} packed slots, got {}",
            what,
            expected,
            t.shape()
        )));
    }
    Ok(())
}

/// q, k and v packed along a slot axis
#[derive(Debug, Clone)]
pub struct PackedQkv {
    tensor: Tensor,
}

impl PackedQkv {
    pub fn new(tensor: Tensor) -> ForgeResult<Self> {
        check_slots(&tensor, 3, "qkv")?;
        Ok(Self { tensor })
    }

    pub fn randn(batch: usize, seq_len: usize, heads: usize, head_dim: usize, seed: u64) -> Self {
        Self {
            tensor: Tensor::randn(&[batch, seq_len, 3, heads, head_dim], seed),
        }
    }

    pub fn pack(q: &Tensor, k: &Tensor, v: &Tensor) -> ForgeResult<Self> {
        Self::new(pack_slots(&[q, k, v])?)
    }

    /// `(q, k, v)` in `(batch, heads, seq, head_dim)` layout
    pub fn unpack(&self) -> ForgeResult<(Tensor, Tensor, Tensor)> {
        Ok((
            unpack_slot(&self.tensor, 0)?,
            unpack_slot(&self.tensor, 1)?,
            unpack_slot(&self.tensor, 2)?,
        ))
    }

    pub fn seq_len(&self) -> usize {
        self.tensor.dims()[1]
    }

    /// Split along the sequence axis
    pub fn chunk_seq(&self, chunks: usize) -> ForgeResult<Vec<PackedQkv>> {
        self.tensor
            .chunk(chunks, 1)?
            .into_iter()
            .map(Self::new)
            .collect()
    }

    pub fn narrow_seq(&self, start: usize, len: usize) -> ForgeResult<PackedQkv> {
        Self::new(self.tensor.narrow(1, start, len)?)
    }

    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.tensor.set_requires_grad(requires_grad);
        self
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn into_tensor(self) -> Tensor {
        self.tensor
    }
}

/// k and v packed along a slot axis
#[derive(Debug, Clone)]
pub struct PackedKv {
    tensor: Tensor,
}

impl PackedKv {
    pub fn new(tensor: Tensor) -> ForgeResult<Self> {
        check_slots(&tensor, 2, "kv")?;
        Ok(Self { tensor })
    }

    pub fn pack(k: &Tensor, v: &Tensor) -> ForgeResult<Self> {
        Self::new(pack_slots(&[k, v])?)
    }

    pub fn unpack(&self) -> ForgeResult<(Tensor, Tensor)> {
        Ok((unpack_slot(&self.tensor, 0)?, unpack_slot(&self.tensor, 1)?))
    }

    pub fn seq_len(&self) -> usize {
        self.tensor.dims()[1]
    }

    pub fn chunk_seq(&self, chunks: usize) -> ForgeResult<Vec<PackedKv>> {
        self.tensor
            .chunk(chunks, 1)?
            .into_iter()
            .map(Self::new)
            .collect()
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }
}
