//! Blockwise flash attention on the host compute pool
//!
//! Forward walks the visible keys of each query row in blocks of
//! `block_size`, carrying the online-softmax state (running max, running sum,
//! weighted accumulator) instead of materializing the score matrix. Backward
//! recomputes the probabilities from the saved LSE. Both run one rayon task
//! per (batch, head) slab.
//!
//! The `_at` variants take explicit global token positions for the query and
//! key rows; the ring coordinator uses them to apply the causal mask to
//! shards that are not aligned with the start of the sequence.

use super::config::{AttentionConfig, AttentionShape};
use super::mask::{default_positions, visible_keys};
use super::softmax::OnlineSoftmax;
use super::{AttentionGrads, AttentionOutput};
use crate::config_error;
use crate::error::ForgeResult;
use crate::shape_error;
use crate::tensor::Tensor;
use rayon::prelude::*;

/// Gradients for every input of one attention call, whether requested or not
#[derive(Debug, Clone)]
pub struct BlockGrads {
    pub dq: Tensor,
    pub dk: Tensor,
    pub dv: Tensor,
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn check_positions(positions: &[usize], len: usize, what: &str) -> ForgeResult<()> {
    if positions.len() != len {
        return Err(config_error!(
            "{} positions: expected {}, got {}",
            what,
            len,
            positions.len()
        ));
    }
    if positions.windows(2).any(|w| w[0] > w[1]) {
        return Err(config_error!("{} positions must be ascending", what));
    }
    Ok(())
}

/// Flash attention with positions `0..q_len` and `0..kv_len`
pub fn flash_attention_forward(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    config: &AttentionConfig,
) -> ForgeResult<AttentionOutput> {
    let shape = AttentionShape::from_qkv(q, k, v)?;
    flash_attention_forward_at(
        q,
        k,
        v,
        &default_positions(shape.q_len),
        &default_positions(shape.kv_len),
        config,
    )
}

/// Flash attention over explicit global positions.
///
/// Query rows that see no key produce a zero output row with LSE -inf.
pub fn flash_attention_forward_at(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    q_positions: &[usize],
    k_positions: &[usize],
    config: &AttentionConfig,
) -> ForgeResult<AttentionOutput> {
    config.validate()?;
    let shape = AttentionShape::from_qkv(q, k, v)?;
    check_positions(q_positions, shape.q_len, "query")?;
    check_positions(k_positions, shape.kv_len, "key")?;

    let dim = shape.head_dim;
    let scale = config.scale(dim);
    let q_slab = shape.q_len * dim;
    let kv_slab = shape.kv_len * dim;

    let mut output = vec![0.0f32; shape.slabs() * q_slab];
    let mut lse = vec![f32::NEG_INFINITY; shape.slabs() * shape.q_len];

    output
        .par_chunks_mut(q_slab.max(1))
        .zip(lse.par_chunks_mut(shape.q_len.max(1)))
        .enumerate()
        .for_each(|(slab, (out, lse))| {
            let qs = &q.data()[slab * q_slab..(slab + 1) * q_slab];
            let ks = &k.data()[slab * kv_slab..(slab + 1) * kv_slab];
            let vs = &v.data()[slab * kv_slab..(slab + 1) * kv_slab];

            let mut scores = vec![0.0f32; config.block_size];
            for (i, &qp) in q_positions.iter().enumerate() {
                let qi = &qs[i * dim..(i + 1) * dim];
                let visible = visible_keys(qp, k_positions, config.causal);
                let mut state = OnlineSoftmax::new(dim);

                let mut start = 0;
                while start < visible {
                    let end = (start + config.block_size).min(visible);
                    for j in start..end {
                        scores[j - start] = dot(qi, &ks[j * dim..(j + 1) * dim]) * scale;
                    }
                    state.update(&scores[..end - start], &vs[start * dim..end * dim]);
                    start = end;
                }

                lse[i] = state.finish(&mut out[i * dim..(i + 1) * dim]);
            }
        });

    Ok(AttentionOutput {
        out: Tensor::from_vec(&shape.q_dims(), output)?,
        lse: Tensor::from_vec(&shape.lse_dims(), lse)?,
    })
}

/// Gradients of flash attention with positions `0..q_len` and `0..kv_len`.
///
/// Only inputs flagged `requires_grad` get a gradient.
pub fn flash_attention_backward(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    out: &Tensor,
    lse: &Tensor,
    dout: &Tensor,
    config: &AttentionConfig,
) -> ForgeResult<AttentionGrads> {
    let shape = AttentionShape::from_qkv(q, k, v)?;
    let grads = flash_attention_backward_at(
        q,
        k,
        v,
        out,
        lse,
        dout,
        &default_positions(shape.q_len),
        &default_positions(shape.kv_len),
        config,
    )?;
    Ok(AttentionGrads::select(grads, q, k, v))
}

/// Gradients of flash attention over explicit global positions.
///
/// `out` and `lse` must be the final (globally normalized) forward results
/// for these query rows; the key rows may be any subset of the keys, in which
/// case the returned gradients are that subset's contribution.
#[allow(clippy::too_many_arguments)]
pub fn flash_attention_backward_at(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    out: &Tensor,
    lse: &Tensor,
    dout: &Tensor,
    q_positions: &[usize],
    k_positions: &[usize],
    config: &AttentionConfig,
) -> ForgeResult<BlockGrads> {
    config.validate()?;
    let shape = AttentionShape::from_qkv(q, k, v)?;
    check_positions(q_positions, shape.q_len, "query")?;
    check_positions(k_positions, shape.kv_len, "key")?;
    for (name, t) in [("out", out), ("dout", dout)] {
        if t.dims() != shape.q_dims() {
            return Err(shape_error!("{} {} does not match q {}", name, t.shape(), q.shape()));
        }
    }
    if lse.dims() != shape.lse_dims() {
        return Err(shape_error!(
            "lse {} must be (batch, heads, q_len) for q {}",
            lse.shape(),
            q.shape()
        ));
    }

    let dim = shape.head_dim;
    let scale = config.scale(dim);
    let q_slab = shape.q_len * dim;
    let kv_slab = shape.kv_len * dim;

    let per_slab: Vec<(Vec<f32>, Vec<f32>, Vec<f32>)> = (0..shape.slabs())
        .into_par_iter()
        .map(|slab| {
            let qs = &q.data()[slab * q_slab..(slab + 1) * q_slab];
            let ks = &k.data()[slab * kv_slab..(slab + 1) * kv_slab];
            let vs = &v.data()[slab * kv_slab..(slab + 1) * kv_slab];
            let os = &out.data()[slab * q_slab..(slab + 1) * q_slab];
            let dos = &dout.data()[slab * q_slab..(slab + 1) * q_slab];
            let ls = &lse.data()[slab * shape.q_len..(slab + 1) * shape.q_len];

            let mut dq = vec![0.0f32; q_slab];
            let mut dk = vec![0.0f32; kv_slab];
            let mut dv = vec![0.0f32; kv_slab];

            for (i, &qp) in q_positions.iter().enumerate() {
                let li = ls[i];
                if li == f32::NEG_INFINITY {
                    continue;
                }
                let qi = &qs[i * dim..(i + 1) * dim];
                let doi = &dos[i * dim..(i + 1) * dim];
                // D_i = rowsum(dout * out)
                let delta = dot(doi, &os[i * dim..(i + 1) * dim]);

                for j in 0..visible_keys(qp, k_positions, config.causal) {
                    let kj = &ks[j * dim..(j + 1) * dim];
                    let vj = &vs[j * dim..(j + 1) * dim];

                    let p = (dot(qi, kj) * scale - li).exp();
                    let ds = p * (dot(doi, vj) - delta) * scale;

                    for d in 0..dim {
                        dv[j * dim + d] += p * doi[d];
                        dq[i * dim + d] += ds * kj[d];
                        dk[j * dim + d] += ds * qi[d];
                    }
                }
            }
            (dq, dk, dv)
        })
        .collect();

    let mut dq = Vec::with_capacity(shape.slabs() * q_slab);
    let mut dk = Vec::with_capacity(shape.slabs() * kv_slab);
    let mut dv = Vec::with_capacity(shape.slabs() * kv_slab);
    for (sq, sk, sv) in per_slab {
        dq.extend(sq);
        dk.extend(sk);
        dv.extend(sv);
    }

    Ok(BlockGrads {
        dq: Tensor::from_vec(&shape.q_dims(), dq)?,
        dk: Tensor::from_vec(&shape.kv_dims(), dk)?,
        dv: Tensor::from_vec(&shape.kv_dims(), dv)?,
    })
}
