//! Naive attention reference
//!
//! Materializes the full score matrix per (batch, head):
//! QK^T -> scale -> additive causal mask -> row softmax -> softmax x V

use super::config::{AttentionConfig, AttentionShape};
use super::mask::{causal_mask, default_positions};
use super::softmax::softmax_row;
use super::AttentionOutput;
use crate::error::ForgeResult;
use crate::tensor::Tensor;

/// Explicit softmax attention; returns the output and the per-row LSE
pub fn reference_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    config: &AttentionConfig,
) -> ForgeResult<AttentionOutput> {
    config.validate()?;
    let shape = AttentionShape::from_qkv(q, k, v)?;
    let AttentionShape {
        q_len,
        kv_len,
        head_dim: dim,
        ..
    } = shape;
    let scale = config.scale(dim);

    let mask = if config.causal {
        Some(causal_mask(
            &default_positions(q_len),
            &default_positions(kv_len),
            config.mask_fill,
        ))
    } else {
        None
    };

    let mut output = vec![0.0f32; shape.slabs() * q_len * dim];
    let mut lse = vec![0.0f32; shape.slabs() * q_len];
    let mut scores = vec![0.0f32; q_len * kv_len];

    for slab in 0..shape.slabs() {
        let q_offset = slab * q_len * dim;
        let kv_offset = slab * kv_len * dim;
        let qs = &q.data()[q_offset..q_offset + q_len * dim];
        let ks = &k.data()[kv_offset..kv_offset + kv_len * dim];
        let vs = &v.data()[kv_offset..kv_offset + kv_len * dim];

        // Step 1: scaled QK^T
        for i in 0..q_len {
            for j in 0..kv_len {
                let mut dot = 0.0f32;
                for d in 0..dim {
                    dot += qs[i * dim + d] * ks[j * dim + d];
                }
                scores[i * kv_len + j] = dot * scale;
            }
        }

        // Step 2: causal mask
        if let Some(mask) = &mask {
            for (s, m) in scores.iter_mut().zip(mask) {
                *s += m;
            }
        }

        // Step 3: softmax, then weights x V
        for i in 0..q_len {
            let row = &mut scores[i * kv_len..(i + 1) * kv_len];
            lse[slab * q_len + i] = softmax_row(row);

            let out_row = &mut output[q_offset + i * dim..q_offset + (i + 1) * dim];
            for (j, &w) in row.iter().enumerate() {
                if w == 0.0 {
                    continue;
                }
                for d in 0..dim {
                    out_row[d] += w * vs[j * dim + d];
                }
            }
        }
    }

    Ok(AttentionOutput {
        out: Tensor::from_vec(&shape.q_dims(), output)?,
        lse: Tensor::from_vec(&shape.lse_dims(), lse)?,
    })
}
