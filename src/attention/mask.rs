//! Causal masking over global token positions
//!
//! Positions are the tokens' indices in the full (unsharded) sequence. A query
//! at position `i` may attend to a key at position `j` iff `j <= i`. Position
//! lists are always ascending, so the visible keys of a query form a prefix.

use serde::{Deserialize, Serialize};

/// Fill value for masked scores in the explicit (reference) path
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MaskFill {
    #[default]
    NegInfinity,
    /// A large negative constant (-1e9)
    LargeNegative,
}

impl MaskFill {
    pub const LARGE_NEGATIVE: f32 = -1e9;

    pub fn value(&self) -> f32 {
        match self {
            MaskFill::NegInfinity => f32::NEG_INFINITY,
            MaskFill::LargeNegative => Self::LARGE_NEGATIVE,
        }
    }
}

/// `0..len` as positions
pub fn default_positions(len: usize) -> Vec<usize> {
    (0..len).collect()
}

/// Number of leading keys a query at `q_pos` can see
pub fn visible_keys(q_pos: usize, k_positions: &[usize], causal: bool) -> usize {
    if causal {
        k_positions.partition_point(|&k| k <= q_pos)
    } else {
        k_positions.len()
    }
}

/// True when no query can see any key, i.e. every key is in the future
pub fn block_fully_masked(q_positions: &[usize], k_positions: &[usize]) -> bool {
    match (q_positions.last(), k_positions.first()) {
        (Some(&q_max), Some(&k_min)) => k_min > q_max,
        _ => true,
    }
}

/// Additive `[q_len, kv_len]` mask: 0 where visible, `fill` where masked
pub fn causal_mask(q_positions: &[usize], k_positions: &[usize], fill: MaskFill) -> Vec<f32> {
    let mut mask = vec![0.0f32; q_positions.len() * k_positions.len()];
    for (i, &qp) in q_positions.iter().enumerate() {
        let row = &mut mask[i * k_positions.len()..(i + 1) * k_positions.len()];
        for (j, &kp) in k_positions.iter().enumerate() {
            if kp > qp {
                row[j] = fill.value();
            }
        }
    }
    mask
}
