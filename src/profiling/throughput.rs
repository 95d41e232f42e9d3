//! FLOP accounting for attention

use std::time::Duration;

/// Forward FLOPs of one attention call: two `seq x seq x head_dim` matmuls
/// (QK^T and PV) per (batch, head), two FLOPs per multiply-add.
pub fn attention_flops(batch: usize, heads: usize, seq_len: usize, head_dim: usize) -> f64 {
    4.0 * batch as f64 * seq_len as f64 * seq_len as f64 * heads as f64 * head_dim as f64
}

/// TFLOP/s for `flops` done in `elapsed`; zero for a zero-length interval
pub fn tflops(flops: f64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    flops / secs / 1e12
}
