//! Ring test fixtures

use ringforge::attention::{
    compare, flash_attention_backward, flash_attention_forward, AttentionConfig, AttentionGrads,
    AttentionOutput, Tolerance,
};
use ringforge::device::Capability;
use ringforge::ring::ShardLayout;
use ringforge::tensor::PackedQkv;
use ringforge::Tensor;

/// Ring results against single-device results on the same data
pub const RING_TOLERANCE: Tolerance = Tolerance::Close {
    rtol: 2e-3,
    atol: 2e-3,
};

/// Panic with the diff statistics when `actual` is out of [`RING_TOLERANCE`]
pub fn assert_ring_close(actual: &Tensor, expected: &Tensor, what: &str) {
    let cmp = compare(actual, expected, RING_TOLERANCE).expect("comparable shapes");
    assert!(
        cmp.within,
        "{}: max_abs_diff={} mean_abs_diff={}",
        what, cmp.max_abs_diff, cmp.mean_abs_diff
    );
}

/// Capability with `devices` logical devices, independent of the host
pub fn test_capability(devices: usize) -> Capability {
    Capability {
        available: true,
        device_count: devices,
        compute_threads: 1,
        reason: None,
    }
}

/// One full sequence, its upstream gradient, and the single-device results
pub struct RingFixture {
    pub seq_len: usize,
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    pub dout: Tensor,
    pub expected: AttentionOutput,
    pub grads: AttentionGrads,
}

/// One rank's slice of a [`RingFixture`]
pub struct LocalShard {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    pub dout: Tensor,
}

impl RingFixture {
    pub fn new(batch: usize, seq_len: usize, heads: usize, head_dim: usize, seed: u64) -> Self {
        let packed = PackedQkv::randn(batch, seq_len, heads, head_dim, seed);
        let (q, k, v) = packed.unpack().expect("unpack fixture qkv");
        let (q, k, v) = (
            q.with_requires_grad(true),
            k.with_requires_grad(true),
            v.with_requires_grad(true),
        );
        let dout = Tensor::randn(&[batch, heads, seq_len, head_dim], seed + 1);

        let cfg = AttentionConfig::causal();
        let expected = flash_attention_forward(&q, &k, &v, &cfg).expect("fixture forward");
        let grads = flash_attention_backward(&q, &k, &v, &expected.out, &expected.lse, &dout, &cfg)
            .expect("fixture backward");

        Self {
            seq_len,
            q,
            k,
            v,
            dout,
            expected,
            grads,
        }
    }

    /// Inputs owned by `rank`, flagged `requires_grad`
    pub fn local(&self, layout: ShardLayout, world_size: usize, rank: usize) -> LocalShard {
        let shard = |t: &Tensor| layout.shard(t, 2, world_size, rank).expect("shard fixture");
        LocalShard {
            q: shard(&self.q).with_requires_grad(true),
            k: shard(&self.k).with_requires_grad(true),
            v: shard(&self.v).with_requires_grad(true),
            dout: shard(&self.dout),
        }
    }

    /// `full` restricted to the rows owned by `rank`
    pub fn expected_rows(&self, full: &Tensor, layout: ShardLayout, world_size: usize, rank: usize) -> Tensor {
        layout.shard(full, 2, world_size, rank).expect("shard expected")
    }
}
