//! Ring-parallel attention
//!
//! Each participant holds one shard of the sequence for q, k and v (laid out
//! `(batch, heads, local_seq, head_dim)`). Key/value shards travel around the
//! ring so every rank sees every key exactly once; partial softmax statistics
//! are merged through the log-sum-exp so the local rows of the result equal
//! the corresponding rows of single-device attention over the full sequence.
//!
//! With one participant every entry point falls through to the flash kernel
//! and never touches the communicator.

pub mod backward;
pub mod forward;
pub mod shard;

pub use shard::ShardLayout;

use crate::attention::{
    flash_attention_backward, flash_attention_forward, AttentionConfig, AttentionGrads,
    AttentionOutput, AttentionShape,
};
use crate::config_error;
use crate::distributed::comm::{CancelToken, Tag};
use crate::distributed::context::ClusterContext;
use crate::error::{ForgeResult, RingForgeError};
use crate::profiling::ScopedTimer;
use crate::tensor::packed::{PackedKv, PackedQkv};
use crate::tensor::Tensor;
use std::time::Duration;

/// Ring results are ordinary attention results restricted to the local rows
pub type RingOutput = AttentionOutput;

/// Default bound on each shard receive
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) const FORWARD_TAG_BASE: Tag = 0;
pub(crate) const BACKWARD_TAG_BASE: Tag = 1 << 20;
pub(crate) const SLOT_K: Tag = 0;
pub(crate) const SLOT_V: Tag = 1;
pub(crate) const SLOT_DK: Tag = 2;
pub(crate) const SLOT_DV: Tag = 3;
const SLOTS: usize = 4;
/// Low tag bits hold the round, the rest the exchange epoch
const ROUND_BITS: u32 = 24;

/// Message tag for one tensor of one exchange round of call `epoch`
pub(crate) fn exchange_tag(epoch: u64, base: Tag, step: usize, slot: Tag) -> ForgeResult<Tag> {
    let round = step
        .checked_mul(SLOTS)
        .and_then(|offset| Tag::try_from(offset).ok())
        .and_then(|offset| offset.checked_add(slot))
        .filter(|offset| *offset < BACKWARD_TAG_BASE)
        .map(|offset| base + offset);
    let epoch_bits = epoch
        .checked_mul(1 << ROUND_BITS)
        .filter(|bits| *bits < crate::distributed::comm::RESERVED_TAG_BASE);
    match (round, epoch_bits) {
        (Some(round), Some(epoch_bits)) => Ok(epoch_bits | round),
        _ => Err(RingForgeError::InternalError(format!(
            "tag overflow at ring step {} of exchange {}",
            step, epoch
        ))),
    }
}

/// Compute steps a rank ran and skipped during one ring pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RingStats {
    pub computed: usize,
    pub skipped: usize,
}

/// Configuration for ring attention
#[derive(Debug, Clone, PartialEq)]
pub struct RingConfig {
    pub attention: AttentionConfig,
    pub layout: ShardLayout,
    /// Bound on each receive; exceeding it is a `CollectiveTimeout`
    pub exchange_timeout: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            attention: AttentionConfig::causal(),
            layout: ShardLayout::Contiguous,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
        }
    }
}

impl RingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attention(mut self, attention: AttentionConfig) -> Self {
        self.attention = attention;
        self
    }

    pub fn with_causal(mut self, causal: bool) -> Self {
        self.attention.causal = causal;
        self
    }

    pub fn with_layout(mut self, layout: ShardLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }
}

/// Where this rank sits in the ring and which tokens every rank owns
#[derive(Debug, Clone)]
pub(crate) struct RingPlan {
    pub rank: usize,
    pub world_size: usize,
    pub layout: ShardLayout,
    pub seq_len: usize,
    pub timeout: Duration,
    pub epoch: u64,
    pub cancel: CancelToken,
}

impl RingPlan {
    fn new(ctx: &ClusterContext, q: &Tensor, k: &Tensor, v: &Tensor, config: &RingConfig) -> ForgeResult<Self> {
        let shape = AttentionShape::from_qkv(q, k, v)?;
        if shape.q_len != shape.kv_len {
            return Err(config_error!(
                "ring attention needs equal local query and key lengths, got {} and {}",
                shape.q_len,
                shape.kv_len
            ));
        }

        let world_size = ctx.world_size();
        let seq_len = shape.q_len * world_size;
        config.layout.validate(seq_len, world_size)?;
        let exchange = ctx.begin_exchange()?;

        Ok(Self {
            rank: ctx.rank(),
            world_size,
            layout: config.layout,
            seq_len,
            timeout: config.exchange_timeout,
            epoch: exchange.epoch,
            cancel: exchange.cancel,
        })
    }

    pub fn tag(&self, base: Tag, step: usize, slot: Tag) -> ForgeResult<Tag> {
        exchange_tag(self.epoch, base, step, slot)
    }

    /// Fails once the call has been abandoned
    pub fn ensure_live(&self, op: &str, step: usize) -> ForgeResult<()> {
        if self.cancel.is_cancelled() {
            return Err(RingForgeError::ExchangeCancelled {
                op: format!("{} at step {}", op, step),
                rank: self.rank,
            });
        }
        Ok(())
    }

    pub fn next(&self) -> usize {
        (self.rank + 1) % self.world_size
    }

    pub fn prev(&self) -> usize {
        (self.rank + self.world_size - 1) % self.world_size
    }

    /// Owner of the shard held at `step`
    pub fn source(&self, step: usize) -> usize {
        (self.rank + self.world_size - step % self.world_size) % self.world_size
    }

    pub fn positions(&self, rank: usize) -> ForgeResult<Vec<usize>> {
        self.layout.positions(self.seq_len, self.world_size, rank)
    }
}

/// Ring attention over contiguous shards
pub fn ring_attention(
    ctx: &ClusterContext,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    config: &RingConfig,
) -> ForgeResult<RingOutput> {
    config.attention.validate()?;
    if ctx.is_single() {
        return flash_attention_forward(q, k, v, &config.attention);
    }

    let plan = RingPlan::new(ctx, q, k, v, config)?;
    let comm = ctx.comm()?;
    let _timer = ScopedTimer::new("ring_attention_forward");
    tracing::debug!(
        rank = plan.rank,
        world_size = plan.world_size,
        layout = %plan.layout,
        seq_len = plan.seq_len,
        epoch = plan.epoch,
        "ring forward"
    );
    let (output, stats) = forward::ring_forward(comm.as_ref(), &plan, q, k, v, &config.attention)?;
    tracing::debug!(
        rank = plan.rank,
        computed = stats.computed,
        skipped = stats.skipped,
        "ring forward done"
    );
    Ok(output)
}

/// Ring attention on a packed `(batch, local_seq, 3, heads, head_dim)` shard
pub fn ring_attention_qkvpacked(
    ctx: &ClusterContext,
    qkv: &PackedQkv,
    config: &RingConfig,
) -> ForgeResult<RingOutput> {
    let (q, k, v) = qkv.unpack()?;
    ring_attention(ctx, &q, &k, &v, config)
}

/// Ring attention with separate q and a packed `(batch, local_seq, 2, heads, head_dim)` kv shard
pub fn ring_attention_kvpacked(
    ctx: &ClusterContext,
    q: &Tensor,
    kv: &PackedKv,
    config: &RingConfig,
) -> ForgeResult<RingOutput> {
    let (k, v) = kv.unpack()?;
    ring_attention(ctx, q, &k, &v, config)
}

/// Ring attention over zigzag shards (blocks r and 2P-1-r of 2P)
pub fn zigzag_ring_attention(
    ctx: &ClusterContext,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    config: &RingConfig,
) -> ForgeResult<RingOutput> {
    let config = config.clone().with_layout(ShardLayout::Zigzag);
    ring_attention(ctx, q, k, v, &config)
}

pub fn zigzag_ring_attention_qkvpacked(
    ctx: &ClusterContext,
    qkv: &PackedQkv,
    config: &RingConfig,
) -> ForgeResult<RingOutput> {
    let (q, k, v) = qkv.unpack()?;
    zigzag_ring_attention(ctx, &q, &k, &v, config)
}

/// Gradients of ring attention for the local shard.
///
/// `output` must come from the forward call with the same inputs and
/// configuration; gradients are returned for inputs flagged `requires_grad`.
pub fn ring_attention_backward(
    ctx: &ClusterContext,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    output: &RingOutput,
    dout: &Tensor,
    config: &RingConfig,
) -> ForgeResult<AttentionGrads> {
    config.attention.validate()?;
    if ctx.is_single() {
        return flash_attention_backward(q, k, v, &output.out, &output.lse, dout, &config.attention);
    }

    let plan = RingPlan::new(ctx, q, k, v, config)?;
    let comm = ctx.comm()?;
    let _timer = ScopedTimer::new("ring_attention_backward");
    tracing::debug!(
        rank = plan.rank,
        world_size = plan.world_size,
        epoch = plan.epoch,
        "ring backward"
    );
    let (grads, stats) = backward::ring_backward(
        comm.as_ref(),
        &plan,
        q,
        k,
        v,
        &output.out,
        &output.lse,
        dout,
        &config.attention,
    )?;
    tracing::debug!(
        rank = plan.rank,
        computed = stats.computed,
        skipped = stats.skipped,
        "ring backward done"
    );
    Ok(AttentionGrads::select(grads, q, k, v))
}
