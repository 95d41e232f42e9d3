//! The named checks of the verification suite
//!
//! Each check returns a JSON blob of details on success and an error on
//! failure; the runner turns either into a `TestOutcome`. Distributed checks
//! take the participant's `ClusterContext` and run on every rank.

use super::config::{HarnessConfig, ShapeConfig};
use crate::attention::{
    compare, flash_attention_backward, flash_attention_forward, AttentionBackendRegistry,
    AttentionConfig, AttentionGrads, Comparison, MaskFill, Tolerance, TolerancePolicy,
};
use crate::config_error;
use crate::device::{bytes_to_mib, max_memory_allocated, reset_peak_memory_stats, MemoryCalculator};
use crate::distributed::context::ClusterContext;
use crate::error::{ForgeResult, RingForgeError};
use crate::profiling::{attention_flops, tflops, KernelTimer};
use crate::ring::{
    ring_attention, ring_attention_backward, ring_attention_kvpacked, ring_attention_qkvpacked,
    zigzag_ring_attention, zigzag_ring_attention_qkvpacked, RingConfig, RingOutput, ShardLayout,
};
use crate::tensor::packed::{PackedKv, PackedQkv};
use crate::tensor::Tensor;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const BASIC_FLASH_ATTENTION: &str = "Basic Flash Attention";
pub const FLASH_VS_REFERENCE: &str = "Flash vs Reference";
pub const MEMORY_AND_PERFORMANCE: &str = "Memory and Performance";
pub const DISTRIBUTED_RING_ATTENTION: &str = "Distributed Ring Attention";
pub const RING_ATTENTION_VARIANTS: &str = "Ring Attention Variants";

// every rank enters these before its distributed checks
const RING_CHECK_PHASE: u32 = 1;
const VARIANTS_PHASE: u32 = 2;

/// Reported with every distributed timeout or disconnect
pub const DEADLOCK_CAUSES: [&str; 3] = [
    "peer-to-peer exchange deadlock (a rank never posted its send or receive)",
    "communication backend misconfiguration",
    "device memory exhaustion on a participant",
];

fn qkv_with_grad(shape: &ShapeConfig, seed: u64) -> (Tensor, Tensor, Tensor) {
    let dims = shape.bhsd();
    (
        Tensor::randn(&dims, seed).with_requires_grad(true),
        Tensor::randn(&dims, seed + 1).with_requires_grad(true),
        Tensor::randn(&dims, seed + 2).with_requires_grad(true),
    )
}

fn check_dims(what: &str, got: &[usize], expected: &[usize]) -> ForgeResult<()> {
    if got != expected {
        return Err(RingForgeError::ShapeMismatch(format!(
            "{} has shape {:?}, expected {:?}",
            what, got, expected
        )));
    }
    Ok(())
}

/// Causal forward and backward on each configured shape
pub fn basic_flash_attention(config: &HarnessConfig) -> ForgeResult<Value> {
    let attn = AttentionConfig::causal();
    let mut results = Vec::with_capacity(config.basic_configs.len());

    for (i, shape) in config.basic_configs.iter().enumerate() {
        let (q, k, v) = qkv_with_grad(shape, config.seed + 10 * i as u64);

        let fwd = flash_attention_forward(&q, &k, &v, &attn)?;
        check_dims("output", fwd.out.dims(), &shape.bhsd())?;
        check_dims("lse", fwd.lse.dims(), &[shape.batch, shape.heads, shape.seq_len])?;
        fwd.out.ensure_finite("output")?;
        fwd.lse.ensure_finite("lse")?;

        let dout = Tensor::randn(&shape.bhsd(), config.seed + 10 * i as u64 + 3);
        let grads = flash_attention_backward(&q, &k, &v, &fwd.out, &fwd.lse, &dout, &attn)?;
        grads.verify(&q, &k, &v)?;

        tracing::info!(config = i + 1, ?shape, "forward and backward ok");
        results.push(json!({
            "shape": shape,
            "out": fwd.out.dims(),
            "lse": fwd.lse.dims(),
        }));
    }

    Ok(Value::Array(results))
}

/// Flash kernel against the naive computation with a large negative mask
pub fn flash_vs_reference(config: &HarnessConfig) -> ForgeResult<Value> {
    let shape = &config.reference_shape;
    let dims = shape.bhsd();
    let q = Tensor::randn(&dims, config.seed + 100);
    let k = Tensor::randn(&dims, config.seed + 101);
    let v = Tensor::randn(&dims, config.seed + 102);
    let attn = AttentionConfig::causal().with_mask_fill(MaskFill::LargeNegative);

    let registry = AttentionBackendRegistry::new();
    let flash = registry.get_backend("flash")?.forward(&attn, &q, &k, &v)?;
    let reference = registry.get_backend("reference")?.forward(&attn, &q, &k, &v)?;

    let cmp = compare(&flash.out, &reference.out, config.reference_tolerance)?;
    tracing::info!(
        max_abs_diff = cmp.max_abs_diff,
        mean_abs_diff = cmp.mean_abs_diff,
        tolerance = %cmp.tolerance,
        "flash vs reference"
    );
    cmp.enforce("flash vs reference output", config.reference_policy)?;

    Ok(json!({
        "comparison": cmp,
        "policy": config.reference_policy,
    }))
}

/// One point of the timing sweep
#[derive(Debug, Clone, Serialize)]
pub struct PerfSample {
    pub seq_len: usize,
    pub avg_ms: f64,
    pub tflops: f64,
    pub peak_mib: f64,
    pub estimated_mib: f64,
}

/// Forward timing and peak memory over increasing sequence lengths
pub fn memory_and_performance(config: &HarnessConfig) -> ForgeResult<Value> {
    let attn = AttentionConfig::causal();
    let iters = u32::try_from(config.perf_iters)
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| config_error!("perf_iters must be between 1 and {}, got {}", u32::MAX, config.perf_iters))?;
    let mut samples = Vec::with_capacity(config.perf_seq_lens.len());

    for &seq_len in &config.perf_seq_lens {
        let shape = config.perf_shape.with_seq_len(seq_len);
        reset_peak_memory_stats();

        let dims = shape.bhsd();
        let q = Tensor::randn(&dims, config.seed + 200);
        let k = Tensor::randn(&dims, config.seed + 201);
        let v = Tensor::randn(&dims, config.seed + 202);

        for _ in 0..config.perf_warmup {
            flash_attention_forward(&q, &k, &v, &attn)?;
        }

        let mut timer = KernelTimer::for_kernel(format!("flash_fwd_s{}", seq_len));
        timer.start();
        for _ in 0..iters {
            flash_attention_forward(&q, &k, &v, &attn)?;
        }
        timer.stop();

        let total = timer
            .elapsed_duration()
            .ok_or_else(|| RingForgeError::InternalError("timer did not record".to_string()))?;
        let avg = total / iters;
        let estimate = MemoryCalculator::for_attention(shape.batch, shape.heads, seq_len, shape.head_dim);

        let sample = PerfSample {
            seq_len,
            avg_ms: avg.as_secs_f64() * 1e3,
            tflops: tflops(
                attention_flops(shape.batch, shape.heads, seq_len, shape.head_dim),
                avg,
            ),
            peak_mib: bytes_to_mib(max_memory_allocated()),
            estimated_mib: bytes_to_mib(estimate.total_bytes()),
        };
        tracing::info!(
            seq_len,
            avg_ms = sample.avg_ms,
            tflops = sample.tflops,
            peak_mib = sample.peak_mib,
            "forward timing"
        );
        samples.push(sample);
    }

    Ok(serde_json::to_value(samples)?)
}

fn log_distributed_failure(rank: usize, err: &RingForgeError) {
    tracing::error!(rank, error = %err, "ring communication did not complete");
    if err.is_timeout() {
        tracing::error!(rank, "this indicates a deadlock in ring communication");
    }
    for cause in DEADLOCK_CAUSES {
        tracing::error!(rank, "possible cause: {}", cause);
    }
}

fn compare_slice(
    name: &str,
    ring: &Tensor,
    full: &Tensor,
    layout: ShardLayout,
    world_size: usize,
    rank: usize,
    tolerance: Tolerance,
) -> ForgeResult<Comparison> {
    let expected = layout.shard(full, 2, world_size, rank)?;
    let cmp = compare(ring, &expected, tolerance)?;
    cmp.enforce(&format!("rank {} ring {}", rank, name), TolerancePolicy::Fail)?;
    Ok(cmp)
}

fn grad<'a>(grads: &'a AttentionGrads, name: &str) -> ForgeResult<&'a Tensor> {
    let g = match name {
        "dq" => &grads.dq,
        "dk" => &grads.dk,
        _ => &grads.dv,
    };
    g.as_ref()
        .ok_or_else(|| RingForgeError::MissingGradient(name.to_string()))
}

/// Ring forward and backward against single-device attention on the same data.
///
/// Rank 0 draws the packed qkv and the upstream gradient and broadcasts them;
/// every rank then checks its own rows of out, lse, dq, dk and dv.
pub fn distributed_ring_attention(ctx: &Arc<ClusterContext>, config: &HarnessConfig) -> ForgeResult<Value> {
    let rank = ctx.rank();
    let world_size = ctx.world_size();
    let layout = ShardLayout::Contiguous;
    ctx.enter_phase(RING_CHECK_PHASE)?;

    let seq_len = layout.truncate(config.ring_shape.seq_len, world_size);
    if seq_len == 0 {
        return Err(config_error!(
            "ring seq_len {} is shorter than world size {}",
            config.ring_shape.seq_len,
            world_size
        ));
    }
    if seq_len != config.ring_shape.seq_len {
        tracing::warn!(rank, from = config.ring_shape.seq_len, to = seq_len, "truncated ring seq_len");
    }
    let shape = config.ring_shape.with_seq_len(seq_len);
    let bcast_timeout = config.broadcast_timeout()?;

    let packed_dims = [shape.batch, seq_len, 3, shape.heads, shape.head_dim];
    let mut qkv = if rank == 0 {
        PackedQkv::randn(shape.batch, seq_len, shape.heads, shape.head_dim, config.seed).into_tensor()
    } else {
        Tensor::zeros(&packed_dims)
    };
    ctx.broadcast_tensor(&mut qkv, 0, bcast_timeout)?;

    let mut dout_full = if rank == 0 {
        Tensor::randn(&shape.bhsd(), config.seed + 1)
    } else {
        Tensor::zeros(&shape.bhsd())
    };
    ctx.broadcast_tensor(&mut dout_full, 0, bcast_timeout)?;

    let qkv = PackedQkv::new(qkv)?;
    let local = qkv
        .chunk_seq(world_size)?
        .into_iter()
        .nth(rank)
        .ok_or_else(|| RingForgeError::InvalidRank { rank, world_size })?;
    let (q, k, v) = local.unpack()?;
    let (q, k, v) = (
        q.with_requires_grad(true),
        k.with_requires_grad(true),
        v.with_requires_grad(true),
    );
    let dout = layout.shard(&dout_full, 2, world_size, rank)?;
    let ring_config = RingConfig::default()
        .with_layout(layout)
        .with_exchange_timeout(config.exchange_timeout()?);

    tracing::info!(rank, world_size, seq_len, "starting ring attention forward");
    let job_ctx = Arc::clone(ctx);
    let (jq, jk, jv, jdout, jcfg) = (q.clone(), k.clone(), v.clone(), dout.clone(), ring_config.clone());
    let outcome = ctx.run_bounded(
        &format!("ring attention on rank {}", rank),
        config.ring_timeout()?,
        move || -> ForgeResult<(RingOutput, AttentionGrads, Duration)> {
            let start = Instant::now();
            let out = ring_attention(&job_ctx, &jq, &jk, &jv, &jcfg)?;
            let grads = ring_attention_backward(&job_ctx, &jq, &jk, &jv, &out, &jdout, &jcfg)?;
            Ok((out, grads, start.elapsed()))
        },
    )?;

    let (ring_out, ring_grads, elapsed) = match outcome.into_result(rank).and_then(|r| r) {
        Ok(done) => done,
        Err(err) => {
            if err.is_distributed() {
                log_distributed_failure(rank, &err);
            }
            return Err(err);
        }
    };
    tracing::info!(rank, elapsed_ms = elapsed.as_millis() as u64, "ring forward and backward done");

    ring_out.out.ensure_finite("ring output")?;
    check_dims("ring lse", ring_out.lse.dims(), &[shape.batch, shape.heads, seq_len / world_size])?;
    ring_grads.verify(&q, &k, &v)?;

    // single-device result on the full sequence, sliced to this rank
    let (fq, fk, fv) = qkv.unpack()?;
    let (fq, fk, fv) = (
        fq.with_requires_grad(true),
        fk.with_requires_grad(true),
        fv.with_requires_grad(true),
    );
    let full = flash_attention_forward(&fq, &fk, &fv, &ring_config.attention)?;
    let full_grads =
        flash_attention_backward(&fq, &fk, &fv, &full.out, &full.lse, &dout_full, &ring_config.attention)?;

    let tol = config.ring_tolerance;
    let mut comparisons = serde_json::Map::new();
    comparisons.insert(
        "out".to_string(),
        serde_json::to_value(compare_slice("out", &ring_out.out, &full.out, layout, world_size, rank, tol)?)?,
    );
    comparisons.insert(
        "lse".to_string(),
        serde_json::to_value(compare_slice("lse", &ring_out.lse, &full.lse, layout, world_size, rank, tol)?)?,
    );
    for name in ["dq", "dk", "dv"] {
        let cmp = compare_slice(
            name,
            grad(&ring_grads, name)?,
            grad(&full_grads, name)?,
            layout,
            world_size,
            rank,
            tol,
        )?;
        comparisons.insert(name.to_string(), serde_json::to_value(cmp)?);
    }

    tracing::info!(rank, "waiting at barrier");
    let barrier = match ctx.barrier(config.barrier_timeout()?) {
        Ok(()) => {
            tracing::info!(rank, "passed barrier");
            "passed".to_string()
        }
        Err(err) => {
            tracing::warn!(rank, error = %err, "barrier failed");
            format!("failed: {}", err)
        }
    };

    Ok(json!({
        "rank": rank,
        "world_size": world_size,
        "seq_len": seq_len,
        "elapsed_ms": elapsed.as_secs_f64() * 1e3,
        "comparisons": comparisons,
        "barrier": barrier,
    }))
}

/// Public ring entry points exercised by the variant sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingVariant {
    Ring,
    RingQkvPacked,
    RingKvPacked,
    Zigzag,
    ZigzagQkvPacked,
}

impl RingVariant {
    pub const ALL: [RingVariant; 5] = [
        RingVariant::Ring,
        RingVariant::RingQkvPacked,
        RingVariant::RingKvPacked,
        RingVariant::Zigzag,
        RingVariant::ZigzagQkvPacked,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RingVariant::Ring => "ring_attention",
            RingVariant::RingQkvPacked => "ring_attention_qkvpacked",
            RingVariant::RingKvPacked => "ring_attention_kvpacked",
            RingVariant::Zigzag => "zigzag_ring_attention",
            RingVariant::ZigzagQkvPacked => "zigzag_ring_attention_qkvpacked",
        }
    }

    fn layout(&self) -> ShardLayout {
        match self {
            RingVariant::Zigzag | RingVariant::ZigzagQkvPacked => ShardLayout::Zigzag,
            _ => ShardLayout::Contiguous,
        }
    }

    /// Forward through this entry point, then backward of `out.sum()`
    pub fn run(&self, ctx: &ClusterContext, shape: &ShapeConfig, seed: u64, config: &RingConfig) -> ForgeResult<()> {
        let config = config.clone().with_layout(self.layout());
        let (b, s, h, d) = (shape.batch, shape.seq_len, shape.heads, shape.head_dim);

        let (q, k, v, out) = match self {
            RingVariant::RingQkvPacked | RingVariant::ZigzagQkvPacked => {
                let packed = PackedQkv::randn(b, s, h, d, seed);
                let out = if *self == RingVariant::RingQkvPacked {
                    ring_attention_qkvpacked(ctx, &packed, &config)?
                } else {
                    zigzag_ring_attention_qkvpacked(ctx, &packed, &config)?
                };
                let (q, k, v) = packed.unpack()?;
                (q, k, v, out)
            }
            RingVariant::RingKvPacked => {
                let q = Tensor::randn(&[b, h, s, d], seed);
                let kv = PackedKv::pack(&Tensor::randn(&[b, h, s, d], seed + 1), &Tensor::randn(&[b, h, s, d], seed + 2))?;
                let out = ring_attention_kvpacked(ctx, &q, &kv, &config)?;
                let (k, v) = kv.unpack()?;
                (q, k, v, out)
            }
            RingVariant::Ring | RingVariant::Zigzag => {
                let q = Tensor::randn(&[b, h, s, d], seed);
                let k = Tensor::randn(&[b, h, s, d], seed + 1);
                let v = Tensor::randn(&[b, h, s, d], seed + 2);
                let out = if *self == RingVariant::Ring {
                    ring_attention(ctx, &q, &k, &v, &config)?
                } else {
                    zigzag_ring_attention(ctx, &q, &k, &v, &config)?
                };
                (q, k, v, out)
            }
        };
        out.out.ensure_finite(self.name())?;

        let (q, k, v) = (
            q.with_requires_grad(true),
            k.with_requires_grad(true),
            v.with_requires_grad(true),
        );
        let dout = Tensor::full(out.out.dims(), 1.0);
        let grads = ring_attention_backward(ctx, &q, &k, &v, &out, &dout, &config)?;
        grads.verify(&q, &k, &v)
    }
}

/// Every ring entry point on rank-local random data.
///
/// All variants run even after a failure; the check fails if any did.
pub fn ring_attention_variants(ctx: &Arc<ClusterContext>, config: &HarnessConfig) -> ForgeResult<Value> {
    let rank = ctx.rank();
    let world_size = ctx.world_size();
    ctx.enter_phase(VARIANTS_PHASE)?;

    // zigzag needs two blocks per rank
    let seq_len = ShardLayout::Zigzag.truncate(config.variants_shape.seq_len, world_size);
    if seq_len == 0 {
        return Err(config_error!(
            "variants seq_len {} is shorter than 2 x world size {}",
            config.variants_shape.seq_len,
            world_size
        ));
    }
    let local = config.variants_shape.with_seq_len(seq_len / world_size);
    let ring_config = RingConfig::default().with_exchange_timeout(config.exchange_timeout()?);

    let mut results = serde_json::Map::new();
    let mut first_error = None;
    for (i, variant) in RingVariant::ALL.iter().enumerate() {
        let seed = config.seed + rank as u64 + 1000 * i as u64;
        match variant.run(ctx, &local, seed, &ring_config) {
            Ok(()) => {
                tracing::info!(rank, variant = variant.name(), "variant passed");
                results.insert(variant.name().to_string(), json!("passed"));
            }
            Err(err) => {
                tracing::error!(rank, variant = variant.name(), error = %err, "variant failed");
                results.insert(variant.name().to_string(), json!(format!("failed: {}", err)));
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(Value::Object(results)),
    }
}
