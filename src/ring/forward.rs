//! Ring forward pass
//!
//! At step s rank r holds the key/value shard of rank (r - s) mod P. It
//! forwards that shard to r + 1 before computing on it, folds the partial
//! result into its running (out, lse) with the LSE merge, then takes the next
//! shard from r - 1. P - 1 exchange rounds in total. Under a causal mask a
//! shard whose keys all lie after every local query is skipped.

use super::{RingPlan, RingStats, FORWARD_TAG_BASE, SLOT_K, SLOT_V};
use crate::attention::mask::block_fully_masked;
use crate::attention::softmax::merge_partial;
use crate::attention::{flash_attention_forward_at, AttentionConfig, AttentionOutput, AttentionShape};
use crate::distributed::comm::Communicator;
use crate::distributed::comm_utils::{recv_tensor, send_tensor};
use crate::error::ForgeResult;
use crate::tensor::Tensor;

pub(crate) fn ring_forward(
    comm: &dyn Communicator,
    plan: &RingPlan,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    config: &AttentionConfig,
) -> ForgeResult<(AttentionOutput, RingStats)> {
    let shape = AttentionShape::from_qkv(q, k, v)?;
    let kv_dims = shape.kv_dims();
    let q_positions = plan.positions(plan.rank)?;

    let mut out = Tensor::zeros(&shape.q_dims());
    let mut lse = Tensor::full(&shape.lse_dims(), f32::NEG_INFINITY);
    let mut k_cur = k.clone();
    let mut v_cur = v.clone();
    let mut stats = RingStats::default();

    for step in 0..plan.world_size {
        plan.ensure_live("ring forward", step)?;
        let src = plan.source(step);
        let last = step + 1 == plan.world_size;

        if !last {
            send_tensor(comm, &k_cur, plan.next(), plan.tag(FORWARD_TAG_BASE, step, SLOT_K)?)?;
            send_tensor(comm, &v_cur, plan.next(), plan.tag(FORWARD_TAG_BASE, step, SLOT_V)?)?;
        }

        let k_positions = plan.positions(src)?;
        if config.causal && block_fully_masked(&q_positions, &k_positions) {
            stats.skipped += 1;
            tracing::trace!(rank = plan.rank, step, src, "ring forward step masked");
        } else {
            stats.computed += 1;
            let part = flash_attention_forward_at(q, &k_cur, &v_cur, &q_positions, &k_positions, config)?;
            merge_partial(
                out.data_mut(),
                lse.data_mut(),
                part.out.data(),
                part.lse.data(),
                shape.head_dim,
            );
            tracing::trace!(rank = plan.rank, step, src, "ring forward step merged");
        }

        if !last {
            k_cur = recv_tensor(
                comm,
                plan.prev(),
                plan.tag(FORWARD_TAG_BASE, step, SLOT_K)?,
                &kv_dims,
                plan.timeout,
                Some(&plan.cancel),
            )?;
            v_cur = recv_tensor(
                comm,
                plan.prev(),
                plan.tag(FORWARD_TAG_BASE, step, SLOT_V)?,
                &kv_dims,
                plan.timeout,
                Some(&plan.cancel),
            )?;
        }
    }

    Ok((AttentionOutput { out, lse }, stats))
}
