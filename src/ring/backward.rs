//! Ring backward pass
//!
//! Key/value shards circulate exactly as in the forward pass, with their
//! dk/dv accumulators travelling alongside. Each rank adds the contribution
//! of its own queries (using the globally merged out and lse) to whatever
//! shard it holds and accumulates dq locally. After the last step the
//! accumulators take one more hop, which lands them on the owning rank.

use super::{RingPlan, RingStats, BACKWARD_TAG_BASE, SLOT_DK, SLOT_DV, SLOT_K, SLOT_V};
use crate::attention::flash::BlockGrads;
use crate::attention::mask::block_fully_masked;
use crate::attention::{flash_attention_backward_at, AttentionConfig, AttentionShape};
use crate::distributed::comm::{Communicator, Tag};
use crate::distributed::comm_utils::{recv_tensor, send_tensor};
use crate::error::ForgeResult;
use crate::tensor::Tensor;

#[allow(clippy::too_many_arguments)]
pub(crate) fn ring_backward(
    comm: &dyn Communicator,
    plan: &RingPlan,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    out: &Tensor,
    lse: &Tensor,
    dout: &Tensor,
    config: &AttentionConfig,
) -> ForgeResult<(BlockGrads, RingStats)> {
    let shape = AttentionShape::from_qkv(q, k, v)?;
    let kv_dims = shape.kv_dims();
    let q_positions = plan.positions(plan.rank)?;
    let recv = |step: usize, slot: Tag| -> ForgeResult<Tensor> {
        recv_tensor(
            comm,
            plan.prev(),
            plan.tag(BACKWARD_TAG_BASE, step, slot)?,
            &kv_dims,
            plan.timeout,
            Some(&plan.cancel),
        )
    };

    let mut dq = Tensor::zeros(&shape.q_dims());
    let mut k_cur = k.clone();
    let mut v_cur = v.clone();
    let mut dk_acc = Tensor::zeros(&kv_dims);
    let mut dv_acc = Tensor::zeros(&kv_dims);
    let mut stats = RingStats::default();

    for step in 0..plan.world_size {
        plan.ensure_live("ring backward", step)?;
        let src = plan.source(step);
        let last = step + 1 == plan.world_size;

        if !last {
            send_tensor(comm, &k_cur, plan.next(), plan.tag(BACKWARD_TAG_BASE, step, SLOT_K)?)?;
            send_tensor(comm, &v_cur, plan.next(), plan.tag(BACKWARD_TAG_BASE, step, SLOT_V)?)?;
        }

        let k_positions = plan.positions(src)?;
        if config.causal && block_fully_masked(&q_positions, &k_positions) {
            stats.skipped += 1;
            tracing::trace!(rank = plan.rank, step, src, "ring backward step masked");
        } else {
            stats.computed += 1;
            let grads = flash_attention_backward_at(
                q,
                &k_cur,
                &v_cur,
                out,
                lse,
                dout,
                &q_positions,
                &k_positions,
                config,
            )?;
            dq.add_assign(&grads.dq)?;
            dk_acc.add_assign(&grads.dk)?;
            dv_acc.add_assign(&grads.dv)?;
        }

        // accumulators always move, including after the last compute step
        send_tensor(comm, &dk_acc, plan.next(), plan.tag(BACKWARD_TAG_BASE, step, SLOT_DK)?)?;
        send_tensor(comm, &dv_acc, plan.next(), plan.tag(BACKWARD_TAG_BASE, step, SLOT_DV)?)?;

        if !last {
            k_cur = recv(step, SLOT_K)?;
            v_cur = recv(step, SLOT_V)?;
        }
        dk_acc = recv(step, SLOT_DK)?;
        dv_acc = recv(step, SLOT_DV)?;
    }

    Ok((
        BlockGrads {
            dq,
            dk: dk_acc,
            dv: dv_acc,
        },
        stats,
    ))
}
