//! Scaled dot-product attention
//!
//! Single-device kernels over `(batch, heads, seq, head_dim)` tensors:
//! a blockwise flash kernel (forward + backward) and a naive reference,
//! both returning the output together with the per-row log-sum-exp.

pub mod backend_registry;
pub mod compare;
pub mod config;
pub mod flash;
pub mod mask;
pub mod reference;
pub mod softmax;


pub use backend_registry::{AttentionBackendRegistry, BackendImplementation};
pub use compare::{compare, Comparison, Tolerance, TolerancePolicy};
pub use config::{AttentionConfig, AttentionShape};
pub use flash::{
    flash_attention_backward, flash_attention_backward_at, flash_attention_forward,
    flash_attention_forward_at, BlockGrads,
};
pub use mask::MaskFill;
pub use reference::reference_attention;

use crate::error::{ForgeResult, RingForgeError};
use crate::tensor::Tensor;

/// Attention output `(batch, heads, q_len, head_dim)` and LSE `(batch, heads, q_len)`
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    pub out: Tensor,
    pub lse: Tensor,
}

/// Gradients of the inputs that asked for one
#[derive(Debug, Clone, Default)]
pub struct AttentionGrads {
    pub dq: Option<Tensor>,
    pub dk: Option<Tensor>,
    pub dv: Option<Tensor>,
}

impl AttentionGrads {
    /// Keep the gradients whose input has `requires_grad` set
    pub fn select(grads: BlockGrads, q: &Tensor, k: &Tensor, v: &Tensor) -> Self {
        Self {
            dq: q.requires_grad().then_some(grads.dq),
            dk: k.requires_grad().then_some(grads.dk),
            dv: v.requires_grad().then_some(grads.dv),
        }
    }

    /// Every input that requires a gradient has one of its own shape with
    /// finite entries
    pub fn verify(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> ForgeResult<()> {
        for (name, input, grad) in [
            ("q", q, &self.dq),
            ("k", k, &self.dk),
            ("v", v, &self.dv),
        ] {
            if !input.requires_grad() {
                continue;
            }
            let grad = grad
                .as_ref()
                .ok_or_else(|| RingForgeError::MissingGradient(name.to_string()))?;
            if grad.dims() != input.dims() {
                return Err(RingForgeError::ShapeMismatch(format!(
                    "grad of {} is {}, input is {}",
                    name,
                    grad.shape(),
                    input.shape()
                )));
            }
            grad.ensure_finite(&format!("grad of {}", name))?;
        }
        Ok(())
    }
}
