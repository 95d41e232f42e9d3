//! Attention configuration and input shape validation

use super::mask::MaskFill;
use crate::config_error;
use crate::error::{ForgeResult, RingForgeError};
use crate::shape_error;
use crate::tensor::Tensor;

/// Default number of keys processed per online-softmax block
pub const DEFAULT_BLOCK_SIZE: usize = 64;

/// Configuration for attention operations
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionConfig {
    /// Whether to use causal masking
    pub causal: bool,
    /// Score scale; `None` means 1/sqrt(head_dim)
    pub softmax_scale: Option<f32>,
    /// Keys per block in the flash kernel
    pub block_size: usize,
    /// Value written into masked scores by the reference path
    pub mask_fill: MaskFill,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            causal: false,
            softmax_scale: None,
            block_size: DEFAULT_BLOCK_SIZE,
            mask_fill: MaskFill::NegInfinity,
        }
    }
}

impl AttentionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn causal() -> Self {
        Self::default().with_causal(true)
    }

    pub fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    pub fn with_softmax_scale(mut self, scale: f32) -> Self {
        self.softmax_scale = Some(scale);
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_mask_fill(mut self, fill: MaskFill) -> Self {
        self.mask_fill = fill;
        self
    }

    /// Effective scale for the given head dimension
    pub fn scale(&self, head_dim: usize) -> f32 {
        self.softmax_scale
            .unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt())
    }

    pub fn validate(&self) -> ForgeResult<()> {
        if self.block_size == 0 {
            return Err(config_error!("block_size must be positive"));
        }
        if let Some(scale) = self.softmax_scale {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(config_error!("softmax_scale must be finite and positive, got {}", scale));
            }
        }
        Ok(())
    }
}

/// Dimensions of one attention call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionShape {
    pub batch: usize,
    pub heads: usize,
    pub q_len: usize,
    pub kv_len: usize,
    pub head_dim: usize,
}

impl AttentionShape {
    /// Validate q `(b, h, sq, d)` against k and v `(b, h, sk, d)`
    pub fn from_qkv(q: &Tensor, k: &Tensor, v: &Tensor) -> ForgeResult<Self> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (kb, kh, kv_len, kd) = k.dims4()?;

        if (kb, kh, kd) != (batch, heads, head_dim) {
            return Err(shape_error!(
                "q {} and k {} disagree on batch/heads/head_dim",
                q.shape(),
                k.shape()
            ));
        }
        if v.dims() != k.dims() {
            return Err(shape_error!("k {} and v {} differ", k.shape(), v.shape()));
        }
        if head_dim == 0 {
            return Err(RingForgeError::InvalidTensorShape(
                "head_dim must be positive".to_string(),
            ));
        }

        Ok(Self {
            batch,
            heads,
            q_len,
            kv_len,
            head_dim,
        })
    }

    pub fn q_dims(&self) -> [usize; 4] {
        [self.batch, self.heads, self.q_len, self.head_dim]
    }

    pub fn kv_dims(&self) -> [usize; 4] {
        [self.batch, self.heads, self.kv_len, self.head_dim]
    }

    pub fn lse_dims(&self) -> [usize; 3] {
        [self.batch, self.heads, self.q_len]
    }

    /// Number of (batch, head) slabs
    pub fn slabs(&self) -> usize {
        self.batch * self.heads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scale() {
        let cfg = AttentionConfig::causal();
        assert!(cfg.causal);
        assert!((cfg.scale(64) - 0.125).abs() < 1e-7);
        assert_eq!(cfg.with_softmax_scale(0.5).scale(64), 0.5);
    }

    #[test]
    fn test_validate() {
        assert!(AttentionConfig::new().validate().is_ok());
        assert!(AttentionConfig::new().with_block_size(0).validate().is_err());
        assert!(AttentionConfig::new()
            .with_softmax_scale(f32::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn test_shape_from_qkv() {
        let q = Tensor::zeros(&[2, 4, 16, 8]);
        let k = Tensor::zeros(&[2, 4, 32, 8]);
        let shape = AttentionShape::from_qkv(&q, &k, &k).unwrap();
        assert_eq!(shape.q_len, 16);
        assert_eq!(shape.kv_len, 32);
        assert_eq!(shape.lse_dims(), [2, 4, 16]);
        assert_eq!(shape.slabs(), 8);
    }

    #[test]
    fn test_shape_mismatch() {
        let q = Tensor::zeros(&[2, 4, 16, 8]);
        let k = Tensor::zeros(&[2, 4, 16, 16]);
        let err = AttentionShape::from_qkv(&q, &k, &k).unwrap_err();
        assert!(err.is_user_error());

        let v = Tensor::zeros(&[2, 4, 8, 8]);
        assert!(AttentionShape::from_qkv(&q, &q, &v).is_err());

        let flat = Tensor::zeros(&[16, 8]);
        assert!(AttentionShape::from_qkv(&flat, &q, &q).is_err());
    }
}
