//! Attention backend registry with pluggable implementations
//!
//! Two backends are registered: the blockwise `flash` kernel and the naive
//! `reference` computation. Callers either pin a default by name or take the
//! first backend that supports the call.

use super::config::{AttentionConfig, AttentionShape};
use super::{flash, reference, AttentionOutput};
use crate::config_error;
use crate::error::ForgeResult;
use crate::tensor::Tensor;

/// Trait for attention backend implementations
pub trait BackendImplementation: Send + Sync {
    /// Get the name of this backend (e.g., "flash", "reference")
    fn name(&self) -> &str;

    /// Check if this backend supports the given call
    fn supports(&self, config: &AttentionConfig, shape: &AttentionShape) -> bool;

    /// Execute attention; q is `(b, h, sq, d)`, k and v are `(b, h, sk, d)`
    fn forward(
        &self,
        config: &AttentionConfig,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
    ) -> ForgeResult<AttentionOutput>;
}

/// Attention backend registry
pub struct AttentionBackendRegistry {
    backends: Vec<Box<dyn BackendImplementation>>,
    default_backend: Option<String>,
}

impl AttentionBackendRegistry {
    pub fn new() -> Self {
        let backends: Vec<Box<dyn BackendImplementation>> = vec![
            Box::new(FlashBackend),
            Box::new(ReferenceBackend::default()),
        ];

        AttentionBackendRegistry {
            backends,
            default_backend: None,
        }
    }

    pub fn register(&mut self, backend: Box<dyn BackendImplementation>) {
        self.backends.push(backend);
    }

    /// Select the backend for a call
    ///
    /// 1. If a default is set, use it (if it supports the call)
    /// 2. Otherwise the first registered backend that supports it
    pub fn select_backend(
        &self,
        config: &AttentionConfig,
        shape: &AttentionShape,
    ) -> ForgeResult<&dyn BackendImplementation> {
        if let Some(ref default_name) = self.default_backend {
            let backend = self.get_backend(default_name)?;
            if backend.supports(config, shape) {
                return Ok(backend);
            }
            return Err(config_error!(
                "default backend '{}' does not support {:?}",
                default_name,
                shape
            ));
        }

        self.backends
            .iter()
            .find(|b| b.supports(config, shape))
            .map(|b| b.as_ref())
            .ok_or_else(|| config_error!("no attention backend supports {:?}", shape))
    }

    pub fn set_default(&mut self, name: &str) -> ForgeResult<()> {
        self.get_backend(name)?;
        self.default_backend = Some(name.to_string());
        Ok(())
    }

    pub fn list_backends(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    pub fn get_backend(&self, name: &str) -> ForgeResult<&dyn BackendImplementation> {
        self.backends
            .iter()
            .find(|b| b.name() == name)
            .map(|b| b.as_ref())
            .ok_or_else(|| config_error!("attention backend '{}' not found", name))
    }

    /// Run a forward pass on the selected backend
    pub fn forward(
        &self,
        config: &AttentionConfig,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
    ) -> ForgeResult<AttentionOutput> {
        let shape = AttentionShape::from_qkv(q, k, v)?;
        let backend = self.select_backend(config, &shape)?;
        tracing::trace!(backend = backend.name(), ?shape, "attention forward");
        backend.forward(config, q, k, v)
    }
}

impl Default for AttentionBackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Blockwise online-softmax kernel
pub struct FlashBackend;

impl BackendImplementation for FlashBackend {
    fn name(&self) -> &str {
        "flash"
    }

    fn supports(&self, config: &AttentionConfig, _shape: &AttentionShape) -> bool {
        config.validate().is_ok()
    }

    fn forward(
        &self,
        config: &AttentionConfig,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
    ) -> ForgeResult<AttentionOutput> {
        flash::flash_attention_forward(q, k, v, config)
    }
}

/// Explicit softmax; materializes one `q_len x kv_len` score matrix
pub struct ReferenceBackend {
    max_scores: usize,
}

impl ReferenceBackend {
    /// Largest score matrix the reference path will build
    pub const DEFAULT_MAX_SCORES: usize = 1 << 24;

    pub fn with_max_scores(max_scores: usize) -> Self {
        Self { max_scores }
    }
}

impl Default for ReferenceBackend {
    fn default() -> Self {
        Self::with_max_scores(Self::DEFAULT_MAX_SCORES)
    }
}

impl BackendImplementation for ReferenceBackend {
    fn name(&self) -> &str {
        "reference"
    }

    fn supports(&self, config: &AttentionConfig, shape: &AttentionShape) -> bool {
        config.validate().is_ok() && shape.q_len.saturating_mul(shape.kv_len) <= self.max_scores
    }

    fn forward(
        &self,
        config: &AttentionConfig,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
    ) -> ForgeResult<AttentionOutput> {
        reference::reference_attention(q, k, v, config)
    }
}
