//! In-process launcher
//!
//! Runs `world_size` participants as named threads over one [`LocalFabric`].
//! Each thread gets a torchrun-style environment and goes through the same
//! [`ClusterContext::init`] path an externally launched process would.

use super::context::{Backend, ClusterContext};
use super::env::EnvSnapshot;
use super::fabric::LocalFabric;
use crate::device::{self, Capability};
use crate::error::{ForgeResult, RingForgeError};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

/// Spawns and joins one thread per rank
#[derive(Debug, Clone)]
pub struct LocalLauncher {
    world_size: usize,
    capability: Capability,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl LocalLauncher {
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size,
            capability: device::probe().clone(),
        }
    }

    /// Use `capability` instead of the process probe
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Run `f` on every rank and collect the per-rank results in rank order.
    ///
    /// The outer error covers the launcher itself (fabric creation, thread
    /// spawn). Setup failures, errors returned by `f` and panics are reported
    /// per rank.
    pub fn run<T, F>(&self, f: F) -> ForgeResult<Vec<ForgeResult<T>>>
    where
        T: Send + 'static,
        F: Fn(&Arc<ClusterContext>) -> ForgeResult<T> + Send + Sync + 'static,
    {
        let endpoints = LocalFabric::create(self.world_size)?;
        let f = Arc::new(f);
        let mut handles = Vec::with_capacity(self.world_size);

        for (rank, endpoint) in endpoints.into_iter().enumerate() {
            let f = Arc::clone(&f);
            let env = EnvSnapshot::torchrun(rank, self.world_size, rank);
            let capability = self.capability.clone();

            let handle = thread::Builder::new()
                .name(format!("rank-{}", rank))
                .spawn(move || -> ForgeResult<T> {
                    let ctx = Arc::new(ClusterContext::init(
                        &env,
                        Some(endpoint),
                        &capability,
                        Backend::Local,
                    )?);

                    let result = panic::catch_unwind(AssertUnwindSafe(|| f(&ctx)));
                    ctx.teardown();

                    match result {
                        Ok(r) => r,
                        Err(payload) => Err(RingForgeError::InternalError(format!(
                            "rank {} panicked: {}",
                            rank,
                            panic_message(payload.as_ref())
                        ))),
                    }
                })
                .map_err(|e| {
                    RingForgeError::InternalError(format!("failed to spawn rank {}: {}", rank, e))
                })?;
            handles.push(handle);
        }

        Ok(handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle.join().unwrap_or_else(|payload| {
                    Err(RingForgeError::InternalError(format!(
                        "rank {} thread died: {}",
                        rank,
                        panic_message(payload.as_ref())
                    )))
                })
            })
            .collect())
    }
}
