//! Cluster context
//!
//! [`ClusterContext`] is the one value every distributed call receives. It
//! records who this participant is ([`ParticipantDescriptor`]) and owns the
//! communicator handle until [`ClusterContext::teardown`] (or drop) releases
//! it.
//!
//! Each ring call draws an [`Exchange`] from the context. Its epoch is folded
//! into every message tag, so a call abandoned by a watchdog can never match
//! messages meant for a later call. Epochs are `phase << 16 | call`, where the
//! phase is entered explicitly by every rank and the call counter restarts
//! with each phase.

use super::comm::{CancelToken, Communicator};
use super::comm_utils;
use super::env::{EnvSnapshot, LaunchInfo, Launcher, BACKEND_ENV};
use super::fabric::LocalEndpoint;
use super::watchdog::{self, WatchdogOutcome};
use crate::device::{Capability, DeviceId};
use crate::error::{ForgeResult, RingForgeError};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Collective communication backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// In-process fabric between threads
    Local,
    Ccl,
    Mpi,
    Gloo,
}

impl Backend {
    /// `RINGFORGE_BACKEND` if set, otherwise `default`
    pub fn from_env(env: &EnvSnapshot, default: Backend) -> ForgeResult<Backend> {
        match env.get(BACKEND_ENV) {
            Some(raw) => raw.parse(),
            None => Ok(default),
        }
    }

    pub fn is_in_process(&self) -> bool {
        matches!(self, Backend::Local)
    }
}

impl FromStr for Backend {
    type Err = RingForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(Backend::Local),
            "ccl" | "oneccl" => Ok(Backend::Ccl),
            "mpi" => Ok(Backend::Mpi),
            "gloo" => Ok(Backend::Gloo),
            other => Err(RingForgeError::DistributedSetupFailed(format!(
                "unknown backend '{}' (expected local, ccl, mpi or gloo)",
                other
            ))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Local => write!(f, "local"),
            Backend::Ccl => write!(f, "ccl"),
            Backend::Mpi => write!(f, "mpi"),
            Backend::Gloo => write!(f, "gloo"),
        }
    }
}

/// Identity of one participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParticipantDescriptor {
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
    pub device: DeviceId,
    pub backend: Backend,
    pub launcher: Launcher,
}

impl ParticipantDescriptor {
    fn from_launch(info: LaunchInfo, device: DeviceId, backend: Backend) -> Self {
        Self {
            rank: info.rank,
            world_size: info.world_size,
            local_rank: info.local_rank,
            device,
            backend,
            launcher: info.launcher,
        }
    }
}

impl fmt::Display for ParticipantDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rank {}/{} (local {}, {}, {} via {})",
            self.rank, self.world_size, self.local_rank, self.device, self.backend, self.launcher
        )
    }
}

/// Phases must stay below this so epochs fit in a tag
pub const MAX_PHASE: u32 = 1 << 20;

/// Ring calls allowed within one phase
pub const CALLS_PER_PHASE: u32 = 1 << 16;

/// Identity of one ring call's message exchange
#[derive(Debug, Clone)]
pub struct Exchange {
    pub epoch: u64,
    /// Set when the call is abandoned; pending receives then stop
    pub cancel: CancelToken,
}

#[derive(Debug, Default)]
struct ExchangeState {
    phase: u32,
    next_call: u32,
    cancel: CancelToken,
}

/// Explicit distributed state for one participant
pub struct ClusterContext {
    descriptor: ParticipantDescriptor,
    comm: Mutex<Option<Arc<dyn Communicator>>>,
    exchanges: Mutex<ExchangeState>,
}

impl fmt::Debug for ClusterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterContext")
            .field("descriptor", &self.descriptor)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl ClusterContext {
    /// Single participant, no communicator
    pub fn single() -> Self {
        Self {
            descriptor: ParticipantDescriptor::from_launch(
                LaunchInfo::single(),
                DeviceId(0),
                Backend::Local,
            ),
            comm: Mutex::new(None),
            exchanges: Mutex::new(ExchangeState::default()),
        }
    }

    /// Set up this participant from its launcher environment.
    ///
    /// `endpoint` is this rank's slot of an in-process fabric; it is consumed
    /// and dropped on every failure path, which notifies peers.
    pub fn init(
        env: &EnvSnapshot,
        endpoint: Option<LocalEndpoint>,
        capability: &Capability,
        default_backend: Backend,
    ) -> ForgeResult<Self> {
        let info = Launcher::detect(env)?;
        let backend = Backend::from_env(env, default_backend)?;

        if info.world_size == 1 {
            let mut ctx = Self::single();
            ctx.descriptor.launcher = info.launcher;
            ctx.descriptor.backend = backend;
            return Ok(ctx);
        }

        if !backend.is_in_process() {
            return Err(RingForgeError::BackendUnavailable(format!(
                "rank {}: backend '{}' needs a cross-process transport, which this build does not provide",
                info.rank, backend
            )));
        }

        let endpoint = endpoint.ok_or_else(|| {
            RingForgeError::BackendUnavailable(format!(
                "rank {}: {} reports world size {} but no in-process fabric endpoint was supplied",
                info.rank, info.launcher, info.world_size
            ))
        })?;

        if endpoint.rank() != info.rank || endpoint.world_size() != info.world_size {
            return Err(RingForgeError::DistributedSetupFailed(format!(
                "launcher says rank {}/{} but endpoint is rank {}/{}",
                info.rank,
                info.world_size,
                endpoint.rank(),
                endpoint.world_size()
            )));
        }

        if !capability.available {
            return Err(RingForgeError::AcceleratorUnavailable(format!(
                "rank {}: {}",
                info.rank,
                capability.reason.as_deref().unwrap_or("probe failed")
            )));
        }

        let device = DeviceId::for_local_rank(info.local_rank, capability.device_count);
        let descriptor = ParticipantDescriptor::from_launch(info, device, backend);
        tracing::info!(rank = descriptor.rank, %descriptor, "participant initialized");

        let comm: Arc<dyn Communicator> = Arc::new(endpoint);
        Ok(Self {
            descriptor,
            comm: Mutex::new(Some(comm)),
            exchanges: Mutex::new(ExchangeState::default()),
        })
    }

    pub fn descriptor(&self) -> &ParticipantDescriptor {
        &self.descriptor
    }

    pub fn rank(&self) -> usize {
        self.descriptor.rank
    }

    pub fn world_size(&self) -> usize {
        self.descriptor.world_size
    }

    pub fn is_single(&self) -> bool {
        self.descriptor.world_size == 1
    }

    pub fn is_initialized(&self) -> bool {
        self.comm.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Communicator handle; fails for single contexts and after teardown
    pub fn comm(&self) -> ForgeResult<Arc<dyn Communicator>> {
        self.comm.lock()?.clone().ok_or_else(|| {
            RingForgeError::ProcessGroupNotInitialized(format!(
                "rank {} has no communicator (single participant or torn down)",
                self.descriptor.rank
            ))
        })
    }

    /// Barrier across all participants; a no-op for a single participant
    pub fn barrier(&self, timeout: Duration) -> ForgeResult<()> {
        if self.is_single() {
            return Ok(());
        }
        self.comm()?.barrier(timeout)
    }

    /// Replace `tensor` with rank `root`'s copy; a no-op for a single participant
    pub fn broadcast_tensor(&self, tensor: &mut Tensor, root: usize, timeout: Duration) -> ForgeResult<()> {
        if root >= self.world_size() {
            return Err(RingForgeError::InvalidRank {
                rank: root,
                world_size: self.world_size(),
            });
        }
        if self.is_single() {
            return Ok(());
        }
        let comm = self.comm()?;
        comm_utils::broadcast_tensor(comm.as_ref(), tensor, root, timeout)
    }

    /// Restart exchange numbering at `phase`.
    ///
    /// Every rank enters the same phase before its next ring call, so epochs
    /// line up again even when one rank abandoned calls its peers finished.
    pub fn enter_phase(&self, phase: u32) -> ForgeResult<()> {
        if phase >= MAX_PHASE {
            return Err(RingForgeError::InvalidConfiguration(format!(
                "exchange phase {} exceeds {}",
                phase,
                MAX_PHASE - 1
            )));
        }
        let mut state = self.exchanges.lock()?;
        state.phase = phase;
        state.next_call = 0;
        Ok(())
    }

    /// Epoch and cancel handle for the next ring call
    pub fn begin_exchange(&self) -> ForgeResult<Exchange> {
        let mut state = self.exchanges.lock()?;
        let call = state.next_call;
        if call >= CALLS_PER_PHASE {
            return Err(RingForgeError::InvalidConfiguration(format!(
                "more than {} ring calls in exchange phase {}",
                CALLS_PER_PHASE, state.phase
            )));
        }
        state.next_call = call + 1;
        Ok(Exchange {
            epoch: (u64::from(state.phase) << 16) | u64::from(call),
            cancel: state.cancel.clone(),
        })
    }

    /// Cancel every exchange begun so far; later calls get a fresh token
    pub fn cancel_exchanges(&self) {
        let old = match self.exchanges.lock() {
            Ok(mut state) => std::mem::take(&mut state.cancel),
            Err(poisoned) => std::mem::take(&mut poisoned.into_inner().cancel),
        };
        old.cancel();
        tracing::debug!(rank = self.descriptor.rank, "pending exchanges cancelled");
    }

    /// [`watchdog::run_bounded`] that cancels this participant's pending
    /// exchanges when the wait expires
    pub fn run_bounded<T, F>(&self, label: &str, timeout: Duration, f: F) -> ForgeResult<WatchdogOutcome<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let outcome = watchdog::run_bounded(label, timeout, f)?;
        if outcome.is_timed_out() {
            self.cancel_exchanges();
        }
        Ok(outcome)
    }

    /// Release the communicator. Safe to call more than once.
    pub fn teardown(&self) {
        let comm = match self.comm.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(comm) = comm {
            comm.shutdown();
            tracing::debug!(rank = self.descriptor.rank, "participant torn down");
        }
    }
}

impl Drop for ClusterContext {
    fn drop(&mut self) {
        self.teardown();
    }
}
