//! Launcher environment detection
//!
//! Each supported launcher exports rank information through its own set of
//! variables. Detection reads an [`EnvSnapshot`] rather than the live
//! environment so tests and the local launcher can hand in synthetic ones.

use crate::error::{ForgeResult, RingForgeError};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Selects the communication backend (`local`, `ccl`, `mpi`, `gloo`)
pub const BACKEND_ENV: &str = "RINGFORGE_BACKEND";

/// Frozen copy of environment variables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    /// Copy the process environment
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// What `torchrun` exports for one worker
    pub fn torchrun(rank: usize, world_size: usize, local_rank: usize) -> Self {
        Self::from_pairs([
            ("RANK", rank.to_string()),
            ("WORLD_SIZE", world_size.to_string()),
            ("LOCAL_RANK", local_rank.to_string()),
        ])
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

/// Process launcher that started this participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Launcher {
    Torchrun,
    OpenMpi,
    /// Intel MPI / MPICH (Hydra process manager)
    Hydra,
    Slurm,
    Single,
}

/// Variable names: (rank, world size, local rank)
struct LauncherVars {
    launcher: Launcher,
    rank: &'static str,
    size: &'static str,
    local_rank: &'static str,
}

/// Checked in order; first match wins
const LAUNCHERS: [LauncherVars; 4] = [
    LauncherVars {
        launcher: Launcher::Torchrun,
        rank: "RANK",
        size: "WORLD_SIZE",
        local_rank: "LOCAL_RANK",
    },
    LauncherVars {
        launcher: Launcher::OpenMpi,
        rank: "OMPI_COMM_WORLD_RANK",
        size: "OMPI_COMM_WORLD_SIZE",
        local_rank: "OMPI_COMM_WORLD_LOCAL_RANK",
    },
    LauncherVars {
        launcher: Launcher::Hydra,
        rank: "PMI_RANK",
        size: "PMI_SIZE",
        local_rank: "MPI_LOCALRANKID",
    },
    LauncherVars {
        launcher: Launcher::Slurm,
        rank: "SLURM_PROCID",
        size: "SLURM_NTASKS",
        local_rank: "SLURM_LOCALID",
    },
];

/// Rank information reported by the launcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LaunchInfo {
    pub launcher: Launcher,
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
}

impl LaunchInfo {
    pub fn single() -> Self {
        Self {
            launcher: Launcher::Single,
            rank: 0,
            world_size: 1,
            local_rank: 0,
        }
    }
}

fn parse_var(env: &EnvSnapshot, launcher: Launcher, key: &str) -> ForgeResult<Option<usize>> {
    match env.get(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<usize>().map(Some).map_err(|_| {
            RingForgeError::DistributedSetupFailed(format!(
                "{} set {}='{}', expected a non-negative integer",
                launcher, key, raw
            ))
        }),
    }
}

impl Launcher {
    /// Detect the launcher and rank layout.
    ///
    /// A launcher matches when both its rank and world-size variables are
    /// set. The local rank defaults to the global rank when absent.
    pub fn detect(env: &EnvSnapshot) -> ForgeResult<LaunchInfo> {
        for vars in &LAUNCHERS {
            if env.get(vars.rank).is_none() || env.get(vars.size).is_none() {
                continue;
            }

            let rank = parse_var(env, vars.launcher, vars.rank)?.unwrap_or_default();
            let world_size = parse_var(env, vars.launcher, vars.size)?.unwrap_or_default();
            let local_rank = parse_var(env, vars.launcher, vars.local_rank)?.unwrap_or(rank);

            if world_size == 0 {
                return Err(RingForgeError::DistributedSetupFailed(format!(
                    "{} reports world size 0",
                    vars.launcher
                )));
            }
            if rank >= world_size {
                return Err(RingForgeError::InvalidRank { rank, world_size });
            }

            return Ok(LaunchInfo {
                launcher: vars.launcher,
                rank,
                world_size,
                local_rank,
            });
        }

        Ok(LaunchInfo::single())
    }
}

impl fmt::Display for Launcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Launcher::Torchrun => write!(f, "torchrun"),
            Launcher::OpenMpi => write!(f, "openmpi"),
            Launcher::Hydra => write!(f, "hydra"),
            Launcher::Slurm => write!(f, "slurm"),
            Launcher::Single => write!(f, "single"),
        }
    }
}
