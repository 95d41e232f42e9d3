//! Configuration for the verification harness
//!
//! [`HarnessConfig`] fixes every shape, tolerance and timeout the checks use.
//! It can be loaded from a JSON file (missing fields take their defaults)
//! and then overridden from `RINGFORGE_*` environment variables.

use crate::attention::{Tolerance, TolerancePolicy};
use crate::config_error;
use crate::distributed::context::Backend;
use crate::distributed::env::{EnvSnapshot, BACKEND_ENV};
use crate::error::{io_context, ForgeResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SEED_ENV: &str = "RINGFORGE_SEED";
pub const WORLD_SIZE_ENV: &str = "RINGFORGE_WORLD_SIZE";
pub const SKIP_PERF_ENV: &str = "RINGFORGE_SKIP_PERF";
pub const REPORT_ENV: &str = "RINGFORGE_REPORT";

/// One attention problem size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeConfig {
    pub batch: usize,
    pub seq_len: usize,
    pub heads: usize,
    pub head_dim: usize,
}

impl ShapeConfig {
    pub const fn new(batch: usize, seq_len: usize, heads: usize, head_dim: usize) -> Self {
        Self {
            batch,
            seq_len,
            heads,
            head_dim,
        }
    }

    /// `(batch, heads, seq_len, head_dim)`
    pub fn bhsd(&self) -> [usize; 4] {
        [self.batch, self.heads, self.seq_len, self.head_dim]
    }

    pub fn with_seq_len(mut self, seq_len: usize) -> Self {
        self.seq_len = seq_len;
        self
    }

    fn validate(&self, what: &str) -> ForgeResult<()> {
        if self.batch == 0 || self.seq_len == 0 || self.heads == 0 || self.head_dim == 0 {
            return Err(config_error!("{} has a zero dimension: {:?}", what, self));
        }
        Ok(())
    }
}

/// Harness configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Base seed; rank-local data uses `seed + rank`
    pub seed: u64,
    /// Participants for the distributed checks when run in-process
    pub world_size: usize,
    /// Communication backend requested for the distributed checks
    pub backend: Backend,

    /// Shapes for the forward/backward smoke check
    pub basic_configs: Vec<ShapeConfig>,

    /// Shape for the flash vs reference comparison
    pub reference_shape: ShapeConfig,
    pub reference_tolerance: Tolerance,
    pub reference_policy: TolerancePolicy,

    /// Sequence lengths for the timing sweep, with the remaining dims from `perf_shape`
    pub perf_seq_lens: Vec<usize>,
    pub perf_shape: ShapeConfig,
    pub perf_warmup: usize,
    pub perf_iters: usize,
    pub skip_perf: bool,

    /// Global shape for the distributed ring check
    pub ring_shape: ShapeConfig,
    /// Ring results vs single-device results
    pub ring_tolerance: Tolerance,
    /// Shape for the variant sweep
    pub variants_shape: ShapeConfig,

    /// Bound on the whole ring forward + backward
    pub ring_timeout_secs: f64,
    /// Bound on each shard receive inside the ring
    pub exchange_timeout_secs: f64,
    /// Bound on the trailing barrier (non-fatal)
    pub barrier_timeout_secs: f64,
    /// Bound on the input broadcast
    pub broadcast_timeout_secs: f64,

    /// Where to write the JSON report, if anywhere
    pub report_path: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            world_size: 1,
            backend: Backend::Local,
            basic_configs: vec![
                ShapeConfig::new(1, 128, 8, 64),
                ShapeConfig::new(2, 256, 12, 64),
                ShapeConfig::new(1, 512, 16, 128),
            ],
            reference_shape: ShapeConfig::new(2, 256, 8, 64),
            reference_tolerance: Tolerance::LOOSE,
            reference_policy: TolerancePolicy::Fail,
            perf_seq_lens: vec![512, 1024, 2048],
            perf_shape: ShapeConfig::new(1, 512, 8, 64),
            perf_warmup: 3,
            perf_iters: 10,
            skip_perf: false,
            ring_shape: ShapeConfig::new(1, 512, 8, 64),
            ring_tolerance: Tolerance::close(2e-3, 2e-3),
            variants_shape: ShapeConfig::new(1, 256, 8, 64),
            ring_timeout_secs: 30.0,
            exchange_timeout_secs: 30.0,
            barrier_timeout_secs: 10.0,
            broadcast_timeout_secs: 30.0,
            report_path: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(env: &EnvSnapshot, key: &str) -> ForgeResult<Option<T>> {
    match env.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| config_error!("{}='{}' is not valid", key, raw)),
    }
}

fn duration_from_secs(secs: f64, what: &str) -> ForgeResult<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|_| config_error!("{} = {} is not a valid duration", what, secs))
}

impl HarnessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; absent fields keep their defaults
    pub fn load(path: &Path) -> ForgeResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| io_context(e, &format!("reading harness config {}", path.display())))?;
        let config: HarnessConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RINGFORGE_SEED`, `RINGFORGE_WORLD_SIZE`, `RINGFORGE_SKIP_PERF`,
    /// `RINGFORGE_BACKEND` and `RINGFORGE_REPORT`
    pub fn apply_env(mut self, env: &EnvSnapshot) -> ForgeResult<Self> {
        if let Some(seed) = parse_env(env, SEED_ENV)? {
            self.seed = seed;
        }
        if let Some(world_size) = parse_env(env, WORLD_SIZE_ENV)? {
            self.world_size = world_size;
        }
        if let Some(raw) = env.get(SKIP_PERF_ENV) {
            self.skip_perf = matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(backend) = parse_env(env, BACKEND_ENV)? {
            self.backend = backend;
        }
        if let Some(path) = env.get(REPORT_ENV) {
            self.report_path = Some(PathBuf::from(path));
        }
        self.validate()?;
        Ok(self)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_world_size(mut self, world_size: usize) -> Self {
        self.world_size = world_size;
        self
    }

    pub fn with_skip_perf(mut self, skip_perf: bool) -> Self {
        self.skip_perf = skip_perf;
        self
    }

    pub fn with_report_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_path = Some(path.into());
        self
    }

    pub fn with_ring_timeout(mut self, timeout: Duration) -> Self {
        self.ring_timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn ring_timeout(&self) -> ForgeResult<Duration> {
        duration_from_secs(self.ring_timeout_secs, "ring_timeout_secs")
    }

    pub fn exchange_timeout(&self) -> ForgeResult<Duration> {
        duration_from_secs(self.exchange_timeout_secs, "exchange_timeout_secs")
    }

    pub fn barrier_timeout(&self) -> ForgeResult<Duration> {
        duration_from_secs(self.barrier_timeout_secs, "barrier_timeout_secs")
    }

    pub fn broadcast_timeout(&self) -> ForgeResult<Duration> {
        duration_from_secs(self.broadcast_timeout_secs, "broadcast_timeout_secs")
    }

    pub fn validate(&self) -> ForgeResult<()> {
        if self.world_size == 0 {
            return Err(config_error!("world_size must be at least 1"));
        }
        if self.perf_iters == 0 {
            return Err(config_error!("perf_iters must be at least 1"));
        }
        for (i, shape) in self.basic_configs.iter().enumerate() {
            shape.validate(&format!("basic_configs[{}]", i))?;
        }
        self.reference_shape.validate("reference_shape")?;
        self.perf_shape.validate("perf_shape")?;
        self.ring_shape.validate("ring_shape")?;
        self.variants_shape.validate("variants_shape")?;
        if self.perf_seq_lens.contains(&0) {
            return Err(config_error!("perf_seq_lens may not contain 0"));
        }
        self.ring_timeout()?;
        self.exchange_timeout()?;
        self.barrier_timeout()?;
        self.broadcast_timeout()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = HarnessConfig::default();
        assert_eq!(cfg.basic_configs.len(), 3);
        assert_eq!(cfg.perf_seq_lens, vec![512, 1024, 2048]);
        assert_eq!(cfg.ring_timeout().unwrap(), Duration::from_secs(30));
        assert_eq!(cfg.barrier_timeout().unwrap(), Duration::from_secs(10));
        assert_eq!(cfg.reference_tolerance, Tolerance::LOOSE);
        assert_eq!(cfg.reference_policy, TolerancePolicy::Fail);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"seed": 7, "world_size": 4, "reference_policy": "warn",
                "reference_tolerance": {{"kind": "close", "rtol": 0.01, "atol": 0.01}}}}"#
        )
        .unwrap();

        let cfg = HarnessConfig::load(file.path()).unwrap();
        assert_eq!(cfg.seed, 7);
        assert_eq!(cfg.world_size, 4);
        assert_eq!(cfg.reference_policy, TolerancePolicy::Warn);
        assert_eq!(cfg.reference_tolerance, Tolerance::close(0.01, 0.01));
        assert_eq!(cfg.perf_iters, 10);
    }

    #[test]
    fn test_load_missing_file() {
        let err = HarnessConfig::load(Path::new("/nonexistent/ringforge.json")).unwrap_err();
        assert!(err.to_string().contains("harness config"));
    }

    #[test]
    fn test_env_overrides() {
        let env = EnvSnapshot::from_pairs([
            (SEED_ENV, "42"),
            (WORLD_SIZE_ENV, "2"),
            (SKIP_PERF_ENV, "true"),
            (BACKEND_ENV, "gloo"),
            (REPORT_ENV, "/tmp/report.json"),
        ]);
        let cfg = HarnessConfig::default().apply_env(&env).unwrap();
        assert_eq!(cfg.seed, 42);
        assert_eq!(cfg.world_size, 2);
        assert!(cfg.skip_perf);
        assert_eq!(cfg.backend, Backend::Gloo);
        assert_eq!(cfg.report_path, Some(PathBuf::from("/tmp/report.json")));

        let bad = EnvSnapshot::from_pairs([(WORLD_SIZE_ENV, "two")]);
        assert!(HarnessConfig::default().apply_env(&bad).is_err());
    }

    #[test]
    fn test_invalid_values() {
        assert!(HarnessConfig::default().with_world_size(0).validate().is_err());

        let mut cfg = HarnessConfig::default();
        cfg.barrier_timeout_secs = -1.0;
        assert!(cfg.validate().is_err());
    }
}
