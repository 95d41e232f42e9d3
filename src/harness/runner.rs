//! Suite runner
//!
//! Runs the named checks one after another and records a [`TestOutcome`] per
//! check. A check that returns an error or panics fails on its own and the
//! suite moves on to the next one. Only an unavailable accelerator stops the
//! run before any check starts.

use super::checks::{self, DEADLOCK_CAUSES};
use super::config::HarnessConfig;
use crate::device::{self, Capability};
use crate::distributed::context::ClusterContext;
use crate::distributed::env::{EnvSnapshot, Launcher};
use crate::distributed::launcher::{panic_message, LocalLauncher};
use crate::error::{io_context, ForgeResult, RingForgeError};
use serde::Serialize;
use serde_json::{json, Value};
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fmt::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Once};
use std::time::Instant;

const RULE: &str = "================================================================================";

thread_local! {
    static IN_CHECK: Cell<bool> = const { Cell::new(false) };
    static LAST_PANIC: RefCell<Option<(String, String)>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Record panics raised inside a check (message + backtrace) instead of
/// printing them; panics elsewhere go to the previous hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if IN_CHECK.with(Cell::get) {
                let backtrace = Backtrace::force_capture().to_string();
                LAST_PANIC.with(|slot| *slot.borrow_mut() = Some((info.to_string(), backtrace)));
            } else {
                previous(info);
            }
        }));
    });
}

/// Result of one named check
#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    pub name: String,
    pub passed: bool,
    pub skipped: bool,
    pub duration_ms: f64,
    pub error: Option<String>,
    /// `ErrorCategory` of the failure, when it was an error
    pub category: Option<String>,
    /// Captured when the check panicked
    pub backtrace: Option<String>,
    pub details: Value,
}

impl TestOutcome {
    pub fn skipped(name: &str, reason: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            skipped: true,
            duration_ms: 0.0,
            error: None,
            category: None,
            backtrace: None,
            details: json!({ "reason": reason }),
        }
    }

    pub fn failed(name: &str, err: &RingForgeError) -> Self {
        let details = if err.is_distributed() {
            json!({ "suspected_causes": DEADLOCK_CAUSES })
        } else {
            Value::Null
        };
        Self {
            name: name.to_string(),
            passed: false,
            skipped: false,
            duration_ms: 0.0,
            error: Some(err.to_string()),
            category: Some(err.category().to_string()),
            backtrace: None,
            details,
        }
    }

    pub fn status(&self) -> &'static str {
        match (self.skipped, self.passed) {
            (true, _) => "SKIPPED",
            (false, true) => "PASSED",
            (false, false) => "FAILED",
        }
    }
}

/// Run `check` as the test called `name`, converting errors and panics
pub fn run_check<F>(name: &str, check: F) -> TestOutcome
where
    F: FnOnce() -> ForgeResult<Value>,
{
    install_panic_hook();
    tracing::info!(test = name, "running");

    let start = Instant::now();
    IN_CHECK.with(|flag| flag.set(true));
    let result = panic::catch_unwind(AssertUnwindSafe(check));
    IN_CHECK.with(|flag| flag.set(false));
    let duration_ms = start.elapsed().as_secs_f64() * 1e3;

    let mut outcome = match result {
        Ok(Ok(details)) => TestOutcome {
            name: name.to_string(),
            passed: true,
            skipped: false,
            duration_ms,
            error: None,
            category: None,
            backtrace: None,
            details,
        },
        Ok(Err(err)) => TestOutcome::failed(name, &err),
        Err(payload) => {
            let (message, backtrace) = LAST_PANIC
                .with(|slot| slot.borrow_mut().take())
                .unwrap_or_else(|| (panic_message(payload.as_ref()), String::new()));
            TestOutcome {
                name: name.to_string(),
                passed: false,
                skipped: false,
                duration_ms,
                error: Some(format!("panicked: {}", message)),
                category: None,
                backtrace: Some(backtrace),
                details: Value::Null,
            }
        }
    };
    outcome.duration_ms = duration_ms;

    match &outcome.error {
        None => tracing::info!(test = name, duration_ms, "passed"),
        Some(err) => tracing::error!(test = name, duration_ms, error = %err, "failed"),
    }
    outcome
}

/// Fold per-rank outcomes of the same check into one
fn merge_ranks(name: &str, per_rank: Vec<TestOutcome>) -> TestOutcome {
    let passed = per_rank.iter().all(|o| o.passed);
    let duration_ms = per_rank.iter().map(|o| o.duration_ms).fold(0.0, f64::max);
    let errors: Vec<String> = per_rank
        .iter()
        .enumerate()
        .filter_map(|(rank, o)| o.error.as_ref().map(|e| format!("[rank {}] {}", rank, e)))
        .collect();

    TestOutcome {
        name: name.to_string(),
        passed,
        skipped: false,
        duration_ms,
        error: (!errors.is_empty()).then(|| errors.join("; ")),
        category: per_rank.iter().find_map(|o| o.category.clone()),
        backtrace: per_rank.iter().find_map(|o| o.backtrace.clone()),
        details: Value::Array(per_rank.into_iter().map(|o| o.details).collect()),
    }
}

/// Collected outcomes of one suite run
#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub launcher: String,
    pub world_size: usize,
    pub capability: String,
    pub outcomes: Vec<TestOutcome>,
}

impl SuiteReport {
    /// Executed (non-skipped) checks
    pub fn total(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.skipped).count()
    }

    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.skipped && o.passed).count()
    }

    pub fn all_passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    pub fn exit_code(&self) -> i32 {
        if self.all_passed() {
            0
        } else {
            1
        }
    }

    pub fn outcome(&self, name: &str) -> Option<&TestOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    pub fn render_summary(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "{}", RULE);
        let _ = writeln!(s, "TEST SUMMARY");
        let _ = writeln!(s, "{}", RULE);
        for o in &self.outcomes {
            let _ = writeln!(s, "{}: {}", o.name, o.status());
        }
        let _ = writeln!(s);
        let _ = writeln!(s, "Total: {}/{} tests passed", self.passed(), self.total());
        if self.all_passed() {
            let _ = writeln!(s, "All tests passed");
        } else {
            let _ = writeln!(
                s,
                "{} test(s) failed. Check the log above for details.",
                self.total() - self.passed()
            );
        }
        s
    }

    pub fn write_json(&self, path: &Path) -> ForgeResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
            .map_err(|e| io_context(e, &format!("writing report {}", path.display())))
    }
}

/// Verification suite
#[derive(Debug, Clone)]
pub struct Harness {
    config: HarnessConfig,
    capability: Capability,
    env: EnvSnapshot,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            capability: device::probe().clone(),
            env: EnvSnapshot::capture(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }

    /// Launcher environment used when `world_size` is 1
    pub fn with_env(mut self, env: EnvSnapshot) -> Self {
        self.env = env;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run every check. Fails up front only when the accelerator is unavailable.
    pub fn run(&self) -> ForgeResult<SuiteReport> {
        if !self.capability.available {
            return Err(RingForgeError::AcceleratorUnavailable(
                self.capability
                    .reason
                    .clone()
                    .unwrap_or_else(|| "probe failed".to_string()),
            ));
        }
        tracing::info!(capability = %self.capability, "accelerator available");

        let cfg = &self.config;
        let mut outcomes = vec![
            run_check(checks::BASIC_FLASH_ATTENTION, || checks::basic_flash_attention(cfg)),
            run_check(checks::FLASH_VS_REFERENCE, || checks::flash_vs_reference(cfg)),
        ];
        if cfg.skip_perf {
            outcomes.push(TestOutcome::skipped(checks::MEMORY_AND_PERFORMANCE, "disabled by configuration"));
        } else {
            outcomes.push(run_check(checks::MEMORY_AND_PERFORMANCE, || {
                checks::memory_and_performance(cfg)
            }));
        }

        let (launcher, world_size) = if cfg.world_size > 1 {
            outcomes.extend(self.run_local_ring()?);
            ("local".to_string(), cfg.world_size)
        } else {
            self.run_external(&mut outcomes)
        };

        Ok(SuiteReport {
            launcher,
            world_size,
            capability: self.capability.to_string(),
            outcomes,
        })
    }

    /// Distributed checks on `world_size` in-process participants
    fn run_local_ring(&self) -> ForgeResult<Vec<TestOutcome>> {
        let cfg = self.config.clone();
        let per_rank = LocalLauncher::new(self.config.world_size)
            .with_capability(self.capability.clone())
            .run(move |ctx: &Arc<ClusterContext>| {
                Ok(vec![
                    run_check(checks::DISTRIBUTED_RING_ATTENTION, || {
                        checks::distributed_ring_attention(ctx, &cfg)
                    }),
                    run_check(checks::RING_ATTENTION_VARIANTS, || {
                        checks::ring_attention_variants(ctx, &cfg)
                    }),
                ])
            })?;

        let names = [checks::DISTRIBUTED_RING_ATTENTION, checks::RING_ATTENTION_VARIANTS];
        let mut columns: Vec<Vec<TestOutcome>> = vec![Vec::new(), Vec::new()];
        for rank_result in per_rank {
            match rank_result {
                Ok(outcomes) => {
                    for (column, outcome) in columns.iter_mut().zip(outcomes) {
                        column.push(outcome);
                    }
                }
                // setup failed on this rank; both checks fail there
                Err(err) => {
                    for (column, name) in columns.iter_mut().zip(names) {
                        column.push(TestOutcome::failed(name, &err));
                    }
                }
            }
        }

        Ok(names
            .into_iter()
            .zip(columns)
            .map(|(name, column)| merge_ranks(name, column))
            .collect())
    }

    /// Distributed checks for an externally launched process
    fn run_external(&self, outcomes: &mut Vec<TestOutcome>) -> (String, usize) {
        let names = [checks::DISTRIBUTED_RING_ATTENTION, checks::RING_ATTENTION_VARIANTS];

        let info = match Launcher::detect(&self.env) {
            Ok(info) => info,
            Err(err) => {
                outcomes.extend(names.iter().map(|n| TestOutcome::failed(n, &err)));
                return ("unknown".to_string(), 1);
            }
        };
        tracing::info!(launcher = %info.launcher, rank = info.rank, world_size = info.world_size, "detected launcher");

        if info.world_size == 1 {
            tracing::warn!("single participant; distributed checks skipped (use --world-size 2)");
            outcomes.extend(
                names
                    .iter()
                    .map(|n| TestOutcome::skipped(n, "single participant")),
            );
            return (info.launcher.to_string(), 1);
        }

        match ClusterContext::init(&self.env, None, &self.capability, self.config.backend) {
            Ok(ctx) => {
                let ctx = Arc::new(ctx);
                outcomes.push(run_check(checks::DISTRIBUTED_RING_ATTENTION, || {
                    checks::distributed_ring_attention(&ctx, &self.config)
                }));
                outcomes.push(run_check(checks::RING_ATTENTION_VARIANTS, || {
                    checks::ring_attention_variants(&ctx, &self.config)
                }));
                ctx.teardown();
            }
            Err(err) => {
                tracing::error!(rank = info.rank, error = %err, "distributed setup failed");
                outcomes.extend(names.iter().map(|n| TestOutcome::failed(n, &err)));
            }
        }
        (info.launcher.to_string(), info.world_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_check_records_error_category() {
        let outcome = run_check("bad", || Err(RingForgeError::MissingGradient("q".to_string())));
        assert!(!outcome.passed);
        assert_eq!(outcome.category.as_deref(), Some("Numerical"));
        assert_eq!(outcome.status(), "FAILED");
    }

    #[test]
    fn test_run_check_catches_panic_with_backtrace() {
        let outcome = run_check("boom", || panic!("kernel exploded"));
        assert!(!outcome.passed);
        assert!(outcome.error.as_deref().unwrap().contains("kernel exploded"));
        assert!(outcome.backtrace.is_some());
    }

    #[test]
    fn test_timeout_outcome_lists_causes() {
        let err = RingForgeError::CollectiveTimeout {
            op: "recv".to_string(),
            rank: 1,
            waited: std::time::Duration::from_secs(30),
        };
        let outcome = TestOutcome::failed("ring", &err);
        assert_eq!(outcome.details["suspected_causes"].as_array().unwrap().len(), 3);
        assert!(outcome.error.unwrap().starts_with("[rank 1]"));
    }

    #[test]
    fn test_summary_and_exit_code() {
        let report = SuiteReport {
            launcher: "single".to_string(),
            world_size: 1,
            capability: "test".to_string(),
            outcomes: vec![
                run_check("a", || Ok(Value::Null)),
                TestOutcome::skipped("b", "single participant"),
            ],
        };
        assert_eq!((report.passed(), report.total()), (1, 1));
        assert_eq!(report.exit_code(), 0);
        let summary = report.render_summary();
        assert!(summary.contains("a: PASSED"));
        assert!(summary.contains("b: SKIPPED"));
        assert!(summary.contains("Total: 1/1 tests passed"));

        let mut failing = report.clone();
        failing.outcomes.push(run_check("c", || Err(RingForgeError::ToleranceExceeded("x".to_string()))));
        assert_eq!(failing.exit_code(), 1);
        assert_eq!(failing.total(), 2);
    }

    #[test]
    fn test_merge_ranks() {
        let ok = run_check("x", || Ok(json!(1)));
        let bad = TestOutcome::failed("x", &RingForgeError::MissingGradient("k".to_string()));
        let merged = merge_ranks("x", vec![ok, bad]);
        assert!(!merged.passed);
        assert!(merged.error.unwrap().starts_with("[rank 1]"));
    }

    #[test]
    fn test_unavailable_accelerator_aborts() {
        let harness = Harness::new(HarnessConfig::default())
            .with_capability(Capability::unavailable("no device".to_string()));
        assert!(matches!(
            harness.run().unwrap_err(),
            RingForgeError::AcceleratorUnavailable(_)
        ));
    }
}
