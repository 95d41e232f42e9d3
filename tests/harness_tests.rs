//! End-to-end runs of the verification suite

mod common;

use common::{create_temp_dir, create_temp_file_with_suffix, report_path, test_capability};
use ringforge::device::Capability;
use ringforge::distributed::EnvSnapshot;
use ringforge::harness::{Harness, HarnessConfig, ShapeConfig};
use ringforge::RingForgeError;
use std::io::Write;

const DISTRIBUTED_CHECKS: [&str; 2] = ["Distributed Ring Attention", "Ring Attention Variants"];

fn small_config() -> HarnessConfig {
    let mut cfg = HarnessConfig::default().with_skip_perf(true);
    cfg.basic_configs = vec![ShapeConfig::new(1, 32, 2, 16)];
    cfg.reference_shape = ShapeConfig::new(1, 64, 2, 16);
    cfg.ring_shape = ShapeConfig::new(1, 66, 2, 16);
    cfg.variants_shape = ShapeConfig::new(1, 64, 2, 16);
    cfg.exchange_timeout_secs = 10.0;
    cfg
}

#[test]
fn test_single_participant_skips_distributed_checks() {
    let report = Harness::new(small_config())
        .with_capability(test_capability(1))
        .with_env(EnvSnapshot::empty())
        .run()
        .unwrap();

    assert!(report.all_passed());
    assert_eq!(report.exit_code(), 0);
    // basic + reference; perf and distributed checks are skipped
    assert_eq!(report.total(), 2);
    for name in DISTRIBUTED_CHECKS {
        assert!(report.outcome(name).unwrap().skipped);
    }

    let summary = report.render_summary();
    assert!(summary.contains("TEST SUMMARY"));
    assert!(summary.contains("Total: 2/2 tests passed"));
}

#[test]
fn test_local_ring_suite_passes_and_writes_report() {
    let dir = create_temp_dir().unwrap();
    let path = report_path(&dir);

    let report = Harness::new(small_config().with_world_size(2).with_report_path(&path))
        .with_capability(test_capability(2))
        .with_env(EnvSnapshot::empty())
        .run()
        .unwrap();

    for outcome in &report.outcomes {
        assert!(outcome.passed || outcome.skipped, "{} failed: {:?}", outcome.name, outcome.error);
    }
    assert_eq!(report.world_size, 2);
    assert_eq!(report.total(), 4);
    assert_eq!(report.exit_code(), 0);

    report.write_json(&path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    let names: Vec<&str> = json["outcomes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&DISTRIBUTED_CHECKS[0]));
    assert_eq!(json["world_size"], 2);
}

#[test]
fn test_external_launch_without_transport_fails_distributed_checks() {
    let report = Harness::new(small_config())
        .with_capability(test_capability(2))
        .with_env(EnvSnapshot::torchrun(0, 2, 0))
        .run()
        .unwrap();

    assert_eq!(report.exit_code(), 1);
    for name in DISTRIBUTED_CHECKS {
        let outcome = report.outcome(name).unwrap();
        assert!(!outcome.passed && !outcome.skipped);
        assert_eq!(outcome.category.as_deref(), Some("Environment"));
    }
    // single-device checks still ran
    assert!(report.outcome("Basic Flash Attention").unwrap().passed);
}

#[test]
fn test_unavailable_accelerator_stops_before_checks() {
    let err = Harness::new(small_config())
        .with_capability(Capability::unavailable("no devices visible".to_string()))
        .run()
        .unwrap_err();
    assert!(matches!(err, RingForgeError::AcceleratorUnavailable(_)));
    assert!(err.to_string().contains("no devices visible"));
}

#[test]
fn test_config_file_round_trip() {
    let cfg = small_config().with_seed(1234).with_world_size(3);
    let mut file = create_temp_file_with_suffix(".json").unwrap();
    file.write_all(serde_json::to_string_pretty(&cfg).unwrap().as_bytes())
        .unwrap();

    let loaded = HarnessConfig::load(file.path()).unwrap();
    assert_eq!(loaded, cfg);
}
