//! Process-group lifecycle, launcher detection and hang diagnosis

mod common;

use common::{serial, test_capability};
use ringforge::distributed::{
    run_bounded, Backend, ClusterContext, EnvSnapshot, LaunchInfo, Launcher, LocalFabric, LocalLauncher,
};
use ringforge::ring::{ring_attention, RingConfig};
use ringforge::{RingForgeError, Tensor};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn local_qkv(rank: usize) -> (Tensor, Tensor, Tensor) {
    let dims = [1, 2, 16, 8];
    let seed = 10 * rank as u64;
    (
        Tensor::randn(&dims, seed),
        Tensor::randn(&dims, seed + 1),
        Tensor::randn(&dims, seed + 2),
    )
}

#[test]
fn test_ring_times_out_when_peer_never_joins() {
    let launcher = LocalLauncher::new(2).with_capability(test_capability(2));
    let results = launcher
        .run(|ctx: &Arc<ClusterContext>| {
            if ctx.rank() == 1 {
                // stays alive past rank 0's deadline without entering the ring
                thread::sleep(Duration::from_millis(800));
                return Ok(());
            }
            let (q, k, v) = local_qkv(ctx.rank());
            let cfg = RingConfig::default().with_exchange_timeout(Duration::from_millis(150));
            ring_attention(ctx, &q, &k, &v, &cfg).map(|_| ())
        })
        .unwrap();

    let err = results[0].as_ref().unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {}", err);
    assert!(err.is_distributed());
    assert!(err.to_string().contains("recv from rank 1"), "{}", err);
    assert!(results[1].is_ok());
}

#[test]
fn test_departed_peer_is_reported_without_waiting() {
    let launcher = LocalLauncher::new(2).with_capability(test_capability(2));
    let results = launcher
        .run(|ctx: &Arc<ClusterContext>| {
            if ctx.rank() == 1 {
                return Ok(Duration::ZERO);
            }
            // let rank 1 finish and tear down first
            thread::sleep(Duration::from_millis(100));
            let (q, k, v) = local_qkv(0);
            let cfg = RingConfig::default().with_exchange_timeout(Duration::from_secs(20));
            let start = Instant::now();
            let err = ring_attention(ctx, &q, &k, &v, &cfg).unwrap_err();
            assert!(err.is_distributed(), "{}", err);
            assert!(!err.is_timeout());
            Ok(start.elapsed())
        })
        .unwrap();

    let elapsed = results[0].as_ref().unwrap();
    assert!(*elapsed < Duration::from_secs(5), "took {:?}", elapsed);
}

#[test]
fn test_watchdog_bounds_a_hung_ring_call() {
    let launcher = LocalLauncher::new(2).with_capability(test_capability(2));
    let results = launcher
        .run(|ctx: &Arc<ClusterContext>| {
            if ctx.rank() == 1 {
                thread::sleep(Duration::from_millis(400));
                return Ok(());
            }
            let ring_ctx = Arc::clone(ctx);
            let outcome = run_bounded("ring forward", Duration::from_millis(100), move || {
                let (q, k, v) = local_qkv(0);
                let cfg = RingConfig::default().with_exchange_timeout(Duration::from_secs(10));
                ring_attention(&ring_ctx, &q, &k, &v, &cfg).map(|_| ())
            })?;
            assert!(outcome.is_timed_out());
            outcome.into_result(ctx.rank()).and_then(|inner| inner)
        })
        .unwrap();

    match results[0].as_ref().unwrap_err() {
        RingForgeError::CollectiveTimeout { op, rank, .. } => {
            assert_eq!(op, "ring forward");
            assert_eq!(*rank, 0);
        }
        other => panic!("unexpected error {}", other),
    }
}

#[test]
fn test_ring_call_after_watchdog_timeout_succeeds() {
    let launcher = LocalLauncher::new(2).with_capability(test_capability(2));
    let results = launcher
        .run(|ctx: &Arc<ClusterContext>| {
            let (q, k, v) = local_qkv(ctx.rank());
            let cfg = RingConfig::default().with_exchange_timeout(Duration::from_secs(5));
            if ctx.rank() == 1 {
                // joins after rank 0 gave up on its first call
                thread::sleep(Duration::from_millis(300));
                ring_attention(ctx, &q, &k, &v, &cfg)?;
                return ring_attention(ctx, &q, &k, &v, &cfg).map(|_| ());
            }

            let ring_ctx = Arc::clone(ctx);
            let (jq, jk, jv, jcfg) = (q.clone(), k.clone(), v.clone(), cfg.clone());
            let outcome = ctx.run_bounded("ring forward", Duration::from_millis(100), move || {
                ring_attention(&ring_ctx, &jq, &jk, &jv, &jcfg).map(|_| ())
            })?;
            assert!(outcome.is_timed_out());
            ring_attention(ctx, &q, &k, &v, &cfg).map(|_| ())
        })
        .unwrap();

    for (rank, result) in results.iter().enumerate() {
        assert!(result.is_ok(), "rank {}: {:?}", rank, result);
    }
}

#[test]
fn test_barrier_after_watchdog_timeout_is_bounded() {
    let launcher = LocalLauncher::new(2).with_capability(test_capability(2));
    let results = launcher
        .run(|ctx: &Arc<ClusterContext>| {
            if ctx.rank() == 1 {
                thread::sleep(Duration::from_millis(600));
                return Ok(Duration::ZERO);
            }
            let ring_ctx = Arc::clone(ctx);
            let outcome = ctx.run_bounded("ring forward", Duration::from_millis(100), move || {
                let (q, k, v) = local_qkv(0);
                let cfg = RingConfig::default().with_exchange_timeout(Duration::from_secs(10));
                ring_attention(&ring_ctx, &q, &k, &v, &cfg).map(|_| ())
            })?;
            assert!(outcome.is_timed_out());

            let start = Instant::now();
            let err = ctx.barrier(Duration::from_millis(200)).unwrap_err();
            assert!(err.is_timeout(), "{}", err);
            Ok(start.elapsed())
        })
        .unwrap();

    let elapsed = results[0].as_ref().unwrap();
    assert!(*elapsed < Duration::from_millis(1000), "barrier took {:?}", elapsed);
}

#[test]
fn test_phases_realign_ranks_after_abandoned_call() {
    let launcher = LocalLauncher::new(2).with_capability(test_capability(2));
    let results = launcher
        .run(|ctx: &Arc<ClusterContext>| {
            let (q, k, v) = local_qkv(ctx.rank());
            let cfg = RingConfig::default().with_exchange_timeout(Duration::from_secs(5));

            ctx.enter_phase(1)?;
            if ctx.rank() == 0 {
                // rank 1 never takes part in this phase
                let ring_ctx = Arc::clone(ctx);
                let (jq, jk, jv, jcfg) = (q.clone(), k.clone(), v.clone(), cfg.clone());
                let outcome = ctx.run_bounded("ring forward", Duration::from_millis(100), move || {
                    ring_attention(&ring_ctx, &jq, &jk, &jv, &jcfg).map(|_| ())
                })?;
                assert!(outcome.is_timed_out());
            } else {
                thread::sleep(Duration::from_millis(200));
            }

            ctx.enter_phase(2)?;
            ring_attention(ctx, &q, &k, &v, &cfg).map(|_| ())
        })
        .unwrap();

    for (rank, result) in results.iter().enumerate() {
        assert!(result.is_ok(), "rank {}: {:?}", rank, result);
    }
}

#[test]
fn test_broadcast_and_barrier_across_ranks() {
    let launcher = LocalLauncher::new(4).with_capability(test_capability(2));
    let results = launcher
        .run(|ctx: &Arc<ClusterContext>| {
            let mut t = if ctx.rank() == 0 {
                Tensor::randn(&[2, 3], 99)
            } else {
                Tensor::zeros(&[2, 3])
            };
            ctx.broadcast_tensor(&mut t, 0, Duration::from_secs(5))?;
            ctx.barrier(Duration::from_secs(5))?;
            Ok((ctx.descriptor().device.index(), t.into_data()))
        })
        .unwrap();

    let expected = Tensor::randn(&[2, 3], 99).into_data();
    for (rank, result) in results.into_iter().enumerate() {
        let (device, data) = result.unwrap();
        assert_eq!(device, rank % 2);
        assert_eq!(data, expected);
    }
}

#[test]
fn test_teardown_is_idempotent() {
    let mut endpoints = LocalFabric::create(2).unwrap();
    let endpoint = endpoints.remove(0);
    let env = EnvSnapshot::torchrun(0, 2, 0);
    let ctx = ClusterContext::init(&env, Some(endpoint), &test_capability(1), Backend::Local).unwrap();

    assert!(ctx.is_initialized());
    ctx.teardown();
    ctx.teardown();
    assert!(!ctx.is_initialized());
    assert!(matches!(
        ctx.comm(),
        Err(RingForgeError::ProcessGroupNotInitialized(_))
    ));
    // collectives after teardown are errors, not hangs
    assert!(ctx.barrier(Duration::from_millis(10)).is_err());
}

#[test]
fn test_setup_rejects_unusable_environment() {
    let cap = test_capability(1);

    let env = EnvSnapshot::torchrun(0, 2, 0);
    let err = ClusterContext::init(&env, None, &cap, Backend::Local).unwrap_err();
    assert!(matches!(err, RingForgeError::BackendUnavailable(_)), "{}", err);

    let env = EnvSnapshot::torchrun(0, 2, 0).with("RINGFORGE_BACKEND", "mpi");
    let endpoint = LocalFabric::create(2).unwrap().remove(0);
    let err = ClusterContext::init(&env, Some(endpoint), &cap, Backend::Local).unwrap_err();
    assert!(matches!(err, RingForgeError::BackendUnavailable(_)), "{}", err);

    let env = EnvSnapshot::torchrun(1, 2, 1);
    let endpoint = LocalFabric::create(2).unwrap().remove(0);
    let err = ClusterContext::init(&env, Some(endpoint), &cap, Backend::Local).unwrap_err();
    assert!(matches!(err, RingForgeError::DistributedSetupFailed(_)), "{}", err);

    let env = EnvSnapshot::torchrun(0, 1, 0);
    let ctx = ClusterContext::init(&env, None, &cap, Backend::Local).unwrap();
    assert!(ctx.is_single());
}

#[test]
#[serial]
fn test_launcher_detection_from_process_env() {
    let keys = ["RANK", "WORLD_SIZE", "LOCAL_RANK"];
    let saved: Vec<_> = keys.iter().map(|k| std::env::var(k).ok()).collect();

    std::env::set_var("RANK", "3");
    std::env::set_var("WORLD_SIZE", "8");
    std::env::set_var("LOCAL_RANK", "1");
    let info = Launcher::detect(&EnvSnapshot::capture());

    for (key, value) in keys.iter().zip(saved) {
        match value {
            Some(v) => std::env::set_var(key, v),
            None => std::env::remove_var(key),
        }
    }

    let info = info.unwrap();
    assert_eq!(info.launcher, Launcher::Torchrun);
    assert_eq!((info.rank, info.world_size, info.local_rank), (3, 8, 1));
}

#[test]
fn test_launcher_detection_rejects_out_of_range_rank() {
    let env = EnvSnapshot::from_pairs([("OMPI_COMM_WORLD_RANK", "4"), ("OMPI_COMM_WORLD_SIZE", "4")]);
    let err = Launcher::detect(&env).unwrap_err();
    assert!(err.is_distributed() || err.is_user_error(), "{}", err);

    let info = Launcher::detect(&EnvSnapshot::empty()).unwrap();
    assert_eq!(info, LaunchInfo::single());
}
