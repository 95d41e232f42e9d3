//! Attention Benchmark Suite
//!
//! - Flash vs reference forward on one device
//! - Flash backward
//! - Ring forward + backward over in-process participants
//!
//! Run with: `cargo bench --bench attention_bench`

use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ringforge::attention::{
    flash_attention_backward, AttentionBackendRegistry, AttentionConfig,
};
use ringforge::distributed::{ClusterContext, LocalLauncher};
use ringforge::profiling::{attention_flops, tflops};
use ringforge::ring::{ring_attention, ring_attention_backward, RingConfig};
use ringforge::Tensor;

// ============================================================================
// Benchmark Harness
// ============================================================================

struct Benchmark {
    name: String,
    iterations: usize,
    warmup_iterations: usize,
}

impl Benchmark {
    fn new(name: &str, iterations: usize) -> Self {
        Benchmark {
            name: name.to_string(),
            iterations,
            warmup_iterations: iterations.min(3),
        }
    }

    fn run_time<F, R>(&self, mut f: F) -> BenchmarkResult
    where
        F: FnMut() -> R,
    {
        for _ in 0..self.warmup_iterations {
            black_box(f());
        }

        let mut durations = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            let start = Instant::now();
            black_box(f());
            durations.push(start.elapsed());
        }

        BenchmarkResult {
            name: self.name.clone(),
            durations,
        }
    }
}

struct BenchmarkResult {
    name: String,
    durations: Vec<Duration>,
}

impl BenchmarkResult {
    fn avg(&self) -> Duration {
        let total: Duration = self.durations.iter().sum();
        total / self.durations.len().max(1) as u32
    }

    fn report(&self) {
        let mut sorted = self.durations.clone();
        sorted.sort();
        let avg = self.avg();

        println!("\n=== {} ===", self.name);
        println!("Iterations: {}", sorted.len());
        println!("Average: {:.3} ms", avg.as_secs_f64() * 1000.0);
        if let (Some(min), Some(max)) = (sorted.first(), sorted.last()) {
            println!("Min:     {:.3} ms", min.as_secs_f64() * 1000.0);
            println!("Max:     {:.3} ms", max.as_secs_f64() * 1000.0);
            println!("P50:     {:.3} ms", sorted[sorted.len() / 2].as_secs_f64() * 1000.0);
        }
    }
}

fn qkv(batch: usize, heads: usize, seq: usize, dim: usize) -> (Tensor, Tensor, Tensor) {
    let dims = [batch, heads, seq, dim];
    (
        Tensor::randn(&dims, 1),
        Tensor::randn(&dims, 2),
        Tensor::randn(&dims, 3),
    )
}

// ============================================================================
// Single device
// ============================================================================

fn benchmark_forward_backends() {
    println!("\n[Forward: flash vs reference]");
    println!("=============================");

    let registry = AttentionBackendRegistry::new();
    let config = AttentionConfig::causal();

    for (seq, heads, dim) in [(128, 8, 64), (256, 8, 64), (512, 8, 64), (1024, 8, 64)] {
        let (q, k, v) = qkv(1, heads, seq, dim);
        let flops = attention_flops(1, heads, seq, dim);

        for name in ["flash", "reference"] {
            let backend = match registry.get_backend(name) {
                Ok(b) => b,
                Err(e) => {
                    eprintln!("{}: {}", name, e);
                    continue;
                }
            };
            let bench = Benchmark::new(&format!("{} (seq={}, heads={}, dim={})", name, seq, heads, dim), 10);
            let result = bench.run_time(|| backend.forward(&config, &q, &k, &v).ok());
            result.report();
            println!("TFLOPS:  {:.4}", tflops(flops, result.avg()));
        }
    }
}

fn benchmark_flash_backward() {
    println!("\n[Flash backward]");
    println!("================");

    let registry = AttentionBackendRegistry::new();
    let config = AttentionConfig::causal();

    for seq in [256, 512, 1024] {
        let (q, k, v) = qkv(1, 8, seq, 64);
        let (q, k, v) = (
            q.with_requires_grad(true),
            k.with_requires_grad(true),
            v.with_requires_grad(true),
        );
        let fwd = match registry.forward(&config, &q, &k, &v) {
            Ok(fwd) => fwd,
            Err(e) => {
                eprintln!("forward failed: {}", e);
                continue;
            }
        };
        let dout = Tensor::randn(fwd.out.dims(), 4);

        let bench = Benchmark::new(&format!("flash backward (seq={})", seq), 5);
        bench
            .run_time(|| flash_attention_backward(&q, &k, &v, &fwd.out, &fwd.lse, &dout, &config).ok())
            .report();
    }
}

// ============================================================================
// Ring
// ============================================================================

fn benchmark_ring(world_size: usize, seq: usize) {
    let local = seq / world_size;
    let launcher = LocalLauncher::new(world_size);
    let results = launcher.run(move |ctx: &Arc<ClusterContext>| {
        let (q, k, v) = qkv(1, 8, local, 64);
        let (q, k, v) = (
            q.with_requires_grad(true),
            k.with_requires_grad(true),
            v.with_requires_grad(true),
        );
        let cfg = RingConfig::default();
        let bench = Benchmark::new(
            &format!("ring fwd+bwd (P={}, seq={}, rank {})", ctx.world_size(), seq, ctx.rank()),
            5,
        );
        Ok(bench.run_time(|| {
            let out = ring_attention(ctx, &q, &k, &v, &cfg).ok()?;
            let dout = Tensor::full(out.out.dims(), 1.0);
            ring_attention_backward(ctx, &q, &k, &v, &out, &dout, &cfg).ok()
        }))
    });

    match results {
        Ok(per_rank) => {
            for result in per_rank {
                match result {
                    Ok(r) => r.report(),
                    Err(e) => eprintln!("ring benchmark failed: {}", e),
                }
            }
        }
        Err(e) => eprintln!("launcher failed: {}", e),
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() {
    println!("====================================");
    println!("RingForge Attention Benchmark Suite");
    println!("====================================");

    benchmark_forward_backends();
    benchmark_flash_backward();

    println!("\n[Ring attention]");
    println!("================");
    for world_size in [2, 4] {
        benchmark_ring(world_size, 1024);
    }

    println!("\n====================================");
    println!("Benchmark Complete");
    println!("====================================");
}
