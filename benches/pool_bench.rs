//! Pool benchmark suite
//!
//! Measures the pool's free-list hit path against raw heap allocation and
//! tracks how quickly mixed workloads stop touching upstream:
//! - Steady-state reuse of a single hot size
//! - Mixed sizes with interleaved frees (coalescing pressure)
//! - Upstream call amortization over a ramp-up phase
//!
//! Run with: `cargo bench --bench pool_bench`

use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

use hippool::{HeapResource, MemoryResource, PoolOptions, PoolResource};

const ITERATIONS: usize = 100_000;

fn report(name: &str, iterations: usize, start: Instant) {
    let elapsed = start.elapsed();
    let per_op = elapsed.as_nanos() as f64 / iterations as f64;
    println!("{:<40} {:>10} ops  {:>8.1} ns/op", name, iterations, per_op);
}

fn bench_raw_heap_baseline() {
    let heap = HeapResource;

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        let ptr = heap.allocate(512, 64).unwrap();
        black_box(ptr);
        heap.deallocate(ptr, 512, 64).unwrap();
    }
    report("raw heap allocate/deallocate", ITERATIONS, start);
}

fn bench_pool_steady_state_reuse() {
    let pool: PoolResource<HeapResource> =
        PoolResource::new(Arc::new(HeapResource), PoolOptions::host());

    // Warm the pool so the measured loop never touches upstream.
    let warm = pool.allocate(512, 64).unwrap();
    pool.deallocate(warm, 512, 64).unwrap();

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        let ptr = pool.allocate(512, 64).unwrap();
        black_box(ptr);
        pool.deallocate(ptr, 512, 64).unwrap();
    }
    report("pool steady-state reuse", ITERATIONS, start);
}

fn bench_pool_mixed_sizes() {
    let pool: PoolResource<HeapResource> =
        PoolResource::new(Arc::new(HeapResource), PoolOptions::host());
    let sizes = [64usize, 256, 1024, 4096, 512, 128];

    let start = Instant::now();
    let mut held: Vec<(*mut u8, usize)> = Vec::with_capacity(8);
    for i in 0..ITERATIONS {
        let bytes = sizes[i % sizes.len()];
        let ptr = pool.allocate(bytes, 64).unwrap();
        held.push((ptr, bytes));
        if held.len() == 8 {
            // Free in reverse order so neighbors coalesce.
            while let Some((ptr, bytes)) = held.pop() {
                pool.deallocate(ptr, bytes, 64).unwrap();
            }
        }
    }
    while let Some((ptr, bytes)) = held.pop() {
        pool.deallocate(ptr, bytes, 64).unwrap();
    }
    report("pool mixed sizes, batched frees", ITERATIONS, start);
}

fn bench_pool_ramp_up() {
    let upstream = Arc::new(HeapResource);
    let pool: PoolResource<HeapResource> =
        PoolResource::new(upstream, PoolOptions::host());

    let start = Instant::now();
    let mut held = Vec::with_capacity(1024);
    for round in 0..64 {
        for _ in 0..16 {
            held.push(pool.allocate(1024, 64).unwrap());
        }
        if round % 2 == 1 {
            for ptr in held.drain(..) {
                pool.deallocate(ptr, 1024, 64).unwrap();
            }
        }
    }
    for ptr in held.drain(..) {
        pool.deallocate(ptr, 1024, 64).unwrap();
    }
    report("pool ramp-up with partial frees", 64 * 16, start);
    println!(
        "{:<40} {:>10} blocks",
        "upstream blocks after ramp-up",
        pool.owned_block_count().unwrap()
    );
}

fn main() {
    println!("====================================");
    println!("hippool Benchmark Suite");
    println!("====================================");

    bench_raw_heap_baseline();
    bench_pool_steady_state_reuse();
    bench_pool_mixed_sizes();
    bench_pool_ramp_up();

    println!("====================================");
    println!("Benchmark Complete");
    println!("====================================");
}
