use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;
use std::time::Instant;

use clap::Parser;
use log::warn;
use qalloc::util::WyRand;
use qalloc::{thread, NativeAllocator};

/// Randomized allocate/deallocate churn against the shared allocator.
#[derive(Parser, Debug)]
#[command(about, version, author)]
struct Args {
    /// Max number of threads
    #[arg(short, long, default_value_t = 8)]
    threads: usize,
    /// Smallest requested size order
    #[arg(long, default_value_t = 3)]
    min_order: usize,
    /// Largest requested size order
    #[arg(long, default_value_t = 12)]
    max_order: usize,
    /// Runtime in seconds
    #[arg(long, default_value_t = 10)]
    time: usize,
    /// Allocations held per thread
    #[arg(short, long, default_value_t = 4096)]
    working_set: usize,
    /// Partition count per quantum allocator
    #[arg(short, long, default_value_t = 32)]
    partitions: usize,
    /// Using only every n-th CPU
    #[arg(long, default_value_t = 1)]
    stride: usize,
}

fn main() {
    let Args {
        threads,
        min_order,
        max_order,
        time,
        working_set,
        partitions,
        stride,
    } = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .init();

    assert!(min_order >= 3 && min_order <= max_order);

    // `thread::pin` uses this to select every nth cpu
    if stride > 1 {
        thread::STRIDE.store(stride, Ordering::Relaxed);
    }

    let alloc = NativeAllocator::create(
        0,
        true,
        false,
        partitions,
        partitions,
        partitions,
        threads * 2,
    )
    .expect("cannot reserve");

    let barrier = Barrier::new(threads);
    let running = AtomicBool::new(true);
    let start = Instant::now();

    warn!("start t={threads} o={min_order}..={max_order}");

    let rounds = thread::parallel(0..threads, |t| {
        thread::pin(t);
        let mut rng = WyRand::new(t as u64 + 100);
        let mut live = Vec::with_capacity(working_set);

        barrier.wait();

        let mut rounds = 0usize;
        while running.load(Ordering::Relaxed) {
            let target = rng.range(0..working_set as u64) as usize;
            while target != live.len() {
                if target < live.len() {
                    let i = rng.range(0..live.len() as u64) as usize;
                    alloc.deallocate(live.swap_remove(i));
                } else {
                    let order = rng.range(min_order as u64..max_order as u64 + 1) as usize;
                    match alloc.allocate(1 << order) {
                        Ok(addr) => live.push(addr),
                        Err(_) => break,
                    }
                }
            }
            rounds += 1;

            if t == 0 && start.elapsed().as_secs() >= time as u64 {
                running.store(false, Ordering::Relaxed);
            }
        }

        for addr in live.drain(..) {
            alloc.deallocate(addr);
        }
        rounds
    });

    warn!(
        "finished rounds={} in {}ms",
        rounds.iter().sum::<usize>(),
        start.elapsed().as_millis()
    );
    warn!("{alloc:?}");

    assert_eq!(alloc.allocated_count(), 0);
    alloc.close();
}
