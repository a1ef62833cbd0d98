//! Minimal usage: a shared counter with exact increments.
//!
//! Run with: cargo run --example counter

use devir::CxUniversal;
use std::sync::Arc;
use std::thread;

fn main() {
    const THREADS: usize = 4;
    const PER_THREAD: u64 = 100_000;

    let counter: Arc<CxUniversal<u64, u64>> =
        Arc::new(CxUniversal::with_max_threads(0, THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    counter.apply_update(
                        |n| {
                            *n += 1;
                            *n
                        },
                        tid,
                    );
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let total = counter.apply_read(|n| *n, 0);
    println!("{THREADS} threads x {PER_THREAD} increments = {total}");
    assert_eq!(total, THREADS as u64 * PER_THREAD);
}
