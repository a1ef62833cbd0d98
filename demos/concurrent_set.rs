//! A sequential sorted set made concurrent: writers insert disjoint
//! ranges while readers watch the size grow.
//!
//! Run with: cargo run --example concurrent_set

use devir::CxUniversalTimed;
use devir_sets::SortedVecSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn main() {
    const WRITERS: usize = 2;
    const READERS: usize = 2;
    const PER_WRITER: u64 = 50_000;

    let set: Arc<CxUniversalTimed<SortedVecSet<u64>, u64>> = Arc::new(
        CxUniversalTimed::with_max_threads(SortedVecSet::new(), WRITERS + READERS),
    );
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..READERS)
        .map(|i| {
            let set = Arc::clone(&set);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let tid = WRITERS + i;
                let mut peak = 0;
                while !stop.load(Ordering::Acquire) {
                    peak = peak.max(set.apply_read(|s| s.len() as u64, tid));
                }
                peak
            })
        })
        .collect();

    let writers: Vec<_> = (0..WRITERS)
        .map(|tid| {
            let set = Arc::clone(&set);
            thread::spawn(move || {
                let base = tid as u64 * PER_WRITER;
                for key in base..base + PER_WRITER {
                    set.apply_update(move |s| u64::from(s.add(key)), tid);
                }
            })
        })
        .collect();

    for w in writers {
        w.join().unwrap();
    }
    stop.store(true, Ordering::Release);
    for r in readers {
        let peak = r.join().unwrap();
        println!("reader peak size: {peak}");
    }

    let final_len = set.apply_read(|s| s.len() as u64, 0);
    println!(
        "final size: {final_len}, state copies: {}",
        set.state_copies()
    );
    assert_eq!(final_len, WRITERS as u64 * PER_WRITER);
}
