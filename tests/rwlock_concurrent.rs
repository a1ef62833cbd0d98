//! Concurrent behavior of the strong try-RW-lock: real mutual
//! exclusion, no spurious failures under handover, and clean
//! reader/writer arbitration.

use devir::StrongTryRwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
#[cfg_attr(miri, ignore)]
fn exclusive_holders_never_overlap() {
    const THREADS: usize = 4;
    const ACQUISITIONS: usize = 2_000;
    let lock = Arc::new(StrongTryRwLock::new(THREADS));
    let inside = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let total = Arc::clone(&total);
            thread::spawn(move || {
                let mut acquired = 0;
                while acquired < ACQUISITIONS {
                    if lock.exclusive_try_lock(tid) {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        lock.exclusive_unlock();
                        acquired += 1;
                        total.fetch_add(1, Ordering::Relaxed);
                    } else {
                        std::hint::spin_loop();
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(
        total.load(Ordering::Relaxed),
        (THREADS * ACQUISITIONS) as u64
    );
}

#[test]
#[cfg_attr(miri, ignore)]
fn readers_and_writer_arbitrate_cleanly() {
    const READERS: usize = 3;
    const ROUNDS: usize = 2_000;
    let lock = Arc::new(StrongTryRwLock::new(READERS + 1));
    let writer_in = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..READERS)
        .map(|tid| {
            let lock = Arc::clone(&lock);
            let writer_in = Arc::clone(&writer_in);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    if lock.shared_try_lock(tid) {
                        // A successful shared hold excludes the writer's
                        // exclusive section entirely.
                        assert!(!writer_in.load(Ordering::SeqCst));
                        lock.shared_unlock(tid);
                    }
                }
            })
        })
        .collect();

    let writer_tid = READERS;
    for _ in 0..ROUNDS {
        if lock.exclusive_try_lock(writer_tid) {
            writer_in.store(true, Ordering::SeqCst);
            writer_in.store(false, Ordering::SeqCst);
            lock.exclusive_unlock();
        }
    }
    stop.store(true, Ordering::Release);
    for h in readers {
        h.join().unwrap();
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn downgrade_hands_over_to_readers() {
    const ROUNDS: usize = 2_000;
    let lock = Arc::new(StrongTryRwLock::new(2));
    let phase = Arc::new(AtomicU64::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let reader = {
        let lock = Arc::clone(&lock);
        let phase = Arc::clone(&phase);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut observed = 0u64;
            while !stop.load(Ordering::Acquire) {
                if lock.shared_try_lock(1) {
                    // Under the shared hold the writer is fully out of
                    // its exclusive section: the phase is stable.
                    let p1 = phase.load(Ordering::SeqCst);
                    let p2 = phase.load(Ordering::SeqCst);
                    assert_eq!(p1, p2);
                    assert_eq!(p1 % 2, 0, "observed a mid-write phase");
                    lock.shared_unlock(1);
                    observed += 1;
                }
            }
            observed
        })
    };

    for _ in 0..ROUNDS {
        if lock.exclusive_try_lock(0) {
            // Odd phase marks "inside the write"; readers must never
            // see it, including those admitted by the downgrade.
            phase.fetch_add(1, Ordering::SeqCst);
            phase.fetch_add(1, Ordering::SeqCst);
            lock.downgrade();
            lock.set_read_unlock();
        }
        std::hint::spin_loop();
    }
    stop.store(true, Ordering::Release);
    let observed = reader.join().unwrap();
    assert!(observed > 0, "reader never got in");
}
