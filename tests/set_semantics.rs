//! End-to-end semantics over sequential set states.
//!
//! The wrapped sets answer exactly as their single-threaded selves
//! would; under contention every submitted mutation lands exactly once,
//! in ticket order.

use devir::{CxUniversal, CxUniversalTimed};
use devir_sets::SortedVecSet;
use std::sync::Arc;
use std::thread;

#[test]
fn membership_round_trip() {
    let uc = CxUniversal::with_max_threads(SortedVecSet::new(), 2);
    assert!(uc.apply_update(|s| s.add(42), 0));
    assert!(uc.apply_read(|s| s.contains(&42), 0));
    assert!(uc.apply_update(|s| s.remove(&42), 0));
    assert!(!uc.apply_read(|s| s.contains(&42), 0));
}

#[test]
fn membership_round_trip_timed() {
    let uc = CxUniversalTimed::with_max_threads(SortedVecSet::new(), 2);
    assert!(uc.apply_update(|s| s.add(42), 0));
    assert!(uc.apply_read(|s| s.contains(&42), 0));
    assert!(uc.apply_update(|s| s.remove(&42), 0));
    assert!(!uc.apply_read(|s| s.contains(&42), 0));
}

#[test]
fn duplicate_adds_and_missing_removes_report_false() {
    let uc = CxUniversal::with_max_threads(SortedVecSet::new(), 2);
    assert!(uc.apply_update(|s| s.add(7), 0));
    assert!(!uc.apply_update(|s| s.add(7), 0));
    assert!(uc.apply_update(|s| s.remove(&7), 0));
    assert!(!uc.apply_update(|s| s.remove(&7), 0));
    assert!(!uc.apply_update(|s| s.remove(&8), 0));
}

#[test]
#[cfg_attr(miri, ignore)]
fn two_writer_contention_lands_every_key_once() {
    const KEYS: i64 = 1000;
    let uc: Arc<CxUniversal<SortedVecSet<i64>, u64>> =
        Arc::new(CxUniversal::with_max_threads(SortedVecSet::new(), 2));

    let handles: Vec<_> = (0..2)
        .map(|tid| {
            let uc = Arc::clone(&uc);
            thread::spawn(move || {
                let mut inserted = 0u64;
                for i in 0..KEYS {
                    inserted += uc.apply_update(move |s| u64::from(s.add(i)), tid);
                }
                inserted
            })
        })
        .collect();

    let inserted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    // Each key is inserted by exactly one of the two racing writers.
    assert_eq!(inserted, KEYS as u64);
    assert_eq!(uc.apply_read(|s| s.len() as u64, 0), KEYS as u64);
    for i in 0..KEYS {
        assert_eq!(uc.apply_read(move |s| u64::from(s.contains(&i)), 0), 1);
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn disjoint_writers_compose() {
    const PER_THREAD: i64 = 500;
    const THREADS: usize = 4;
    let uc = Arc::new(CxUniversalTimed::with_max_threads(
        SortedVecSet::new(),
        THREADS,
    ));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let uc = Arc::clone(&uc);
            thread::spawn(move || {
                let base = tid as i64 * PER_THREAD;
                for i in base..base + PER_THREAD {
                    assert!(uc.apply_update(move |s| s.add(i), tid));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert!(uc.apply_read(|s| s.len() == THREADS * PER_THREAD as usize, 0));
}

#[test]
fn results_propagate_values_not_just_booleans() {
    let uc: CxUniversal<SortedVecSet<i64>, i64> =
        CxUniversal::with_max_threads(SortedVecSet::new(), 2);
    for i in [5i64, 1, 9, 3] {
        uc.apply_update(move |s| i64::from(s.add(i)), 0);
    }
    let smallest = uc.apply_read(|s| s.iter().next().copied().unwrap_or(-1), 0);
    assert_eq!(smallest, 1);
    let len_after = uc.apply_update(
        |s| {
            s.remove(&1);
            s.len() as i64
        },
        0,
    );
    assert_eq!(len_after, 3);
}
