//! Loom model checking for the strong try-RW-lock.
//!
//! Run with:
//!
//! ```bash
//! RUSTFLAGS="--cfg loom" cargo test --test loom_rwlock --release
//! ```
//!
//! Two threads are enough to surface a data race, and keep the state
//! space tractable; the lock internals swap to Loom's atomics under
//! `--cfg loom`.

#![cfg(loom)]

use devir::StrongTryRwLock;
use loom::cell::UnsafeCell;
use loom::sync::atomic::{AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;

#[test]
fn loom_writers_mutually_exclude() {
    loom::model(|| {
        let lock = Arc::new(StrongTryRwLock::new(2));
        let holders = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|tid| {
                let lock = Arc::clone(&lock);
                let holders = Arc::clone(&holders);
                thread::spawn(move || {
                    if lock.exclusive_try_lock(tid) {
                        assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                        holders.fetch_sub(1, Ordering::SeqCst);
                        lock.exclusive_unlock();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    });
}

#[test]
fn loom_reader_excludes_writer() {
    loom::model(|| {
        let lock = Arc::new(StrongTryRwLock::new(2));
        let readers = Arc::new(AtomicUsize::new(0));

        let reader = {
            let lock = Arc::clone(&lock);
            let readers = Arc::clone(&readers);
            thread::spawn(move || {
                if lock.shared_try_lock(0) {
                    readers.fetch_add(1, Ordering::SeqCst);
                    readers.fetch_sub(1, Ordering::SeqCst);
                    lock.shared_unlock(0);
                }
            })
        };
        let writer = {
            let lock = Arc::clone(&lock);
            let readers = Arc::clone(&readers);
            thread::spawn(move || {
                if lock.exclusive_try_lock(1) {
                    assert_eq!(readers.load(Ordering::SeqCst), 0);
                    lock.exclusive_unlock();
                }
            })
        };
        reader.join().unwrap();
        writer.join().unwrap();
    });
}

#[test]
fn loom_downgrade_publishes_writer_data() {
    loom::model(|| {
        let lock = Arc::new(StrongTryRwLock::new(2));
        let data = Arc::new(UnsafeCell::new(0u64));

        // A writer that wins exclusivity mutates the plain cell, then
        // hands over through downgrade. A racing reader that gets in
        // must be ordered after the write; Loom flags any interleaving
        // where the lock fails to provide that edge.
        let writer = {
            let lock = Arc::clone(&lock);
            let data = Arc::clone(&data);
            thread::spawn(move || {
                if lock.exclusive_try_lock(0) {
                    data.with_mut(|p| unsafe { *p = 42 });
                    lock.downgrade();
                    lock.set_read_unlock();
                }
            })
        };
        let reader = {
            let lock = Arc::clone(&lock);
            let data = Arc::clone(&data);
            thread::spawn(move || {
                if lock.shared_try_lock(1) {
                    data.with(|p| {
                        let v = unsafe { *p };
                        assert!(v == 0 || v == 42);
                    });
                    lock.shared_unlock(1);
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
    });
}
