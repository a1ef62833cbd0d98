//! Strong try-RW-lock with a per-thread reader indicator.
//!
//! The lock is built so that `shared_try_lock` and `exclusive_try_lock`
//! never fail spuriously: a `false` from either means another holder was
//! genuinely in the way. The universal construct depends on this — a
//! `false` is its signal to move on to another replica, and a spurious
//! one would waste a full state copy.
//!
//! One atomic word packs a 62-bit sequence number with a 2-bit writer
//! state:
//!
//! - `NOLOCK`: no writer anywhere near the lock
//! - `HLOCK`:  a writer has arrived and is racing readers for the claim
//! - `WLOCK`:  a writer holds the lock exclusively
//! - `RLOCK`:  a writer is backing off, admitting readers only
//!
//! Transitions:
//!
//! - `seq | NOLOCK` -> `seq+1 | HLOCK`  writer arrival (CAS)
//! - `seq | HLOCK`  -> `seq | WLOCK`    writer claims exclusivity (CAS, RI empty)
//! - `seq | HLOCK`  -> `seq | NOLOCK`   a reader cancels the claim (CAS)
//! - `seq | WLOCK`  -> `seq | RLOCK`    downgrade (plain store)
//! - `seq | RLOCK`  -> `seq | NOLOCK`   full release (plain store)
//!
//! Everything here is `SeqCst`. The reader-indicator/lock-state interplay
//! is the one place in the crate where weakening the orderings is known
//! to break the protocol (a relaxed depart lets a writer observe an empty
//! indicator while a reader still considers itself arrived).

use crate::sync::atomic::{AtomicU64, Ordering};
use crate::utils::CacheAligned;

const NOLOCK: u64 = 0;
const HLOCK: u64 = 1;
const RLOCK: u64 = 2;
const WLOCK: u64 = 3;

#[inline]
const fn pack(seq: u64, state: u64) -> u64 {
    (seq << 2) | state
}

#[inline]
const fn state_of(word: u64) -> u64 {
    word & 3
}

#[inline]
const fn seq_of(word: u64) -> u64 {
    word >> 2
}

const NOT_READING: u64 = 0;
const READING: u64 = 1;

/// Per-thread reader indicator: one padded slot per thread slot.
///
/// A slot holds `NOT_READING`, `READING`, or `READING + 1`. The last
/// state is written by a downgrading writer to invalidate a reader's
/// in-flight rollback: once bumped, the reader's arrival stands and the
/// reader owns shared access.
struct ReadIndicator {
    states: Box<[CacheAligned<AtomicU64>]>,
}

impl ReadIndicator {
    fn new(max_threads: usize) -> Self {
        let states = (0..max_threads)
            .map(|_| CacheAligned::new(AtomicU64::new(NOT_READING)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { states }
    }

    #[inline]
    fn arrive(&self, tid: usize) {
        self.states[tid].store(READING, Ordering::SeqCst);
    }

    #[inline]
    fn depart(&self, tid: usize) {
        self.states[tid].store(NOT_READING, Ordering::SeqCst);
    }

    /// Attempt to undo an `arrive`. Returns true if the rollback took
    /// effect; false means a writer bumped the slot to `READING + 1`
    /// first, so the arrival is still valid and visible.
    #[inline]
    fn rollback_arrive(&self, tid: usize) -> bool {
        self.states[tid].fetch_sub(1, Ordering::SeqCst) == READING
    }

    /// Bump every in-flight `READING` slot to `READING + 1` so that the
    /// owning readers cannot roll their arrival back.
    fn abort_rollback(&self) {
        for slot in self.states.iter() {
            if slot.load(Ordering::SeqCst) != READING {
                continue;
            }
            let _ = slot.compare_exchange(
                READING,
                READING + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }

    fn is_empty(&self) -> bool {
        for slot in self.states.iter() {
            if slot.load(Ordering::SeqCst) != NOT_READING {
                return false;
            }
        }
        true
    }
}

/// Reader-preference try-RW-lock with intermediate writer states.
///
/// `tid` arguments index the reader indicator; each caller must use a
/// stable slot in `[0, max_threads)` and no two live threads may share
/// one.
pub struct StrongTryRwLock {
    ri: ReadIndicator,
    wstate: CacheAligned<AtomicU64>,
}

impl StrongTryRwLock {
    /// A lock sized for `max_threads` reader slots.
    pub fn new(max_threads: usize) -> Self {
        Self {
            ri: ReadIndicator::new(max_threads),
            wstate: CacheAligned::new(AtomicU64::new(pack(0, NOLOCK))),
        }
    }

    /// Try to acquire in shared mode. Never fails spuriously: `false`
    /// means a writer holds or won the lock.
    pub fn shared_try_lock(&self, tid: usize) -> bool {
        if state_of(self.wstate.load(Ordering::SeqCst)) == WLOCK {
            return false;
        }
        self.ri.arrive(tid);
        let mut ws = self.wstate.load(Ordering::SeqCst);
        if state_of(ws) == HLOCK {
            // A writer has arrived but not yet claimed: cancel its claim.
            if self
                .wstate
                .compare_exchange(
                    ws,
                    pack(seq_of(ws), NOLOCK),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return true;
            }
            ws = self.wstate.load(Ordering::SeqCst);
        }
        // If the writer won, try to take the arrival back. A failed
        // rollback means the writer downgraded and bumped our slot, so
        // the arrival stands and we hold the lock after all.
        state_of(ws) != WLOCK || !self.ri.rollback_arrive(tid)
    }

    /// Acquire in shared mode, spin-yielding on contention.
    pub fn shared_lock(&self, tid: usize) {
        let backoff = crossbeam_utils::Backoff::new();
        while !self.shared_try_lock(tid) {
            backoff.snooze();
        }
    }

    /// Release a shared hold.
    pub fn shared_unlock(&self, tid: usize) {
        self.ri.depart(tid);
    }

    /// Try to acquire in exclusive mode. Never fails spuriously: `false`
    /// means a reader or another writer was present at some point during
    /// the attempt. The slot argument mirrors the shared side; writers
    /// are arbitrated purely through the lock word.
    pub fn exclusive_try_lock(&self, _tid: usize) -> bool {
        let ws = self.wstate.load(Ordering::SeqCst);
        if state_of(ws) == WLOCK || state_of(ws) == RLOCK {
            return false;
        }
        if !self.ri.is_empty() {
            return false;
        }
        if state_of(ws) == HLOCK {
            // Another writer already arrived; jump ahead of it only if
            // the word has not moved since we looked.
            if ws != self.wstate.load(Ordering::SeqCst) {
                return false;
            }
            return self
                .wstate
                .compare_exchange(
                    ws,
                    pack(seq_of(ws), WLOCK),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok();
        }
        let next = pack(seq_of(ws) + 1, HLOCK);
        let _ = self
            .wstate
            .compare_exchange(ws, next, Ordering::SeqCst, Ordering::SeqCst);
        if !self.ri.is_empty() {
            return false;
        }
        if self.wstate.load(Ordering::SeqCst) != next {
            return false;
        }
        self.wstate
            .compare_exchange(
                next,
                pack(seq_of(ws) + 1, WLOCK),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Acquire in exclusive mode, spin-yielding on contention.
    pub fn exclusive_lock(&self, tid: usize) {
        let backoff = crossbeam_utils::Backoff::new();
        while !self.exclusive_try_lock(tid) {
            backoff.snooze();
        }
    }

    /// Release an exclusive hold entirely: downgrade through `RLOCK`
    /// (invalidating in-flight reader rollbacks) and then open the lock.
    pub fn exclusive_unlock(&self) {
        let ws = self.wstate.load(Ordering::Relaxed);
        self.wstate.store(pack(seq_of(ws), RLOCK), Ordering::SeqCst);
        self.ri.abort_rollback();
        self.wstate
            .store(pack(seq_of(ws), NOLOCK), Ordering::SeqCst);
    }

    /// Downgrade from exclusive to reader-only admission. Readers that
    /// were mid-acquisition are committed rather than rolled back.
    pub fn downgrade(&self) {
        let ws = self.wstate.load(Ordering::Relaxed);
        self.wstate.store(pack(seq_of(ws), RLOCK), Ordering::SeqCst);
        self.ri.abort_rollback();
    }

    /// Force the word to `RLOCK` without having held the lock. Only
    /// meaningful while the caller is the sole owner (construction, or
    /// holding the replica it guards exclusively).
    pub fn set_read_lock(&self) {
        let ws = self.wstate.load(Ordering::Relaxed);
        self.wstate.store(pack(seq_of(ws), RLOCK), Ordering::SeqCst);
    }

    /// Undo `set_read_lock`: open the word to writers again.
    pub fn set_read_unlock(&self) {
        let ws = self.wstate.load(Ordering::Relaxed);
        self.wstate
            .store(pack(seq_of(ws), NOLOCK), Ordering::SeqCst);
    }

    /// Try to acquire in shared mode, returning an RAII guard that
    /// departs the reader indicator on drop.
    pub fn shared_try_lock_guard(&self, tid: usize) -> Option<SharedGuard<'_>> {
        if self.shared_try_lock(tid) {
            Some(SharedGuard { lock: self, tid })
        } else {
            None
        }
    }
}

/// RAII shared hold. Releases on drop, on every exit path.
pub struct SharedGuard<'a> {
    lock: &'a StrongTryRwLock,
    tid: usize,
}

impl Drop for SharedGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.shared_unlock(self.tid);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn exclusive_excludes_shared() {
        let lock = StrongTryRwLock::new(4);
        assert!(lock.exclusive_try_lock(0));
        assert!(!lock.shared_try_lock(1));
        assert!(!lock.exclusive_try_lock(1));
        lock.exclusive_unlock();
        assert!(lock.shared_try_lock(1));
        lock.shared_unlock(1);
    }

    #[test]
    fn shared_excludes_exclusive_only() {
        let lock = StrongTryRwLock::new(4);
        assert!(lock.shared_try_lock(0));
        assert!(lock.shared_try_lock(1));
        assert!(!lock.exclusive_try_lock(2));
        lock.shared_unlock(0);
        assert!(!lock.exclusive_try_lock(2));
        lock.shared_unlock(1);
        assert!(lock.exclusive_try_lock(2));
        lock.exclusive_unlock();
    }

    #[test]
    fn downgrade_admits_readers_blocks_writers() {
        let lock = StrongTryRwLock::new(4);
        assert!(lock.exclusive_try_lock(0));
        lock.downgrade();
        assert!(lock.shared_try_lock(1));
        assert!(!lock.exclusive_try_lock(2));
        lock.shared_unlock(1);
        lock.set_read_unlock();
        assert!(lock.exclusive_try_lock(2));
        lock.exclusive_unlock();
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = StrongTryRwLock::new(2);
        {
            let _g = lock.shared_try_lock_guard(0).unwrap();
            assert!(!lock.exclusive_try_lock(1));
        }
        assert!(lock.exclusive_try_lock(1));
        lock.exclusive_unlock();
    }

    #[test]
    fn sequence_advances_per_writer_arrival() {
        let lock = StrongTryRwLock::new(2);
        let before = seq_of(lock.wstate.load(Ordering::SeqCst));
        assert!(lock.exclusive_try_lock(0));
        lock.exclusive_unlock();
        let after = seq_of(lock.wstate.load(Ordering::SeqCst));
        assert_eq!(after, before + 1);
    }
}
