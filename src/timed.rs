//! Timed flavor of the universal construction.
//!
//! Same protocol as [`crate::CxUniversal`], with two additions that cut
//! tail latency under write bursts:
//!
//! - Replica acquisition first spins on a small fixed set of replicas
//!   for as long as a state copy would take (twice the last measured
//!   copy duration), only then widening to the full `2 * max_threads`
//!   scan. Staying on a recently-published replica avoids the copy
//!   entirely.
//! - Each node records when it has been superseded (`done`), letting a
//!   submitter stuck in acquisition bail out as soon as its result is
//!   known instead of fighting for a replica it no longer needs.
//!
//! The copy-time estimate is a heuristic only: a stale read can make the
//! spin window too short or too long, never incorrect.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::cx::{Combined, MAX_READ_TRIES};
use crate::hazard::{HazardPointers, HP_HEAD, HP_MAX_HPS, HP_MY_NODE, HP_NEXT};
use crate::node::{is_retired, MutationNode};
use crate::queue::MutationQueue;
use crate::ring::PreRetiredRing;
use crate::utils::{fatal, CacheAligned};

/// Size of the replica set the fast acquisition phases spin on.
const MAX_FAST_COMBS: usize = 4;

/// Linearizable wrapper around a sequential state `S`, with copy-time
/// adaptive replica acquisition. Same API and guarantees as
/// [`crate::CxUniversal`].
pub struct CxUniversalTimed<S, R = bool> {
    max_threads: usize,
    cur_comb: CacheAligned<AtomicPtr<Combined<S, R>>>,
    combs: Box<[Combined<S, R>]>,
    queue: MutationQueue<S, R>,
    sentinel: *mut MutationNode<S, R>,
    hp: HazardPointers<MutationNode<S, R>>,
    pre_retired: Box<[CacheAligned<UnsafeCell<PreRetiredRing<S, R>>>]>,
    /// Microseconds the last full state copy took. Heuristic only.
    copy_time_us: CacheAligned<AtomicU64>,
    copies: CacheAligned<AtomicU64>,
}

// SAFETY: see the identical reasoning on `CxUniversal`.
unsafe impl<S: Send + Sync, R: Send> Send for CxUniversalTimed<S, R> {}
unsafe impl<S: Send + Sync, R: Send> Sync for CxUniversalTimed<S, R> {}

impl<S, R> CxUniversalTimed<S, R>
where
    S: Clone + Send + Sync + 'static,
    R: Copy + Default + Send + 'static,
{
    /// Wrap `inst` for up to [`crate::DEFAULT_MAX_THREADS`] concurrent
    /// callers.
    pub fn new(inst: S) -> Self {
        Self::with_max_threads(inst, crate::DEFAULT_MAX_THREADS)
    }

    /// Wrap `inst`, taking ownership.
    pub fn with_max_threads(inst: S, max_threads: usize) -> Self {
        assert!(max_threads >= 1, "max_threads must be at least 1");
        let sentinel: *mut MutationNode<S, R> =
            MutationNode::boxed(Box::new(|_: &mut S| R::default()), 0);
        let combs = (0..2 * max_threads)
            .map(|_| Combined::new(max_threads))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let inst = Box::new(inst);
        let seeded = if max_threads >= 2 { 4 } else { 2 };
        for comb in combs.iter().take(seeded).skip(1) {
            comb.obj
                .store(Box::into_raw(Box::new((*inst).clone())), Ordering::Relaxed);
            comb.head.store(sentinel, Ordering::Relaxed);
        }
        combs[0].obj.store(Box::into_raw(inst), Ordering::Relaxed);
        combs[0].head.store(sentinel, Ordering::Relaxed);
        // SAFETY: sentinel was just allocated; no other thread yet.
        unsafe { (*sentinel).orc.store(seeded as i64, Ordering::Relaxed) };

        combs[0].rw_lock.set_read_lock();
        let cur = &combs[0] as *const Combined<S, R> as *mut Combined<S, R>;

        let pre_retired = (0..max_threads)
            .map(|_| CacheAligned::new(UnsafeCell::new(PreRetiredRing::new())))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            max_threads,
            cur_comb: CacheAligned::new(AtomicPtr::new(cur)),
            queue: MutationQueue::new(sentinel, max_threads),
            sentinel,
            hp: HazardPointers::new(HP_MAX_HPS, max_threads),
            pre_retired,
            combs,
            copy_time_us: CacheAligned::new(AtomicU64::new(0)),
            copies: CacheAligned::new(AtomicU64::new(0)),
        }
    }

    /// Apply a mutating operation. Linearizable; wait-free bounded by
    /// O(max_threads).
    pub fn apply_update<F>(&self, op: F, tid: usize) -> R
    where
        F: Fn(&mut S) -> R + Send + Sync + 'static,
    {
        assert!(tid < self.max_threads, "thread slot out of range");
        let my_node = MutationNode::boxed(Box::new(op), tid);
        self.hp.protect_ptr_release(HP_MY_NODE, my_node, tid);
        self.queue.enqueue(my_node, &self.hp, tid);
        // SAFETY: my_node is hazard-protected and linked.
        let my_ticket = unsafe { (*my_node).ticket.load(Ordering::Acquire) };

        let new_comb = match self.acquire_replica(my_node, tid) {
            Some(c) => c,
            // SAFETY: my_node stays pinned by HP_MY_NODE.
            None if unsafe { (*my_node).done.load(Ordering::Acquire) } => {
                return self.finish(my_node, tid);
            }
            None => fatal("no replica available for exclusive acquisition"),
        };

        let mut mn = new_comb.head.load(Ordering::Acquire);
        // SAFETY: a non-null head is owned by this replica (orc >= 1).
        if !mn.is_null() && unsafe { (*mn).ticket.load(Ordering::Acquire) } >= my_ticket {
            new_comb.rw_lock.exclusive_unlock();
            return self.finish(my_node, tid);
        }

        let mut resourced = false;
        while mn != my_node {
            let next_raw = if mn.is_null() {
                std::ptr::null_mut()
            } else {
                // SAFETY: mn is pinned (hazard slot, orc, or source lock).
                // SeqCst: a node behind a linked node must show its
                // successor; the guarantee rides on the queue's total
                // order, so the read joins it.
                unsafe { (*mn).next.load(Ordering::SeqCst) }
            };
            if mn.is_null() || is_retired(next_raw) {
                // SAFETY: my_node pinned by HP_MY_NODE.
                let covered = unsafe { (*my_node).done.load(Ordering::Acquire) };
                if !resourced && !covered {
                    if let Some((src, src_guard)) = self.get_combined(my_ticket, tid) {
                        mn = src.head.load(Ordering::Acquire);
                        // SAFETY: exclusive on new_comb; mn pinned by the
                        // shared lock on src.
                        unsafe { new_comb.update_head(mn) };
                        self.copies.fetch_add(1, Ordering::Relaxed);
                        // SAFETY: obj is ours under the exclusive lock;
                        // the source obj is stable under the shared lock.
                        unsafe {
                            let old = new_comb.obj.load(Ordering::Relaxed);
                            if !old.is_null() {
                                drop(Box::from_raw(old));
                            }
                            let copy = self.copy_state(&*src.obj.load(Ordering::Acquire));
                            new_comb.obj.store(copy, Ordering::Release);
                        }
                        drop(src_guard);
                        resourced = true;
                        continue;
                    }
                }
                if !mn.is_null() {
                    // SAFETY: exclusive on new_comb; mn pinned as above.
                    unsafe { new_comb.update_head(mn) };
                }
                new_comb.rw_lock.exclusive_unlock();
                return self.finish(my_node, tid);
            }
            let lnext = self.hp.protect_ptr(HP_HEAD, next_raw, tid);
            // SAFETY: mn still pinned.
            if unsafe { (*mn).next.load(Ordering::SeqCst) } != next_raw {
                continue;
            }
            // SAFETY: lnext is hazard-protected and validated; obj is
            // ours under the exclusive lock.
            unsafe {
                let obj = &mut *new_comb.obj.load(Ordering::Relaxed);
                (*lnext).result.store(((*lnext).op)(obj));
            }
            self.hp.protect_ptr_release(HP_NEXT, lnext, tid);
            mn = lnext;
        }
        // SAFETY: exclusive on new_comb; mn == my_node, hazard-protected.
        unsafe { new_comb.update_head(mn) };
        new_comb.rw_lock.downgrade();

        self.publish(new_comb, mn, my_ticket, tid);
        self.finish(my_node, tid)
    }

    /// Apply a read-only operation. Linearizable; wait-free bounded.
    pub fn apply_read<F>(&self, read_op: F, tid: usize) -> R
    where
        F: Fn(&S) -> R + Send + Sync + 'static,
    {
        assert!(tid < self.max_threads, "thread slot out of range");
        for _ in 0..MAX_READ_TRIES {
            if let Some(ret) = self.try_read_current(&read_op, tid) {
                return ret;
            }
        }
        let read_op = Arc::new(read_op);
        let node_op = {
            let f = Arc::clone(&read_op);
            move |s: &mut S| f(&*s)
        };
        let my_node = MutationNode::boxed(Box::new(node_op), tid);
        self.hp.protect_ptr(HP_MY_NODE, my_node, tid);
        self.queue.enqueue(my_node, &self.hp, tid);
        for _ in 0..self.max_threads {
            if let Some(ret) = self.try_read_current(read_op.as_ref(), tid) {
                self.hp.clear(tid);
                return ret;
            }
        }
        self.finish(my_node, tid)
    }

    /// Number of threads this instance was sized for.
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Total full state copies performed so far.
    pub fn state_copies(&self) -> u64 {
        self.copies.load(Ordering::Relaxed)
    }

    /// Acquire some replica exclusively, in three phases: spin on the
    /// small fast set, hold on for up to twice the last copy duration,
    /// then scan everything. Bails out with `None` as soon as `my_node`
    /// is observed superseded.
    fn acquire_replica(
        &self,
        my_node: *mut MutationNode<S, R>,
        tid: usize,
    ) -> Option<&Combined<S, R>> {
        let first_comb = self.cur_comb.load(Ordering::Acquire);
        let max_combs = self.combs.len().min(MAX_FAST_COMBS);
        let start = self
            .combs
            .iter()
            .position(|c| std::ptr::eq(c, first_comb))
            .unwrap_or(0);

        let start_time = Instant::now();
        for _ in 0..10 {
            for j in 1..=max_combs {
                // SAFETY: my_node pinned by HP_MY_NODE.
                if unsafe { (*my_node).done.load(Ordering::Acquire) } {
                    return None;
                }
                let comb = &self.combs[(start + j) % max_combs];
                if comb.obj.load(Ordering::Acquire).is_null() {
                    // A virgin replica forces a copy; the fast phase is
                    // here to avoid copies.
                    continue;
                }
                if comb.rw_lock.exclusive_try_lock(tid) {
                    return Some(comb);
                }
            }
        }

        // Keep to the fast set while a fresh replica is likely cheaper
        // than the copy we would otherwise pay for.
        loop {
            let elapsed = start_time.elapsed().as_micros() as u64;
            let copy_time = self.copy_time_us.load(Ordering::Acquire);
            if copy_time != 0 && elapsed >= copy_time.saturating_mul(2) {
                break;
            }
            for comb in self.combs.iter().take(max_combs) {
                // SAFETY: my_node pinned by HP_MY_NODE.
                if unsafe { (*my_node).done.load(Ordering::Acquire) } {
                    return None;
                }
                if comb.rw_lock.exclusive_try_lock(tid) {
                    return Some(comb);
                }
            }
            std::thread::yield_now();
        }

        for comb in self.combs.iter() {
            // SAFETY: my_node pinned by HP_MY_NODE.
            if unsafe { (*my_node).done.load(Ordering::Acquire) } {
                return None;
            }
            if comb.rw_lock.exclusive_try_lock(tid) {
                return Some(comb);
            }
        }
        None
    }

    /// Deep-copy a state, recording how long the copy took.
    fn copy_state(&self, from: &S) -> *mut S {
        let t0 = Instant::now();
        let copy = Box::into_raw(Box::new(from.clone()));
        self.copy_time_us
            .store(t0.elapsed().as_micros() as u64, Ordering::Release);
        copy
    }

    fn try_read_current<F>(&self, read_op: &F, tid: usize) -> Option<R>
    where
        F: Fn(&S) -> R,
    {
        let lcomb_ptr = self.cur_comb.load(Ordering::Acquire);
        // SAFETY: replicas live as long as the construction.
        let lcomb = unsafe { &*lcomb_ptr };
        if !lcomb.rw_lock.shared_try_lock(tid) {
            return None;
        }
        if lcomb_ptr != self.cur_comb.load(Ordering::Acquire) {
            lcomb.rw_lock.shared_unlock(tid);
            return None;
        }
        // SAFETY: the shared lock pins obj and excludes writers.
        let ret = read_op(unsafe { &*lcomb.obj.load(Ordering::Acquire) });
        lcomb.rw_lock.shared_unlock(tid);
        Some(ret)
    }

    fn get_combined(
        &self,
        my_ticket: u64,
        tid: usize,
    ) -> Option<(&Combined<S, R>, crate::rwlock::SharedGuard<'_>)> {
        for _ in 0..self.max_threads {
            let lcomb_ptr = self.cur_comb.load(Ordering::Acquire);
            // SAFETY: replicas live as long as the construction.
            let lcomb = unsafe { &*lcomb_ptr };
            let guard = match lcomb.rw_lock.shared_try_lock_guard(tid) {
                Some(g) => g,
                None => continue,
            };
            let lhead = lcomb.head.load(Ordering::Acquire);
            // SAFETY: lhead is owned by lcomb while the shared lock holds.
            let lticket = unsafe { (*lhead).ticket.load(Ordering::Acquire) };
            if lticket < my_ticket
                && !is_retired(unsafe { (*lhead).next.load(Ordering::Acquire) })
            {
                return Some((lcomb, guard));
            }
            drop(guard);
            if lticket >= my_ticket && lcomb_ptr == self.cur_comb.load(Ordering::Acquire) {
                return None;
            }
        }
        None
    }

    fn publish(
        &self,
        new_comb: &Combined<S, R>,
        mn: *mut MutationNode<S, R>,
        my_ticket: u64,
        tid: usize,
    ) {
        let new_comb_ptr = new_comb as *const Combined<S, R> as *mut Combined<S, R>;
        for _ in 0..self.max_threads {
            let lcomb_ptr = self.cur_comb.load(Ordering::Acquire);
            // SAFETY: replicas live as long as the construction.
            let lcomb = unsafe { &*lcomb_ptr };
            if !lcomb.rw_lock.shared_try_lock(tid) {
                continue;
            }
            let lhead = lcomb.head.load(Ordering::Acquire);
            // SAFETY: lhead owned by lcomb while the shared lock holds.
            if unsafe { (*lhead).ticket.load(Ordering::Acquire) } >= my_ticket {
                lcomb.rw_lock.shared_unlock(tid);
                if lcomb_ptr != self.cur_comb.load(Ordering::Acquire) {
                    continue;
                }
                break;
            }
            if self
                .cur_comb
                .compare_exchange(lcomb_ptr, new_comb_ptr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                lcomb.rw_lock.set_read_unlock();
                let mut node = lhead;
                lcomb.rw_lock.shared_unlock(tid);
                // SAFETY: rings are single-owner per tid slot.
                let ring = unsafe { &mut *self.pre_retired[tid].get() };
                while node != mn {
                    // SAFETY: nodes ahead of mn are not yet finalized.
                    let lnext = unsafe { (*node).next.load(Ordering::SeqCst) };
                    ring.park(node, &self.hp, tid);
                    // SAFETY: parking never evicts the node just parked.
                    unsafe { (*node).done.store(true, Ordering::Release) };
                    node = lnext;
                }
                return;
            }
            lcomb.rw_lock.shared_unlock(tid);
        }
        new_comb.rw_lock.set_read_unlock();
    }

    fn finish(&self, my_node: *mut MutationNode<S, R>, tid: usize) -> R {
        // SAFETY: my_node pinned by HP_MY_NODE until the clear below.
        let ret = unsafe { (*my_node).result.load() };
        self.hp.clear(tid);
        ret
    }
}

impl<S, R> Drop for CxUniversalTimed<S, R> {
    /// Identical teardown to [`crate::CxUniversal`]: exact frees of the
    /// whole node arena, the sentinel, and every replica.
    fn drop(&mut self) {
        for tid in 0..self.max_threads {
            // SAFETY: exclusive access; rings are no longer shared.
            let ring = unsafe { &mut *self.pre_retired[tid].get() };
            ring.drain(&self.hp, tid);
        }
        let cur = self.cur_comb.load(Ordering::Relaxed);
        // SAFETY: single-threaded teardown; the chain is ours.
        unsafe {
            let cur_head = (*cur).head.load(Ordering::Relaxed);
            let mut node = (*cur_head).next.load(Ordering::Relaxed);
            while !node.is_null() {
                let next = (*node).next.load(Ordering::Relaxed);
                drop(Box::from_raw(node));
                node = next;
            }
        }
        // SAFETY: no hazard slot can be live anymore.
        unsafe { self.hp.free_all() };
        for comb in self.combs.iter() {
            let obj = comb.obj.load(Ordering::Relaxed);
            if !obj.is_null() {
                // SAFETY: each replica owns its instance exclusively.
                unsafe { drop(Box::from_raw(obj)) };
            }
        }
        // SAFETY: the sentinel is never retired (it has no predecessor).
        unsafe { drop(Box::from_raw(self.sentinel)) };
    }
}
