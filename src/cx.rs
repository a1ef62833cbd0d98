//! Wait-free universal construction.
//!
//! Wraps a sequential state `S` and makes it linearizable: updates are
//! ticketed into the wait-free mutation queue, then some exclusive
//! holder of a state replica applies every queued mutation up to the
//! caller's ticket and publishes the replica as current. Readers
//! shared-lock the current replica and run in place, falling back to the
//! mutation queue when repeatedly blocked so that they inherit its
//! wait-free bound.
//!
//! `2 * max_threads` replicas exist so that an exclusive acquisition can
//! never exhaust them: at most `max_threads` are exclusively held and
//! one is pinned as current.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::hazard::{HazardPointers, HP_HEAD, HP_MAX_HPS, HP_MY_NODE, HP_NEXT};
use crate::node::{is_retired, MutationNode};
use crate::queue::MutationQueue;
use crate::ring::PreRetiredRing;
use crate::rwlock::StrongTryRwLock;
use crate::utils::{fatal, CacheAligned};

/// Reader retries on the current replica before a read is re-submitted
/// through the mutation queue.
pub(crate) const MAX_READ_TRIES: usize = 10;

/// One state replica: the sequential instance, the newest mutation
/// applied to it, and the lock arbitrating access. `head` and `obj` are
/// written only under the exclusive lock and read under the shared lock.
pub(crate) struct Combined<S, R> {
    pub(crate) head: AtomicPtr<MutationNode<S, R>>,
    pub(crate) obj: AtomicPtr<S>,
    pub(crate) rw_lock: StrongTryRwLock,
}

impl<S, R> Combined<S, R> {
    pub(crate) fn new(max_threads: usize) -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
            obj: AtomicPtr::new(std::ptr::null_mut()),
            rw_lock: StrongTryRwLock::new(max_threads),
        }
    }

    /// Swing `head` to `mn`, moving the ownership count with it.
    ///
    /// # Safety
    ///
    /// Caller holds this replica's exclusive lock, and `mn` is pinned
    /// (hazard slot or a shared lock on the replica whose head it is).
    pub(crate) unsafe fn update_head(&self, mn: *mut MutationNode<S, R>) {
        unsafe {
            (*mn).orc.fetch_add(1, Ordering::AcqRel);
            let old = self.head.load(Ordering::Relaxed);
            if !old.is_null() {
                let prev = (*old).orc.fetch_sub(1, Ordering::AcqRel);
                debug_assert!(prev > 0, "replica head ownership count underflow");
            }
            self.head.store(mn, Ordering::Release);
        }
    }
}

/// Linearizable wrapper around a sequential state `S`.
///
/// `R` is the operation result type, constrained to what one atomic
/// result cell can carry. Thread slots (`tid`) index every per-thread
/// array; each caller must use a stable slot in `[0, max_threads)` and
/// no two live threads may share one.
pub struct CxUniversal<S, R = bool> {
    max_threads: usize,
    cur_comb: CacheAligned<AtomicPtr<Combined<S, R>>>,
    combs: Box<[Combined<S, R>]>,
    queue: MutationQueue<S, R>,
    sentinel: *mut MutationNode<S, R>,
    hp: HazardPointers<MutationNode<S, R>>,
    pre_retired: Box<[CacheAligned<UnsafeCell<PreRetiredRing<S, R>>>]>,
}

// SAFETY: all shared state is atomics or lock-guarded; per-thread arrays
// are indexed by the caller's unique slot. `S` crosses threads inside
// replicas and `R` inside result cells.
unsafe impl<S: Send + Sync, R: Send> Send for CxUniversal<S, R> {}
unsafe impl<S: Send + Sync, R: Send> Sync for CxUniversal<S, R> {}

impl<S, R> CxUniversal<S, R>
where
    S: Clone + Send + Sync + 'static,
    R: Copy + Default + Send + 'static,
{
    /// Wrap `inst` for up to [`crate::DEFAULT_MAX_THREADS`] concurrent
    /// callers.
    pub fn new(inst: S) -> Self {
        Self::with_max_threads(inst, crate::DEFAULT_MAX_THREADS)
    }

    /// Wrap `inst`, taking ownership. `max_threads` bounds the number of
    /// simultaneous callers and sizes every per-thread array.
    pub fn with_max_threads(inst: S, max_threads: usize) -> Self {
        assert!(max_threads >= 1, "max_threads must be at least 1");
        let sentinel: *mut MutationNode<S, R> =
            MutationNode::boxed(Box::new(|_: &mut S| R::default()), 0);
        let combs = (0..2 * max_threads)
            .map(|_| Combined::new(max_threads))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        // Replica 0 takes the caller's instance; a few more start as
        // copies so early writers find a seeded replica. The rest stay
        // empty and materialize on first exclusive acquisition.
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

        // The current replica sits in the reader-only lock state until
        // the publisher that supersedes it releases it.
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
        }
    }

    /// Apply a mutating operation, returning its result as if the state
    /// were single-threaded. Linearizable; wait-free bounded by
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

        let mut new_comb = None;
        for comb in self.combs.iter() {
            if comb.rw_lock.exclusive_try_lock(tid) {
                new_comb = Some(comb);
                break;
            }
        }
        let new_comb = match new_comb {
            Some(c) => c,
            None => fatal("no replica available for exclusive acquisition"),
        };

        let mut mn = new_comb.head.load(Ordering::Acquire);
        // SAFETY: a non-null head is owned by this replica (orc >= 1).
        if !mn.is_null() && unsafe { (*mn).ticket.load(Ordering::Acquire) } >= my_ticket {
            // Another thread already applied past our ticket here.
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
                // The head chain under us went stale: this replica fell
                // so far behind that its trail was already finalized.
                // Re-source once from a live replica; give up after that.
                if !resourced {
                    if let Some((src, src_guard)) = self.get_combined(my_ticket, tid) {
                        mn = src.head.load(Ordering::Acquire);
                        // SAFETY: exclusive on new_comb; mn pinned by the
                        // shared lock on src.
                        unsafe { new_comb.update_head(mn) };
                        // Absorb the source snapshot: replace our stale
                        // instance with a fresh deep copy.
                        // SAFETY: obj is ours under the exclusive lock;
                        // the source obj is stable under the shared lock.
                        unsafe {
                            let old = new_comb.obj.load(Ordering::Relaxed);
                            if !old.is_null() {
                                drop(Box::from_raw(old));
                            }
                            let copy = (*src.obj.load(Ordering::Acquire)).clone();
                            new_comb
                                .obj
                                .store(Box::into_raw(Box::new(copy)), Ordering::Release);
                        }
                        drop(src_guard);
                        resourced = true;
                        continue;
                    }
                }
                // No replica behind our ticket exists anymore: our
                // mutation is covered and its result is in the cell.
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
                // The link was finalized between the load and the
                // publication; the hazard may be too late to hold.
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
        // Repeatedly blocked: re-submit the read as a mutation so it
        // rides the queue's wait-free guarantee. The op only shares the
        // state immutably.
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

    /// One shared-locked read attempt against the current replica.
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
        // SAFETY: the shared lock pins obj and excludes writers, so the
        // instance reflects a full prefix of applied mutations.
        let ret = read_op(unsafe { &*lcomb.obj.load(Ordering::Acquire) });
        lcomb.rw_lock.shared_unlock(tid);
        Some(ret)
    }

    /// Find a shared-lockable replica whose head is still behind
    /// `my_ticket`, to source a copy from. `None` means the ticket is
    /// already covered by the current replica (or every candidate was
    /// contended away for `max_threads` rounds, which implies coverage).
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
            // A covering ticket on the still-current replica is proof
            // that our mutation was applied.
            if lticket >= my_ticket && lcomb_ptr == self.cur_comb.load(Ordering::Acquire) {
                return None;
            }
        }
        None
    }

    /// Swing `cur_comb` to `new_comb` and pre-retire the superseded head
    /// chain. `new_comb` holds the reader-only lock state on entry; on
    /// return it is either published (still reader-only) or fully
    /// released.
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
                // Someone else published coverage of our ticket.
                break;
            }
            if self
                .cur_comb
                .compare_exchange(lcomb_ptr, new_comb_ptr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // The superseded replica opens to writers again. Our
                // shared arrival still blocks exclusive acquisition, so
                // lhead stays pinned until we let go below.
                lcomb.rw_lock.set_read_unlock();
                let mut node = lhead;
                lcomb.rw_lock.shared_unlock(tid);
                // SAFETY: rings are single-owner per tid slot.
                let ring = unsafe { &mut *self.pre_retired[tid].get() };
                while node != mn {
                    // SAFETY: nodes ahead of mn are not yet finalized;
                    // their links are intact until this ring evicts them.
                    let lnext = unsafe { (*node).next.load(Ordering::SeqCst) };
                    ring.park(node, &self.hp, tid);
                    node = lnext;
                }
                return;
            }
            lcomb.rw_lock.shared_unlock(tid);
        }
        new_comb.rw_lock.set_read_unlock();
    }

    /// Read the caller's result cell and drop the hazard slots.
    fn finish(&self, my_node: *mut MutationNode<S, R>, tid: usize) -> R {
        // SAFETY: my_node is pinned by hazard slot HP_MY_NODE until the
        // clear below, and its cell was written by whichever applier
        // walked past it.
        let ret = unsafe { (*my_node).result.load() };
        self.hp.clear(tid);
        ret
    }
}

impl<S, R> Drop for CxUniversal<S, R> {
    /// Tear down the whole arena. Must not run while any thread is
    /// inside an operation; `&mut self` guarantees that for safe code.
    ///
    /// Frees exactly `tail.ticket` mutation nodes plus the sentinel,
    /// every replica, and every surviving state instance.
    fn drop(&mut self) {
        // Evict every parked node so each superseded node's successor
        // reaches a retire list. After this, the retire lists hold every
        // node from ticket 1 through the current head, exactly once.
        for tid in 0..self.max_threads {
            // SAFETY: exclusive access; rings are no longer shared.
            let ring = unsafe { &mut *self.pre_retired[tid].get() };
            ring.drain(&self.hp, tid);
        }

        // The segment after the current head was never superseded: its
        // links are intact and none of it is parked or retired. Free it
        // by walking to the tail.
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
