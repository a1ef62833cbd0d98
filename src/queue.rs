//! Wait-free ticketed mutation queue.
//!
//! Turn-queue enqueue protocol, with a monotonically incrementing ticket
//! stamped on each node as it is linked. There is no dequeue: the list
//! is append-only and consumed in place by appliers walking it.
//!
//! Steps when uncontended:
//!
//! 1. Announce the node in `announce[tid]`.
//! 2. CAS it into `tail.next`.
//! 3. Advance `tail`.
//! 4. Clear the announcement.
//!
//! Every thread in the loop helps whichever announcement comes next in
//! round-robin order after the current tail's owner, so an enqueue
//! completes in O(max_threads) of the caller's own steps no matter what
//! the other threads do. The linearization point is the CAS that links
//! the predecessor's `next` to the node.

use crate::hazard::{HazardPointers, HP_TAIL, HP_TAIL_NEXT};
use crate::node::MutationNode;
use crate::utils::CacheAligned;
use std::sync::atomic::{AtomicPtr, Ordering};

pub(crate) struct MutationQueue<S, R> {
    tail: CacheAligned<AtomicPtr<MutationNode<S, R>>>,
    announce: Box<[CacheAligned<AtomicPtr<MutationNode<S, R>>>]>,
    max_threads: usize,
}

impl<S, R> MutationQueue<S, R> {
    /// The queue starts anchored at the caller-provided sentinel, which
    /// stays the list head forever (ticket 0).
    pub(crate) fn new(sentinel: *mut MutationNode<S, R>, max_threads: usize) -> Self {
        let announce = (0..max_threads)
            .map(|_| CacheAligned::new(AtomicPtr::new(std::ptr::null_mut())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            tail: CacheAligned::new(AtomicPtr::new(sentinel)),
            announce,
            max_threads,
        }
    }

    #[cfg(test)]
    pub(crate) fn tail(&self) -> *mut MutationNode<S, R> {
        self.tail.load(Ordering::SeqCst)
    }

    /// Link `my_node` at the tail. On return the node is linked and its
    /// ticket is assigned and visible to the caller.
    ///
    /// The announce slots, tail, and link CASes are all `SeqCst`: the
    /// walkers' safety argument (a node behind a linked node always has
    /// a visible successor) leans on the single total order over these
    /// operations, not just on pairwise release/acquire edges.
    pub(crate) fn enqueue(
        &self,
        my_node: *mut MutationNode<S, R>,
        hp: &HazardPointers<MutationNode<S, R>>,
        tid: usize,
    ) {
        self.announce[tid].store(my_node, Ordering::SeqCst);
        for _ in 0..self.max_threads {
            if self.announce[tid].load(Ordering::SeqCst).is_null() {
                return; // Some thread did all the steps
            }
            let ltail = hp.protect_ptr(HP_TAIL, self.tail.load(Ordering::SeqCst), tid);
            if ltail != self.tail.load(Ordering::SeqCst) {
                // Tail moved under us. If it moves max_threads times,
                // every announcement ahead of ours was served, ours
                // included.
                continue;
            }
            // SAFETY: ltail is hazard-protected and was the tail, so it
            // is linked and cannot be reclaimed while protected.
            let tail_owner = unsafe { (*ltail).enq_tid };
            if self.announce[tail_owner].load(Ordering::SeqCst) == ltail {
                // Help the tail's owner with step 4.
                let _ = self.announce[tail_owner].compare_exchange(
                    ltail,
                    std::ptr::null_mut(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
            for j in 1..=self.max_threads {
                // Help the next announcer in round-robin order do step 2.
                let to_help =
                    self.announce[(j + tail_owner) % self.max_threads].load(Ordering::SeqCst);
                if to_help.is_null() {
                    continue;
                }
                // SAFETY: ltail protected as above.
                let _ = unsafe {
                    (*ltail).next.compare_exchange(
                        std::ptr::null_mut(),
                        to_help,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                };
                break;
            }
            // SAFETY: ltail protected as above.
            let lnext = unsafe { (*ltail).next.load(Ordering::SeqCst) };
            if !lnext.is_null() {
                hp.protect_ptr(HP_TAIL_NEXT, lnext, tid);
                if ltail != self.tail.load(Ordering::SeqCst) {
                    continue;
                }
                // The linked node is one ticket past its predecessor.
                // Relaxed: publication rides on the tail CAS below.
                // SAFETY: lnext hazard-protected and re-validated.
                unsafe {
                    let t = (*ltail).ticket.load(Ordering::Relaxed);
                    (*lnext).ticket.store(t + 1, Ordering::Relaxed);
                }
                let _ =
                    self.tail
                        .compare_exchange(ltail, lnext, Ordering::SeqCst, Ordering::SeqCst);
            }
        }
        // Step 4, in case nobody else got to it.
        self.announce[tid].store(std::ptr::null_mut(), Ordering::SeqCst);
    }
}
