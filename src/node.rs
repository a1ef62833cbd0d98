//! Ticketed mutation nodes and the retired-pointer tag.
//!
//! Every submitted operation becomes one heap node in an append-only,
//! totally ticket-ordered list. A node's `next` word doubles as its
//! retirement flag: the low bit is set once the node has been evicted
//! from a pre-retired ring, after which no walker may follow it and the
//! reclaimer may free it (subject to the hazard and ownership checks).
//! The tag replaces the classic self-link idiom while keeping the
//! successor pointer readable.

use crossbeam_utils::atomic::AtomicCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU64, Ordering};

use crate::hazard::OrcRetire;

/// One-shot-allocated operation closure. Invoked once per replica that
/// absorbs the mutation, possibly concurrently, so `Fn + Sync`; freed
/// together with its node.
pub(crate) type OpFn<S, R> = Box<dyn Fn(&mut S) -> R + Send + Sync>;

const RETIRED_TAG: usize = 1;

/// Mark a successor word as belonging to a fully retired node.
#[inline]
pub(crate) fn tag_retired<T>(ptr: *mut T) -> *mut T {
    (ptr as usize | RETIRED_TAG) as *mut T
}

/// Does the successor word carry the retired tag?
#[inline]
pub(crate) fn is_retired<T>(ptr: *mut T) -> bool {
    (ptr as usize) & RETIRED_TAG != 0
}

/// Mutation list node.
///
/// `ticket` is zero while unlinked and is assigned by the wait-free
/// enqueuer the moment the node's predecessor link wins its CAS. `orc`
/// counts the replica `head` pointers currently referencing the node;
/// the reclaimer refuses to free a node until it reaches zero.
pub(crate) struct MutationNode<S, R> {
    pub(crate) op: OpFn<S, R>,
    /// Write-raced by every applier that walks past this node; the cell
    /// keeps the races benign (all writers store the same op result for
    /// the same state prefix).
    pub(crate) result: AtomicCell<R>,
    pub(crate) next: AtomicPtr<MutationNode<S, R>>,
    pub(crate) ticket: AtomicU64,
    pub(crate) orc: AtomicI64,
    /// Set by the publisher that supersedes this node as a head; the
    /// timed variant uses it to cut replica acquisition short.
    pub(crate) done: AtomicBool,
    pub(crate) enq_tid: usize,
}

impl<S, R: Default> MutationNode<S, R> {
    /// Allocate a node on the heap. Ownership transfers to the list; the
    /// reclaimer is the sole deleter.
    pub(crate) fn boxed(op: OpFn<S, R>, enq_tid: usize) -> *mut Self {
        Box::into_raw(Box::new(Self {
            op,
            result: AtomicCell::new(R::default()),
            next: AtomicPtr::new(std::ptr::null_mut()),
            ticket: AtomicU64::new(0),
            orc: AtomicI64::new(0),
            done: AtomicBool::new(false),
            enq_tid,
        }))
    }
}

// SAFETY: the successor tag and the ownership count are exactly what the
// reclaimer's retire scan checks; both are maintained with release
// stores by the ring eviction and head updates.
unsafe impl<S, R> OrcRetire for MutationNode<S, R> {
    #[inline]
    fn is_finalized(&self) -> bool {
        is_retired(self.next.load(Ordering::Acquire))
    }

    #[inline]
    fn owners(&self) -> i64 {
        self.orc.load(Ordering::Acquire)
    }
}
