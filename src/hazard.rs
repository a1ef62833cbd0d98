//! Hazard pointers extended with ownership-reference counts.
//!
//! A plain Michael-style scheme frees a retired node as soon as no
//! thread's hazard slot references it. Here a retired mutation node may
//! still be the `head` of a replica that nobody currently holds, so the
//! scan demands three conditions before freeing:
//!
//! 1. no hazard slot of any thread equals the node,
//! 2. the node's ownership count (`owners()`) is zero,
//! 3. the node has been finalized by a pre-retired ring (retired tag on
//!    its successor word).
//!
//! Hazard publication and the retire scan are `SeqCst`; the store/scan
//! pair is where the classic algorithm needs total ordering.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::utils::CacheAligned;

/// Hazard slots per thread: tail and tail-next for the enqueue, one for
/// the submitter's own node, two for walking the list.
pub(crate) const HP_MAX_HPS: usize = 5;

pub(crate) const HP_TAIL: usize = 0;
pub(crate) const HP_TAIL_NEXT: usize = 1;
pub(crate) const HP_HEAD: usize = 2;
pub(crate) const HP_NEXT: usize = 3;
pub(crate) const HP_MY_NODE: usize = 4;

/// Types the reclaimer may scan and free.
///
/// # Safety
///
/// `is_finalized` must only become true once no logical link into the
/// node will ever be followed again, and `owners` must never under-count
/// live replica-head references. Violating either lets the scan free a
/// reachable node.
pub(crate) unsafe trait OrcRetire: Sized {
    /// Has the node passed through a pre-retired ring?
    fn is_finalized(&self) -> bool;

    /// Number of replica heads currently referencing the node.
    fn owners(&self) -> i64;

    /// Deallocate. Called exactly once, after the scan conditions hold.
    ///
    /// # Safety
    ///
    /// `ptr` must be a valid `Box`-allocated node that no thread can
    /// reach anymore.
    unsafe fn dealloc(ptr: *mut Self) {
        unsafe { drop(Box::from_raw(ptr)) }
    }
}

/// Fixed-size per-thread hazard table plus per-thread retire lists.
///
/// Hazard slots are single-writer (the owning thread slot) multi-reader.
/// Retire lists are strictly thread-local; `tid` must be the caller's
/// stable slot.
pub(crate) struct HazardPointers<T> {
    max_hps: usize,
    max_threads: usize,
    hp: Box<[CacheAligned<[AtomicPtr<T>; HP_MAX_HPS]>]>,
    retired: Box<[CacheAligned<UnsafeCell<Vec<*mut T>>>]>,
}

// SAFETY: hazard slots are atomics; each retire list is touched only by
// the thread owning its `tid` slot (and by `free_all`, which requires
// exclusive access).
unsafe impl<T> Send for HazardPointers<T> {}
unsafe impl<T> Sync for HazardPointers<T> {}

impl<T> HazardPointers<T> {
    pub(crate) fn new(max_hps: usize, max_threads: usize) -> Self {
        assert!(max_hps <= HP_MAX_HPS);
        let hp = (0..max_threads)
            .map(|_| {
                CacheAligned::new(std::array::from_fn(|_| {
                    AtomicPtr::new(std::ptr::null_mut())
                }))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let retired = (0..max_threads)
            .map(|_| CacheAligned::new(UnsafeCell::new(Vec::new())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            max_hps,
            max_threads,
            hp,
            retired,
        }
    }

    /// Null out all of the thread's hazard slots.
    pub(crate) fn clear(&self, tid: usize) {
        for ihp in 0..self.max_hps {
            self.hp[tid][ihp].store(std::ptr::null_mut(), Ordering::Release);
        }
    }

    /// Publish whatever `atom` holds until the publication is stable:
    /// read, publish, re-read, repeat. Lock-free (a racing writer can
    /// starve the loop but not wedge it).
    ///
    /// The construction's hot paths use [`Self::protect_ptr`] with their
    /// own revalidation instead (the re-read there has to compare
    /// against the previously loaded word to catch the retired tag).
    #[allow(dead_code)]
    pub(crate) fn protect(&self, index: usize, atom: &AtomicPtr<T>, tid: usize) -> *mut T {
        let mut published: *mut T = std::ptr::null_mut();
        loop {
            let ptr = atom.load(Ordering::SeqCst);
            if ptr == published {
                return ptr;
            }
            self.hp[tid][index].store(ptr, Ordering::SeqCst);
            published = ptr;
        }
    }

    /// Publish `ptr` unconditionally. Wait-free population-oblivious.
    /// Returns `ptr` back, which lets call sites protect-and-bind in one
    /// expression.
    #[inline]
    pub(crate) fn protect_ptr(&self, index: usize, ptr: *mut T, tid: usize) -> *mut T {
        self.hp[tid][index].store(ptr, Ordering::SeqCst);
        ptr
    }

    /// Publish `ptr` with release ordering only. Used where the pointer
    /// is already globally visible (the submitter's own fresh node).
    #[inline]
    pub(crate) fn protect_ptr_release(&self, index: usize, ptr: *mut T, tid: usize) -> *mut T {
        self.hp[tid][index].store(ptr, Ordering::Release);
        ptr
    }
}

impl<T: OrcRetire> HazardPointers<T> {
    /// Park `ptr` on the thread's retire list and scan the list, freeing
    /// every entry whose three conditions hold. Wait-free bounded by
    /// `max_threads * max_hps` per scanned entry.
    pub(crate) fn retire(&self, ptr: *mut T, tid: usize) {
        // SAFETY: retire lists are single-owner per tid slot.
        let list = unsafe { &mut *self.retired[tid].get() };
        list.push(ptr);
        let mut iret = 0;
        while iret < list.len() {
            let obj = list[iret];
            // SAFETY: entries are valid until this scan frees them.
            let node = unsafe { &*obj };
            if !node.is_finalized() {
                iret += 1;
                continue;
            }
            let mut can_delete = true;
            'scan: for it in 0..self.max_threads {
                for ihp in 0..self.max_hps {
                    if self.hp[it][ihp].load(Ordering::SeqCst) == obj {
                        can_delete = false;
                        break 'scan;
                    }
                }
            }
            if can_delete && node.owners() == 0 {
                list.swap_remove(iret);
                // SAFETY: finalized, unowned, unprotected — unreachable.
                unsafe { T::dealloc(obj) };
                continue;
            }
            iret += 1;
        }
    }

    /// Free every parked entry unconditionally.
    ///
    /// # Safety
    ///
    /// Caller must have exclusive access to the whole construction: no
    /// thread may be inside an operation or hold a hazard slot.
    pub(crate) unsafe fn free_all(&self) {
        for tid in 0..self.max_threads {
            // SAFETY: exclusive access per the contract above.
            let list = unsafe { &mut *self.retired[tid].get() };
            for obj in list.drain(..) {
                // SAFETY: as above; each entry was retired exactly once.
                unsafe { T::dealloc(obj) };
            }
        }
    }
}
