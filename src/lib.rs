//! Devir: wait-free universal construction for sequential data structures.
//!
//! Hand devir any single-threaded structure with a deep `Clone` and it
//! hands back a linearizable concurrent one: mutations are ticketed into
//! a wait-free append-only queue and applied in ticket order against a
//! pool of state replicas, readers run in place against the current
//! replica under a shared lock.
//!
//! # Key Features
//!
//! - **Wait-free bounded**: `apply_update` and `apply_read` complete in
//!   O(max_threads) of the caller's own steps, via Turn-queue helping
//! - **No spurious lock failures**: replica arbitration uses a strong
//!   try-RW-lock, so a failed acquisition always means real contention
//! - **Safe reclamation**: hazard pointers extended with per-node
//!   ownership counts free mutation nodes only when no replica head and
//!   no walker can still reach them
//! - **Two flavors**: plain, and a timed flavor that spins on a small
//!   replica set for as long as a state copy would take
//!
//! # Example
//!
//! ```rust
//! use devir::CxUniversal;
//!
//! let uc = CxUniversal::with_max_threads(0u64, 2);
//!
//! // Updates mutate a logically single-threaded view of the state.
//! assert_eq!(uc.apply_update(|n| { *n += 1; *n }, 0), 1);
//! assert_eq!(uc.apply_update(|n| { *n += 1; *n }, 0), 2);
//!
//! // Reads run in place on the current replica.
//! assert_eq!(uc.apply_read(|n| *n, 0), 2);
//! ```
//!
//! Thread slots: every caller passes a stable `tid` in
//! `[0, max_threads)`; slots index all per-thread state and must not be
//! shared by live threads.

#![warn(missing_docs)]

mod cx;
mod hazard;
mod node;
mod queue;
mod ring;
mod rwlock;
mod sync;
mod timed;
mod utils;

pub use cx::CxUniversal;
pub use rwlock::{SharedGuard, StrongTryRwLock};
pub use timed::CxUniversalTimed;

/// Default bound on simultaneous callers; sizes all per-thread arrays.
pub const DEFAULT_MAX_THREADS: usize = 128;
