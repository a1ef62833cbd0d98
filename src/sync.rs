//! Atomic type aliases that swap to Loom's model-checking atomics under
//! `--cfg loom`.
//!
//! Only the lock word and reader-indicator slots go through this module;
//! the node graph uses `std` atomics directly (it is not modeled — Loom's
//! state space cannot hold the full construction, and the lock state
//! machine is the piece with the subtle interleavings).

#[cfg(loom)]
pub(crate) mod atomic {
    pub use loom::sync::atomic::{AtomicU64, Ordering};
}

#[cfg(not(loom))]
pub(crate) mod atomic {
    pub use std::sync::atomic::{AtomicU64, Ordering};
}
