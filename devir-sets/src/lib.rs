//! Sequential set containers used as wrapped states for devir.
//!
//! Single-threaded structures with a deep [`Clone`] and a uniform
//! membership API (`add` / `remove` / `contains`, each returning whether
//! the set changed or holds the key). They make no concurrency claims of
//! their own; the universal construction provides those.

pub mod hash;
pub mod linked_list;
pub mod sorted_vec;

pub use hash::HashSet;
pub use linked_list::LinkedListSet;
pub use sorted_vec::SortedVecSet;
