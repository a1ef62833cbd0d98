//! Separate-chaining hash set over foldhash.

use foldhash::fast::FixedState;
use std::hash::{BuildHasher, Hash};

const INITIAL_BUCKETS: usize = 16;
const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

/// A set of `T` in per-bucket chains, doubling the table at 3/4 load.
/// `FixedState` keeps hashing deterministic, so a clone hashes keys into
/// the same buckets as its source.
#[derive(Clone)]
pub struct HashSet<T> {
    buckets: Vec<Vec<T>>,
    len: usize,
    hasher: FixedState,
}

impl<T: Hash + Eq> HashSet<T> {
    pub fn new() -> Self {
        Self {
            buckets: (0..INITIAL_BUCKETS).map(|_| Vec::new()).collect(),
            len: 0,
            hasher: FixedState::default(),
        }
    }

    fn bucket_of(&self, key: &T) -> usize {
        (self.hasher.hash_one(key) as usize) & (self.buckets.len() - 1)
    }

    /// Insert `key`. Returns false if it was already present.
    pub fn add(&mut self, key: T) -> bool {
        if self.len * MAX_LOAD_DEN >= self.buckets.len() * MAX_LOAD_NUM {
            self.grow();
        }
        let idx = self.bucket_of(&key);
        if self.buckets[idx].iter().any(|k| *k == key) {
            return false;
        }
        self.buckets[idx].push(key);
        self.len += 1;
        true
    }

    /// Remove `key`. Returns false if it was not present.
    pub fn remove(&mut self, key: &T) -> bool {
        let idx = self.bucket_of(key);
        match self.buckets[idx].iter().position(|k| k == key) {
            Some(pos) => {
                self.buckets[idx].swap_remove(pos);
                self.len -= 1;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &T) -> bool {
        self.buckets[self.bucket_of(key)].iter().any(|k| k == key)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn grow(&mut self) {
        let doubled = self.buckets.len() * 2;
        let old = std::mem::replace(
            &mut self.buckets,
            (0..doubled).map(|_| Vec::new()).collect(),
        );
        for key in old.into_iter().flatten() {
            let idx = self.bucket_of(&key);
            self.buckets[idx].push(key);
        }
    }
}

impl<T: Hash + Eq> Default for HashSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_contains() {
        let mut set = HashSet::new();
        assert!(set.add("a"));
        assert!(!set.add("a"));
        assert!(set.contains(&"a"));
        assert!(set.remove(&"a"));
        assert!(!set.remove(&"a"));
        assert!(set.is_empty());
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut set = HashSet::new();
        for k in 0..1000 {
            assert!(set.add(k));
        }
        assert_eq!(set.len(), 1000);
        for k in 0..1000 {
            assert!(set.contains(&k));
        }
        assert!(!set.contains(&1000));
    }

    #[test]
    fn clone_hashes_identically() {
        let mut a = HashSet::new();
        for k in 0..100 {
            a.add(k);
        }
        let b = a.clone();
        for k in 0..100 {
            assert!(b.contains(&k));
        }
        assert_eq!(a.len(), b.len());
    }
}
