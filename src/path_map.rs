//! Thread-safe ordered map from normalized path to node record, with set
//! algebra and prefix re-key/prune, grounded in the reentrant
//! `ThreadSafeDict` the Python original built over `threading.RLock`.

use std::cell::UnsafeCell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

pub const ROOT: &str = ".";

/// True iff `candidate` equals `ancestor` or is nested under it
/// (`ancestor/...`). Free function so callers outside `PathMap<V>` (event
/// coalescing, mainly) don't need a throwaway type parameter to reach it.
pub fn is_self_or_descendant(ancestor: &str, candidate: &str) -> bool {
    if ancestor == ROOT {
        return true;
    }
    candidate == ancestor || candidate.starts_with(&format!("{ancestor}/"))
}

/// Reentrant mutex: the same thread may acquire the lock again without
/// deadlocking, matching Python's `RLock` semantics that `ThreadSafeDict`
/// depends on for its `with self._lock:` blocks.
struct ReentrantMutex<T> {
    state: Mutex<LockState>,
    cond: Condvar,
    data: UnsafeCell<T>,
}

struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

unsafe impl<T: Send> Send for ReentrantMutex<T> {}
unsafe impl<T: Send> Sync for ReentrantMutex<T> {}

impl<T> ReentrantMutex<T> {
    fn new(data: T) -> Self {
        Self {
            state: Mutex::new(LockState { owner: None, depth: 0 }),
            cond: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    fn lock(&self) -> ReentrantMutexGuard<'_, T> {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        loop {
            match state.owner {
                Some(owner) if owner == me => {
                    state.depth += 1;
                    break;
                }
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    break;
                }
                _ => {
                    state = self.cond.wait(state).unwrap();
                }
            }
        }
        drop(state);
        ReentrantMutexGuard { mutex: self }
    }
}

struct ReentrantMutexGuard<'a, T> {
    mutex: &'a ReentrantMutex<T>,
}

impl<'a, T> Drop for ReentrantMutexGuard<'a, T> {
    fn drop(&mut self) {
        let mut state = self.mutex.state.lock().unwrap();
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.mutex.cond.notify_one();
        }
    }
}

impl<'a, T> std::ops::Deref for ReentrantMutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> std::ops::DerefMut for ReentrantMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

/// Public handle returned by [`PathMap::lock`] for multi-step atomicity;
/// derefs to the underlying map while held.
pub struct PathMapGuard<'a, V> {
    inner: ReentrantMutexGuard<'a, BTreeMap<String, V>>,
}

impl<'a, V> std::ops::Deref for PathMapGuard<'a, V> {
    type Target = BTreeMap<String, V>;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, V> std::ops::DerefMut for PathMapGuard<'a, V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Thread-safe ordered path → value map.
pub struct PathMap<V> {
    map: ReentrantMutex<BTreeMap<String, V>>,
    len_hint: AtomicUsize,
}

impl<V: Clone> Default for PathMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> PathMap<V> {
    pub fn new() -> Self {
        Self {
            map: ReentrantMutex::new(BTreeMap::new()),
            len_hint: AtomicUsize::new(0),
        }
    }

    /// Acquire the whole map for multi-step atomicity. Reentrant: a thread
    /// already holding the lock (directly or via another `PathMap` method)
    /// may call this again without deadlocking.
    pub fn lock(&self) -> PathMapGuard<'_, V> {
        PathMapGuard { inner: self.map.lock() }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.map.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.lock().contains_key(key)
    }

    pub fn put(&self, key: impl Into<String>, value: V) {
        let mut g = self.map.lock();
        g.insert(key.into(), value);
        self.len_hint.store(g.len(), Ordering::Relaxed);
    }

    pub fn pop(&self, key: &str) -> Option<V> {
        let mut g = self.map.lock();
        let v = g.remove(key);
        self.len_hint.store(g.len(), Ordering::Relaxed);
        v
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length without acquiring the lock: best-effort, for diagnostics only.
    pub fn unsafe_len(&self) -> usize {
        self.len_hint.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        let mut g = self.map.lock();
        g.clear();
        self.len_hint.store(0, Ordering::Relaxed);
    }

    /// Snapshot of all keys, in sorted order. Safe to iterate without
    /// holding the lock; does not reflect later mutations.
    pub fn keys(&self) -> Vec<String> {
        self.map.lock().keys().cloned().collect()
    }

    /// Snapshot of all (key, value) pairs.
    pub fn items(&self) -> Vec<(String, V)> {
        self.map.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn key_set(&self) -> BTreeSet<String> {
        self.map.lock().keys().cloned().collect()
    }

    pub fn difference(&self, other: impl IntoIterator<Item = String>) -> BTreeSet<String> {
        let mine = self.key_set();
        let theirs: BTreeSet<String> = other.into_iter().collect();
        mine.difference(&theirs).cloned().collect()
    }

    pub fn intersection(&self, other: impl IntoIterator<Item = String>) -> BTreeSet<String> {
        let mine = self.key_set();
        let theirs: BTreeSet<String> = other.into_iter().collect();
        mine.intersection(&theirs).cloned().collect()
    }

    pub fn symmetric_difference(&self, other: impl IntoIterator<Item = String>) -> BTreeSet<String> {
        let mine = self.key_set();
        let theirs: BTreeSet<String> = other.into_iter().collect();
        mine.symmetric_difference(&theirs).cloned().collect()
    }

    pub fn union(&self, other: impl IntoIterator<Item = String>) -> BTreeSet<String> {
        let mine = self.key_set();
        let theirs: BTreeSet<String> = other.into_iter().collect();
        mine.union(&theirs).cloned().collect()
    }

    /// True iff `candidate` equals `ancestor` or is nested under it
    /// (`ancestor/...`).
    pub fn is_self_or_descendant(ancestor: &str, candidate: &str) -> bool {
        is_self_or_descendant(ancestor, candidate)
    }

    /// Replace every key equal to or descending from `old` with the same
    /// suffix rooted at `new`, preserving values.
    pub fn re_key(&self, old: &str, new: &str) {
        let mut g = self.map.lock();
        let affected: Vec<String> = g
            .keys()
            .filter(|k| Self::is_self_or_descendant(old, k))
            .cloned()
            .collect();
        for key in affected {
            if let Some(value) = g.remove(&key) {
                let rekeyed = if key == old {
                    new.to_string()
                } else {
                    let rel = &key[old.len() + 1..];
                    format!("{new}/{rel}")
                };
                g.insert(rekeyed, value);
            }
        }
        self.len_hint.store(g.len(), Ordering::Relaxed);
    }

    /// Remove every key equal to or descending from `path` (`inclusive`),
    /// or only its strict descendants when `inclusive` is false.
    pub fn prune(&self, path: &str, inclusive: bool) -> Vec<String> {
        let mut g = self.map.lock();
        let doomed: Vec<String> = g
            .keys()
            .filter(|k| {
                if *k == path {
                    inclusive
                } else {
                    Self::is_self_or_descendant(path, k)
                }
            })
            .cloned()
            .collect();
        for key in &doomed {
            g.remove(key);
        }
        self.len_hint.store(g.len(), Ordering::Relaxed);
        doomed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PathMap<i32> {
        let m = PathMap::new();
        m.put(ROOT, 0);
        m.put("a", 1);
        m.put("a/b.txt", 2);
        m.put("a/c", 3);
        m.put("a/c/d.txt", 4);
        m.put("z.txt", 5);
        m
    }

    #[test]
    fn re_key_preserves_values_and_moves_subtree() {
        let m = sample();
        m.re_key("a/c", "a/moved");
        let mut keys = m.keys();
        keys.sort();
        assert_eq!(
            keys,
            vec![".", "a", "a/b.txt", "a/moved", "a/moved/d.txt", "z.txt"]
        );
        assert_eq!(m.get("a/moved").unwrap(), 3);
        assert_eq!(m.get("a/moved/d.txt").unwrap(), 4);
        assert!(m.get("a/c").is_none());
        assert!(m.get("a/c/d.txt").is_none());
    }

    #[test]
    fn prune_removes_self_and_descendants_only() {
        let m = sample();
        let removed = m.prune("a/c", true);
        let mut removed_sorted = removed;
        removed_sorted.sort();
        assert_eq!(removed_sorted, vec!["a/c", "a/c/d.txt"]);
        assert!(m.contains("a"));
        assert!(m.contains("a/b.txt"));
        assert!(!m.contains("a/c"));
        assert!(!m.contains("a/c/d.txt"));
    }

    #[test]
    fn prune_exclusive_keeps_the_root_of_the_prune() {
        let m = sample();
        m.prune("a", false);
        assert!(m.contains("a"));
        assert!(!m.contains("a/b.txt"));
        assert!(!m.contains("a/c"));
        assert!(!m.contains("a/c/d.txt"));
    }

    #[test]
    fn set_algebra_matches_key_set_operations() {
        let m = sample();
        let other = vec!["a".to_string(), "q".to_string()];
        let diff = m.difference(other.clone());
        assert!(diff.contains("a/b.txt"));
        assert!(!diff.contains("a"));
        let inter = m.intersection(other.clone());
        assert_eq!(inter.len(), 1);
        assert!(inter.contains("a"));
        let uni = m.union(other);
        assert!(uni.contains("q"));
        assert!(uni.contains("z.txt"));
    }

    #[test]
    fn unsafe_len_tracks_mutations_without_locking() {
        let m = sample();
        assert_eq!(m.unsafe_len(), 6);
        m.pop("z.txt");
        assert_eq!(m.unsafe_len(), 5);
    }

    #[test]
    fn lock_is_reentrant_on_the_same_thread() {
        let m = sample();
        let guard = m.lock();
        // Re-entering from the same thread must not deadlock.
        let inner_len = {
            let guard2 = m.lock();
            guard2.len()
        };
        assert_eq!(inner_len, guard.len());
    }
}
