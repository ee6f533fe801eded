//! Key registry: maps keys to sub-pools and keeps a parallel ordered key
//! list, both mutated only under one write lock.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use crate::subpool::SubPool;

struct Inner<K, T> {
    map: HashMap<K, Arc<SubPool<T>>>,
    order: Vec<K>,
}

pub struct Registry<K, T> {
    inner: RwLock<Inner<K, T>>,
}

impl<K: Eq + Hash + Clone, T> Registry<K, T> {
    pub fn new() -> Self {
        Registry {
            inner: RwLock::new(Inner {
                map: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Optimistic read path; creates the sub-pool under the write lock if
    /// absent. Always increments the returned sub-pool's interest counter —
    /// callers must pair this with exactly one [`Registry::deregister`].
    pub fn register(&self, key: &K) -> Arc<SubPool<T>> {
        {
            let read = self.inner.read().unwrap_or_else(|e| e.into_inner());
            if let Some(sub) = read.map.get(key) {
                sub.register_interest();
                return sub.clone();
            }
        }
        let mut write = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(sub) = write.map.get(key) {
            sub.register_interest();
            return sub.clone();
        }
        let sub = Arc::new(SubPool::new());
        sub.register_interest();
        write.map.insert(key.clone(), sub.clone());
        write.order.push(key.clone());
        sub
    }

    /// Decrements interest; if the sub-pool is now quiescent
    /// (`create_count == 0 && num_interested == 0`), removes it from both
    /// the map and the order list under the write lock, re-checking the
    /// condition to guard against a racing `register`.
    pub fn deregister(&self, key: &K) {
        let sub = {
            let read = self.inner.read().unwrap_or_else(|e| e.into_inner());
            match read.map.get(key) {
                Some(s) => s.clone(),
                None => {
                    debug_assert!(false, "deregister called for unknown key");
                    return;
                }
            }
        };
        sub.deregister_interest();
        if !sub.is_removable() {
            return;
        }
        let mut write = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let still_same_and_removable = write
            .map
            .get(key)
            .map(|s| Arc::ptr_eq(s, &sub) && s.is_removable())
            .unwrap_or(false);
        if still_same_and_removable {
            write.map.remove(key);
            if let Some(pos) = write.order.iter().position(|k| k == key) {
                write.order.remove(pos);
            }
        }
    }

    /// Looks up a sub-pool without touching its interest counter. Safe for
    /// callers (return/invalidate) that already know the key has at least
    /// one live instance, which keeps `is_removable()` false for the
    /// duration of the call.
    pub fn get(&self, key: &K) -> Option<Arc<SubPool<T>>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .map
            .get(key)
            .cloned()
    }

    /// Snapshot of the insertion-ordered key list, copied under the read
    /// lock.
    pub fn keys_snapshot(&self) -> Vec<K> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).order.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone, T> Default for Registry<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_creates_once_and_reuses() {
        let reg: Registry<&str, i32> = Registry::new();
        let a = reg.register(&"k1");
        let b = reg.register(&"k1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn deregister_reaps_quiescent_subpool() {
        let reg: Registry<&str, i32> = Registry::new();
        let _a = reg.register(&"k1");
        reg.deregister(&"k1");
        assert_eq!(reg.len(), 0);
        assert_eq!(reg.keys_snapshot(), Vec::<&str>::new());
    }

    #[test]
    fn deregister_keeps_subpool_with_live_objects() {
        let reg: Registry<&str, i32> = Registry::new();
        let sub = reg.register(&"k1");
        assert!(sub.try_begin_create(None));
        reg.deregister(&"k1");
        assert_eq!(reg.len(), 1, "create_count > 0 must block reclamation");
    }
}
