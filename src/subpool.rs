//! The per-key sub-pool: idle deque, all-objects map, create-counter, and
//! interest-counter. Pure container — no policy logic lives here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::deque::FairDeque;
use crate::wrapper::PooledObject;

pub struct SubPool<T> {
    pub idle: FairDeque<Arc<PooledObject<T>>>,
    all_objects: Mutex<HashMap<u64, Arc<PooledObject<T>>>>,
    create_count: AtomicUsize,
    interest_count: AtomicUsize,
}

impl<T> SubPool<T> {
    pub fn new() -> Self {
        SubPool {
            idle: FairDeque::new(),
            all_objects: Mutex::new(HashMap::new()),
            create_count: AtomicUsize::new(0),
            interest_count: AtomicUsize::new(0),
        }
    }

    pub fn register_interest(&self) {
        self.interest_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn deregister_interest(&self) {
        let prev = self.interest_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "interest counter underflow");
    }

    pub fn num_interested(&self) -> usize {
        self.interest_count.load(Ordering::Acquire)
    }

    pub fn create_count(&self) -> usize {
        self.create_count.load(Ordering::Acquire)
    }

    /// Tentatively increments the create-counter. Returns `None` (and rolls
    /// back) if doing so would exceed `max_total_per_key` or overflow.
    pub fn try_begin_create(&self, max_total_per_key: Option<usize>) -> bool {
        let prev = self.create_count.fetch_add(1, Ordering::AcqRel);
        let new_count = match prev.checked_add(1) {
            Some(n) => n,
            None => {
                self.create_count.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
        };
        if let Some(max) = max_total_per_key {
            if new_count > max {
                self.create_count.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
        }
        true
    }

    /// Rolls back a `try_begin_create` that did not result in a wrapper
    /// (factory failure).
    pub fn abort_create(&self) {
        let prev = self.create_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "create counter underflow on abort");
    }

    /// Called after destruction of a live wrapper.
    pub fn note_destroyed(&self) {
        let prev = self.create_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "create counter underflow on destroy");
    }

    pub fn insert_live(&self, wrapper: Arc<PooledObject<T>>) {
        self.all_objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(wrapper.id(), wrapper);
    }

    pub fn remove_live(&self, id: u64) -> Option<Arc<PooledObject<T>>> {
        self.all_objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    pub fn get_live(&self, id: u64) -> Option<Arc<PooledObject<T>>> {
        self.all_objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn live_count(&self) -> usize {
        self.all_objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn live_snapshot(&self) -> Vec<Arc<PooledObject<T>>> {
        self.all_objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Eligible for removal from the registry only when both counters are
    /// zero.
    pub fn is_removable(&self) -> bool {
        self.create_count() == 0 && self.num_interested() == 0
    }
}

impl<T> Default for SubPool<T> {
    fn default() -> Self {
        Self::new()
    }
}
