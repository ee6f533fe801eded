//! The pool engine: borrow/return/invalidate/clear/close, capacity
//! enforcement, `clear_oldest`, and `reuse_capacity`.

use std::fmt::Debug;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::{EvictionBatch, EvictionContext, EvictionPolicy, DefaultEvictionPolicy, PoolConfig};
use crate::error::{PoolError, SwallowedExceptions};
use crate::evictor::{EvictorCursor, EvictorHandle};
use crate::factory::PooledObjectFactory;
use crate::registry::Registry;
use crate::subpool::SubPool;
use crate::wrapper::PooledObject;

/// Point-in-time counters, safe to read concurrently with any operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub num_total: usize,
    pub created: u64,
    pub destroyed: u64,
    pub destroyed_by_evictor: u64,
    pub destroyed_by_borrow_validation: u64,
    pub borrowed: u64,
    pub returned: u64,
}

#[derive(Debug)]
struct ValidationFailed;

impl std::fmt::Display for ValidationFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("validate() returned false")
    }
}

impl std::error::Error for ValidationFailed {}

enum CreateOutcome<T, E> {
    Created(Arc<PooledObject<T>>),
    /// Capacity exhausted (global or per-key); caller should block/fail.
    Full,
    Failed(E),
}

enum WaitBudget {
    Indefinite,
    Remaining(Duration),
    Expired,
}

fn wait_budget(max_wait: Option<Duration>, start: Instant) -> WaitBudget {
    match max_wait {
        None => WaitBudget::Indefinite,
        Some(d) => {
            let elapsed = start.elapsed();
            if elapsed >= d {
                WaitBudget::Expired
            } else {
                WaitBudget::Remaining(d - elapsed)
            }
        }
    }
}

struct Inner<K, T, F> {
    registry: Registry<K, T>,
    factory: F,
    config: RwLock<PoolConfig>,
    eviction_policy: RwLock<Arc<dyn EvictionPolicy>>,
    num_total: AtomicUsize,
    created_count: AtomicU64,
    destroyed_count: AtomicU64,
    destroyed_by_evictor: AtomicU64,
    destroyed_by_borrow_validation: AtomicU64,
    borrowed_count: AtomicU64,
    returned_count: AtomicU64,
    next_id: AtomicU64,
    closed: AtomicBool,
    close_lock: Mutex<()>,
    eviction_lock: Mutex<()>,
    swallowed: SwallowedExceptions,
    evictor: Mutex<Option<EvictorHandle>>,
}

/// A generic, fair, keyed object pool.
///
/// Cheap to clone (an `Arc` around the shared state), so a single `Pool`
/// handle can be shared across threads directly.
pub struct Pool<K, T, F> {
    inner: Arc<Inner<K, T, F>>,
}

impl<K, T, F> Clone for Pool<K, T, F> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<K, T, F> Pool<K, T, F>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + 'static,
    F: PooledObjectFactory<K, T> + 'static,
{
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self::with_eviction_policy(factory, config, Arc::new(DefaultEvictionPolicy))
    }

    pub fn with_eviction_policy(
        factory: F,
        config: PoolConfig,
        eviction_policy: Arc<dyn EvictionPolicy>,
    ) -> Self {
        let period = config.time_between_eviction_runs;
        let swallowed = SwallowedExceptions::new(config.swallowed_exception_capacity);
        let inner = Arc::new(Inner {
            registry: Registry::new(),
            factory,
            config: RwLock::new(config),
            eviction_policy: RwLock::new(eviction_policy),
            num_total: AtomicUsize::new(0),
            created_count: AtomicU64::new(0),
            destroyed_count: AtomicU64::new(0),
            destroyed_by_evictor: AtomicU64::new(0),
            destroyed_by_borrow_validation: AtomicU64::new(0),
            borrowed_count: AtomicU64::new(0),
            returned_count: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_lock: Mutex::new(()),
            eviction_lock: Mutex::new(()),
            swallowed,
            evictor: Mutex::new(None),
        });
        let pool = Pool { inner };
        if let Some(period) = period {
            if !period.is_zero() {
                // Weak, not a clone: the evictor thread must never keep the
                // pool alive by itself, or dropping every `Pool` handle
                // would leak the factory, registry, and every live object
                // behind a thread that runs forever.
                let weak_inner: Weak<Inner<K, T, F>> = Arc::downgrade(&pool.inner);
                let mut cursor: EvictorCursor<K, Arc<PooledObject<T>>> = EvictorCursor::new();
                let handle = EvictorHandle::spawn(period, move || match weak_inner.upgrade() {
                    Some(inner) => {
                        Pool { inner }.run_eviction_sweep(&mut cursor);
                        true
                    }
                    None => false,
                });
                *pool.inner.evictor.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            }
        }
        pool
    }

    pub fn config(&self) -> PoolConfig {
        self.inner.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replaces the configuration in effect for future operations.
    ///
    /// Does not respawn or reschedule the evictor thread if
    /// `time_between_eviction_runs` changes; the evictor period is fixed at
    /// construction.
    pub fn set_config(&self, config: PoolConfig) {
        *self.inner.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    pub fn set_eviction_policy(&self, policy: Arc<dyn EvictionPolicy>) {
        *self.inner.eviction_policy.write().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            num_total: self.inner.num_total.load(Ordering::Acquire),
            created: self.inner.created_count.load(Ordering::Relaxed),
            destroyed: self.inner.destroyed_count.load(Ordering::Relaxed),
            destroyed_by_evictor: self.inner.destroyed_by_evictor.load(Ordering::Relaxed),
            destroyed_by_borrow_validation: self
                .inner
                .destroyed_by_borrow_validation
                .load(Ordering::Relaxed),
            borrowed: self.inner.borrowed_count.load(Ordering::Relaxed),
            returned: self.inner.returned_count.load(Ordering::Relaxed),
        }
    }

    pub fn swallowed_exceptions(&self) -> Vec<String> {
        self.inner.swallowed.snapshot()
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.registry.keys_snapshot()
    }

    pub fn idle_count(&self, key: &K) -> usize {
        self.inner.registry.get(key).map(|s| s.idle_count()).unwrap_or(0)
    }

    pub fn live_count(&self, key: &K) -> usize {
        self.inner.registry.get(key).map(|s| s.live_count()).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Borrows an instance for `key`, waiting up to `config().max_wait`.
    pub fn borrow(&self, key: K) -> Result<Pooled<K, T, F>, PoolError> {
        let max_wait = self.config().max_wait;
        self.borrow_with_timeout(key, max_wait)
    }

    /// Borrows an instance for `key`, overriding the configured wait.
    pub fn borrow_with_timeout(
        &self,
        key: K,
        max_wait: Option<Duration>,
    ) -> Result<Pooled<K, T, F>, PoolError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let cfg = self.config();
        let start = Instant::now();

        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(PoolError::Closed);
            }

            let sub = self.inner.registry.register(&key);
            let created_this_attempt;
            let mut wrapper = sub.idle.poll_first();

            if wrapper.is_none() {
                match self.create(&key, &sub, &cfg) {
                    CreateOutcome::Created(w) => {
                        wrapper = Some(w);
                        created_this_attempt = true;
                    }
                    CreateOutcome::Full => {
                        created_this_attempt = false;
                    }
                    CreateOutcome::Failed(e) => {
                        self.inner.registry.deregister(&key);
                        return Err(PoolError::FactoryFailureFatal(Box::new(e)));
                    }
                }
            } else {
                created_this_attempt = false;
            }

            let wrapper = match wrapper {
                Some(w) => w,
                None => {
                    if !cfg.block_when_exhausted {
                        self.inner.registry.deregister(&key);
                        return Err(PoolError::Exhausted);
                    }
                    let waited = match wait_budget(max_wait, start) {
                        WaitBudget::Indefinite => sub.idle.take_first(),
                        WaitBudget::Remaining(d) => sub.idle.poll_first_timeout(Some(d)),
                        WaitBudget::Expired => None,
                    };
                    match waited {
                        Some(w) => w,
                        None => {
                            self.inner.registry.deregister(&key);
                            return Err(PoolError::Exhausted);
                        }
                    }
                }
            };

            if !wrapper.allocate() {
                trace!(?key, "wrapper raced with eviction/invalidate, retrying borrow");
                self.inner.registry.deregister(&key);
                continue;
            }

            let mut object = wrapper.take_object();

            if let Err(e) = self.inner.factory.activate(&key, &mut object) {
                self.warn_swallow(format!("activate failed for key {key:?}: {e}"));
                wrapper.restore_object(object);
                self.destroy(&key, &sub, &wrapper, true, None);
                self.inner.registry.deregister(&key);
                if created_this_attempt {
                    return Err(PoolError::FactoryFailureFatal(Box::new(e)));
                }
                continue;
            }

            if cfg.test_on_borrow && !self.safe_validate(&key, &object) {
                self.inner
                    .destroyed_by_borrow_validation
                    .fetch_add(1, Ordering::Relaxed);
                wrapper.restore_object(object);
                self.destroy(&key, &sub, &wrapper, true, None);
                self.inner.registry.deregister(&key);
                if created_this_attempt {
                    return Err(PoolError::FactoryFailureFatal(Box::new(ValidationFailed)));
                }
                continue;
            }

            self.inner.borrowed_count.fetch_add(1, Ordering::Relaxed);
            self.inner.registry.deregister(&key);
            return Ok(Pooled {
                pool: self.clone(),
                key,
                wrapper,
                object: Some(object),
            });
        }
    }

    pub fn add_object(&self, key: K) -> Result<(), PoolError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let cfg = self.config();
        let sub = self.inner.registry.register(&key);
        let result = match self.create(&key, &sub, &cfg) {
            CreateOutcome::Created(wrapper) => {
                if cfg.lifo {
                    sub.idle.offer_first(wrapper);
                } else {
                    sub.idle.offer_last(wrapper);
                }
                Ok(())
            }
            CreateOutcome::Full => Err(PoolError::Exhausted),
            CreateOutcome::Failed(e) => Err(PoolError::FactoryFailureFatal(Box::new(e))),
        };
        self.inner.registry.deregister(&key);
        result
    }

    /// Eagerly creates idle instances for `key` up to
    /// `max(1, config().effective_min_idle_per_key())`.
    pub fn prepare_pool(&self, key: K) -> Result<(), PoolError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let cfg = self.config();
        let target = cfg.effective_min_idle_per_key().max(1);
        while self.idle_count(&key) < target {
            self.add_object(key.clone())?;
        }
        Ok(())
    }

    /// Destroys every idle instance for `key`.
    pub fn clear(&self, key: &K) {
        if let Some(sub) = self.inner.registry.get(key) {
            while let Some(wrapper) = sub.idle.poll_first() {
                self.destroy(key, &sub, &wrapper, true, None);
            }
        }
    }

    pub fn clear_all(&self) {
        for key in self.inner.registry.keys_snapshot() {
            self.clear(&key);
        }
    }

    /// Stops the evictor, destroys every idle instance, and wakes every
    /// blocked borrower with [`PoolError::Closed`]. Idempotent.
    pub fn close(&self) {
        let _guard = self.inner.close_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self
            .inner
            .evictor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.stop();
        }
        self.clear_all();
        for key in self.inner.registry.keys_snapshot() {
            if let Some(sub) = self.inner.registry.get(&key) {
                sub.idle.interrupt_take_waiters();
            }
        }
        self.clear_all();
        debug!("pool closed");
    }

    // ---- internal machinery ------------------------------------------

    fn warn_swallow(&self, message: String) {
        warn!("{message}");
        self.inner.swallowed.record(message);
    }

    fn safe_validate(&self, key: &K, object: &T) -> bool {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.inner.factory.validate(key, object)
        })) {
            Ok(v) => v,
            Err(_) => {
                self.warn_swallow(format!("validate() panicked for key {key:?}"));
                false
            }
        }
    }

    /// Enforces the global and per-key caps, then invokes `factory.make`
    /// outside any lock.
    fn create(&self, key: &K, sub: &Arc<SubPool<T>>, cfg: &PoolConfig) -> CreateOutcome<T, F::Error> {
        const MAX_CLEAR_OLDEST_RETRIES: u32 = 3;
        let mut retries = 0;
        loop {
            let prev_total = self.inner.num_total.fetch_add(1, Ordering::AcqRel);
            let new_total = prev_total + 1;
            if let Some(max_total) = cfg.max_total {
                if new_total > max_total {
                    self.inner.num_total.fetch_sub(1, Ordering::AcqRel);
                    let any_idle = self
                        .inner
                        .registry
                        .keys_snapshot()
                        .iter()
                        .filter_map(|k| self.inner.registry.get(k))
                        .any(|s| !s.idle.is_empty());
                    if any_idle && retries < MAX_CLEAR_OLDEST_RETRIES {
                        retries += 1;
                        self.clear_oldest(cfg);
                        continue;
                    }
                    return CreateOutcome::Full;
                }
            }
            break;
        }

        if !sub.try_begin_create(cfg.max_total_per_key) {
            self.inner.num_total.fetch_sub(1, Ordering::AcqRel);
            return CreateOutcome::Full;
        }

        match self.inner.factory.make(key) {
            Ok(obj) => {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let wrapper = Arc::new(PooledObject::new(id, obj));
                sub.insert_live(wrapper.clone());
                self.inner.created_count.fetch_add(1, Ordering::Relaxed);
                trace!(?key, id, "created pooled object");
                CreateOutcome::Created(wrapper)
            }
            Err(e) => {
                sub.abort_create();
                self.inner.num_total.fetch_sub(1, Ordering::AcqRel);
                CreateOutcome::Failed(e)
            }
        }
    }

    /// Destroys `wrapper`. `always=true` forces destruction even if it is
    /// not currently in the idle deque (the caller already holds the only
    /// reference, e.g. a just-failed borrow or an explicit invalidate).
    /// `always=false` only destroys if it is actually found and removed
    /// from the idle deque, which correctly no-ops if a concurrent borrower
    /// raced it away first (eviction / `clear_oldest` paths).
    fn destroy(
        &self,
        key: &K,
        sub: &SubPool<T>,
        wrapper: &Arc<PooledObject<T>>,
        always: bool,
        object: Option<T>,
    ) -> bool {
        let removed_from_idle = sub
            .idle
            .remove_first_matching(|w| w.id() == wrapper.id())
            .is_some();
        if !removed_from_idle && !always {
            return false;
        }
        sub.remove_live(wrapper.id());
        wrapper.invalidate();
        sub.note_destroyed();
        self.inner.num_total.fetch_sub(1, Ordering::AcqRel);
        self.inner.destroyed_count.fetch_add(1, Ordering::Relaxed);
        let obj = object.or_else(|| wrapper.try_take_object());
        if let Some(obj) = obj {
            trace!(?key, id = wrapper.id(), "destroying pooled object");
            self.inner.factory.destroy(key, obj);
        }
        true
    }

    /// Destroys the oldest `ceil(15% of idle population) + 1` idle
    /// instances across all keys, counting only successful destructions.
    fn clear_oldest(&self, cfg: &PoolConfig) {
        let _ = cfg;
        let mut candidates: Vec<(K, Arc<SubPool<T>>, Arc<PooledObject<T>>)> = Vec::new();
        for key in self.inner.registry.keys_snapshot() {
            if let Some(sub) = self.inner.registry.get(&key) {
                for w in sub.idle.snapshot() {
                    candidates.push((key.clone(), sub.clone(), w));
                }
            }
        }
        if candidates.is_empty() {
            return;
        }
        candidates.sort_by_key(|(_, _, w)| w.order_key());
        let quota = (candidates.len() * 15 + 99) / 100 + 1;
        let mut destroyed = 0usize;
        for (key, sub, wrapper) in candidates {
            if destroyed >= quota {
                break;
            }
            if self.destroy(&key, &sub, &wrapper, false, None) {
                destroyed += 1;
            }
        }
        debug!(destroyed, quota, "clear_oldest reclaimed idle instances");
    }

    /// Best-effort: if any sub-pool has waiters, try to free a capacity
    /// slot for the sub-pool with the most waiters whose key is under its
    /// per-key cap.
    fn maybe_reuse_capacity(&self, cfg: &PoolConfig) {
        let keys = self.inner.registry.keys_snapshot();
        let any_waiters = keys
            .iter()
            .filter_map(|k| self.inner.registry.get(k))
            .any(|s| s.idle.has_take_waiters());
        if !any_waiters {
            return;
        }
        self.reuse_capacity(cfg, keys);
    }

    fn reuse_capacity(&self, cfg: &PoolConfig, keys: Vec<K>) {
        let mut best: Option<(K, usize)> = None;
        for key in keys {
            let sub = match self.inner.registry.get(&key) {
                Some(s) => s,
                None => continue,
            };
            let waiters = sub.idle.take_queue_len();
            if waiters == 0 {
                continue;
            }
            let under_cap = cfg
                .max_total_per_key
                .map_or(true, |max| sub.live_count() < max);
            if !under_cap {
                continue;
            }
            if best.as_ref().map_or(true, |(_, w)| waiters > *w) {
                best = Some((key, waiters));
            }
        }
        let Some((key, _)) = best else { return };
        let sub = self.inner.registry.register(&key);
        match self.create(&key, &sub, cfg) {
            CreateOutcome::Created(wrapper) => {
                let mut obj = wrapper.take_object();
                match self.inner.factory.passivate(&key, &mut obj) {
                    Ok(()) => {
                        wrapper.restore_object(obj);
                        if cfg.lifo {
                            sub.idle.offer_first(wrapper);
                        } else {
                            sub.idle.offer_last(wrapper);
                        }
                        debug!(?key, "reuse_capacity created instance for waiting key");
                    }
                    Err(e) => {
                        self.warn_swallow(format!(
                            "passivate failed while priming reuse capacity for key {key:?}: {e}"
                        ));
                        self.destroy(&key, &sub, &wrapper, true, Some(obj));
                    }
                }
            }
            CreateOutcome::Full | CreateOutcome::Failed(_) => {}
        }
        self.inner.registry.deregister(&key);
    }

    fn do_return(&self, key: K, wrapper: Arc<PooledObject<T>>, mut object: T) {
        let cfg = self.config();
        let sub = match self.inner.registry.get(&key) {
            Some(s) => s,
            None => {
                debug_assert!(false, "returning object for a key with no sub-pool: {key:?}");
                return;
            }
        };

        if cfg.test_on_return && !self.safe_validate(&key, &object) {
            self.destroy(&key, &sub, &wrapper, true, Some(object));
            self.maybe_reuse_capacity(&cfg);
            return;
        }

        if let Err(e) = self.inner.factory.passivate(&key, &mut object) {
            self.warn_swallow(format!("passivate failed for key {key:?}: {e}"));
            self.destroy(&key, &sub, &wrapper, true, Some(object));
            self.maybe_reuse_capacity(&cfg);
            return;
        }

        if !wrapper.deallocate() {
            debug_assert!(false, "double return detected for key {key:?}");
            wrapper.restore_object(object);
            return;
        }
        wrapper.restore_object(object);

        let closed = self.inner.closed.load(Ordering::Acquire);
        let over_max_idle = cfg
            .max_idle_per_key
            .map_or(false, |max| sub.idle.len() >= max);

        if closed || over_max_idle {
            let obj = wrapper.try_take_object();
            self.destroy(&key, &sub, &wrapper, true, obj);
        } else if cfg.lifo {
            sub.idle.offer_first(wrapper);
        } else {
            sub.idle.offer_last(wrapper);
        }

        self.inner.returned_count.fetch_add(1, Ordering::Relaxed);
        self.maybe_reuse_capacity(&cfg);
    }

    fn do_invalidate(&self, key: K, wrapper: Arc<PooledObject<T>>, object: T) {
        let sub = match self.inner.registry.get(&key) {
            Some(s) => s,
            None => {
                debug_assert!(false, "invalidating object for a key with no sub-pool: {key:?}");
                return;
            }
        };
        self.destroy(&key, &sub, &wrapper, true, Some(object));
        let cfg = self.config();
        self.maybe_reuse_capacity(&cfg);
    }

    /// Runs one eviction sweep, resuming from `cursor`. Called from the
    /// background evictor thread; holds `eviction_lock` for its duration.
    fn run_eviction_sweep(&self, cursor: &mut EvictorCursor<K, Arc<PooledObject<T>>>) {
        let _guard = self
            .inner
            .eviction_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let cfg = self.config();

        if cursor.keys.is_empty() {
            cursor.reset_key_list(self.inner.registry.keys_snapshot());
        }

        let total_idle: usize = cursor
            .keys
            .iter()
            .filter_map(|k| self.inner.registry.get(k))
            .map(|s| s.idle_count())
            .sum();

        if total_idle == 0 {
            self.replenish_min_idle(&cfg);
            return;
        }

        let tests_to_run = match cfg.num_tests_per_eviction_run {
            EvictionBatch::Absolute(n) => n.min(total_idle),
            EvictionBatch::Fraction(div) => {
                let div = div.max(1);
                (total_idle + div - 1) / div
            }
        };

        let mut tests_done = 0usize;
        let safety_cap = total_idle.saturating_mul(8).saturating_add(64);
        let mut iterations = 0usize;

        while tests_done < tests_to_run {
            iterations += 1;
            if iterations > safety_cap {
                break;
            }

            if cursor.key_idx >= cursor.keys.len() {
                cursor.reset_key_list(self.inner.registry.keys_snapshot());
                if cursor.keys.is_empty() {
                    break;
                }
            }

            let key = cursor.keys[cursor.key_idx].clone();
            let sub = match self.inner.registry.get(&key) {
                Some(s) => s,
                None => {
                    cursor.advance_key();
                    continue;
                }
            };

            if cursor.instances.is_empty() && cursor.instance_idx == 0 {
                let mut snap = sub.idle.snapshot();
                snap.sort_by_key(|w| w.order_key());
                cursor.instances = snap;
            }

            if cursor.instance_idx >= cursor.instances.len() {
                cursor.advance_key();
                continue;
            }

            let wrapper = cursor.instances[cursor.instance_idx].clone();
            cursor.instance_idx += 1;

            if !wrapper.start_eviction_test() {
                // Raced with a borrower; not our turn to test it.
                continue;
            }
            tests_done += 1;

            let ctx = EvictionContext {
                idle_time: wrapper.idle_time(),
                min_idle_time: cfg.min_evictable_idle_time,
                soft_min_idle_time: cfg.soft_min_evictable_idle_time,
                min_idle_per_key: cfg.effective_min_idle_per_key(),
                idle_count_for_key: sub.idle_count(),
            };
            let policy = self
                .inner
                .eviction_policy
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            let should_evict = policy.should_evict(&ctx);

            let mut destroyed_now = false;
            if should_evict {
                destroyed_now = self.destroy(&key, &sub, &wrapper, false, None);
                if destroyed_now {
                    self.inner.destroyed_by_evictor.fetch_add(1, Ordering::Relaxed);
                }
            } else if cfg.test_while_idle {
                let mut obj = wrapper.take_object();
                let mut failed = false;
                if let Err(e) = self.inner.factory.activate(&key, &mut obj) {
                    self.warn_swallow(format!("evictor activate failed for key {key:?}: {e}"));
                    failed = true;
                }
                if !failed && !self.safe_validate(&key, &obj) {
                    failed = true;
                }
                if !failed {
                    if let Err(e) = self.inner.factory.passivate(&key, &mut obj) {
                        self.warn_swallow(format!("evictor passivate failed for key {key:?}: {e}"));
                        failed = true;
                    }
                }
                wrapper.restore_object(obj);
                if failed {
                    destroyed_now = self.destroy(&key, &sub, &wrapper, false, None);
                    if destroyed_now {
                        self.inner.destroyed_by_evictor.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            if !destroyed_now {
                let must_requeue_head = !wrapper.end_eviction_test();
                if must_requeue_head {
                    sub.idle.offer_first(wrapper);
                }
            }
        }

        self.replenish_min_idle(&cfg);
    }

    /// For every key, creates instances up to
    /// `min(min_idle_per_key, max_idle_per_key, max_total_per_key, headroom under max_total)`.
    fn replenish_min_idle(&self, cfg: &PoolConfig) {
        let min_idle = cfg.effective_min_idle_per_key();
        if min_idle == 0 {
            return;
        }
        for key in self.inner.registry.keys_snapshot() {
            let sub = match self.inner.registry.get(&key) {
                Some(s) => s,
                None => continue,
            };
            loop {
                if sub.idle_count() >= min_idle {
                    break;
                }
                if let Some(max_per_key) = cfg.max_total_per_key {
                    if sub.live_count() >= max_per_key {
                        break;
                    }
                }
                if let Some(max_total) = cfg.max_total {
                    if self.inner.num_total.load(Ordering::Acquire) >= max_total {
                        break;
                    }
                }
                self.inner.registry.register(&key);
                let outcome = self.create(&key, &sub, cfg);
                let should_break = match outcome {
                    CreateOutcome::Created(wrapper) => {
                        if cfg.lifo {
                            sub.idle.offer_first(wrapper);
                        } else {
                            sub.idle.offer_last(wrapper);
                        }
                        false
                    }
                    CreateOutcome::Full => true,
                    CreateOutcome::Failed(e) => {
                        self.warn_swallow(format!("min-idle replenish failed for key {key:?}: {e}"));
                        true
                    }
                };
                self.inner.registry.deregister(&key);
                if should_break {
                    break;
                }
            }
        }
    }
}

impl<K, T, F> Drop for Pool<K, T, F> {
    /// Proactively stops and joins the evictor thread when the last
    /// strong handle to this pool is dropped, rather than leaving it to
    /// notice on its own next wake-up (the evictor closure only holds a
    /// `Weak` reference, so it would eventually exit regardless, but there
    /// is no reason to make it wait out a full `time_between_eviction_runs`
    /// period first).
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) != 1 {
            return;
        }
        if let Ok(mut guard) = self.inner.evictor.lock() {
            if let Some(handle) = guard.take() {
                handle.stop();
            }
        }
    }
}

/// A checked-out instance. Returns itself to the pool on `Drop`, or can be
/// consumed by [`Pooled::invalidate`] to force destruction instead.
pub struct Pooled<K, T, F>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + 'static,
    F: PooledObjectFactory<K, T> + 'static,
{
    pool: Pool<K, T, F>,
    key: K,
    wrapper: Arc<PooledObject<T>>,
    object: Option<T>,
}

impl<K, T, F> Pooled<K, T, F>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + 'static,
    F: PooledObjectFactory<K, T> + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// How long this instance has been checked out.
    pub fn active_time(&self) -> Duration {
        self.wrapper.active_time()
    }

    /// Consumes `self`, destroying the underlying instance instead of
    /// returning it to the pool. Never consults capacity limits.
    pub fn invalidate(mut self) {
        let object = self.object.take().expect("pooled object present");
        let wrapper = self.wrapper.clone();
        let key = self.key.clone();
        self.pool.do_invalidate(key, wrapper, object);
    }
}

impl<K, T, F> Deref for Pooled<K, T, F>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + 'static,
    F: PooledObjectFactory<K, T> + 'static,
{
    type Target = T;
    fn deref(&self) -> &T {
        self.object.as_ref().expect("pooled object present")
    }
}

impl<K, T, F> DerefMut for Pooled<K, T, F>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + 'static,
    F: PooledObjectFactory<K, T> + 'static,
{
    fn deref_mut(&mut self) -> &mut T {
        self.object.as_mut().expect("pooled object present")
    }
}

impl<K, T, F> Drop for Pooled<K, T, F>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + 'static,
    F: PooledObjectFactory<K, T> + 'static,
{
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            let wrapper = self.wrapper.clone();
            let key = self.key.clone();
            self.pool.do_return(key, wrapper, object);
        }
    }
}

impl<K, T, F> std::fmt::Debug for Pooled<K, T, F>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + 'static,
    F: PooledObjectFactory<K, T> + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pooled").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc as StdArc;
    use std::thread;

    #[derive(Debug)]
    struct Never;
    impl std::fmt::Display for Never {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("never")
        }
    }
    impl std::error::Error for Never {}

    struct CountingFactory {
        next: AtomicU32,
        validate_fails_once: AtomicBool,
    }

    impl CountingFactory {
        fn new() -> Self {
            CountingFactory {
                next: AtomicU32::new(0),
                validate_fails_once: AtomicBool::new(false),
            }
        }
    }

    impl PooledObjectFactory<String, u32> for CountingFactory {
        type Error = Never;

        fn make(&self, _key: &String) -> Result<u32, Never> {
            Ok(self.next.fetch_add(1, Ordering::Relaxed))
        }

        fn validate(&self, _key: &String, _object: &u32) -> bool {
            !self.validate_fails_once.swap(false, Ordering::AcqRel)
        }
    }

    fn cfg(max_total_per_key: usize) -> PoolConfig {
        PoolConfig {
            max_total_per_key: Some(max_total_per_key),
            max_total: None,
            max_idle_per_key: Some(max_total_per_key),
            ..PoolConfig::default()
        }
    }

    /// Installs a test-scoped `tracing` subscriber so `trace!`/`debug!`/
    /// `warn!` output from the engine is visible under `--nocapture`;
    /// harmless (and a no-op) if a subscriber is already installed.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    #[test]
    fn s1_lifo_reuse_single_key() {
        init_tracing();
        let pool = Pool::new(CountingFactory::new(), cfg(2));
        let o1 = pool.borrow("a".to_string()).unwrap();
        let o2 = pool.borrow("a".to_string()).unwrap();
        let v1 = *o1;
        let v2 = *o2;
        drop(o1);
        drop(o2);
        let o3 = pool.borrow("a".to_string()).unwrap();
        assert_eq!(*o3, v2, "LIFO must hand back the most recently returned instance");
        assert_eq!(pool.stats().created, 2);
        assert_eq!(pool.stats().destroyed, 0);
        let _ = v1;
    }

    #[test]
    fn s2_exhaustion_timeout() {
        init_tracing();
        let mut config = cfg(1);
        config.max_wait = Some(Duration::from_millis(50));
        let pool = Pool::new(CountingFactory::new(), config);
        let _o1 = pool.borrow("a".to_string()).unwrap();
        let start = Instant::now();
        let err = pool.borrow("a".to_string()).unwrap_err();
        let elapsed = start.elapsed();
        assert!(matches!(err, PoolError::Exhausted));
        assert!(elapsed >= Duration::from_millis(40) && elapsed <= Duration::from_millis(400));
    }

    #[test]
    fn s3_global_cap_triggers_clear_oldest() {
        init_tracing();
        let config = PoolConfig {
            max_total: Some(3),
            max_total_per_key: Some(3),
            max_idle_per_key: Some(3),
            ..PoolConfig::default()
        };
        let pool = Pool::new(CountingFactory::new(), config);

        for _ in 0..2 {
            drop(pool.borrow("k1".to_string()).unwrap());
        }
        drop(pool.borrow("k2".to_string()).unwrap());

        assert_eq!(pool.stats().num_total, 3);
        let idle_before = pool.idle_count(&"k1".to_string()) + pool.idle_count(&"k2".to_string());
        assert_eq!(idle_before, 3);

        let o3 = pool.borrow("k3".to_string()).unwrap();
        assert_eq!(*o3, 3, "k3 must get a freshly created instance rather than a reused k1/k2 one");

        assert!(
            pool.stats().destroyed >= 1,
            "hitting the global cap must force clear_oldest to reclaim at least one idle instance"
        );
        assert!(pool.stats().num_total <= 3, "numTotal must never exceed the global cap");
        let idle_after = pool.idle_count(&"k1".to_string()) + pool.idle_count(&"k2".to_string());
        assert!(idle_after < idle_before, "clear_oldest must have destroyed a previously idle instance");
    }

    #[test]
    fn s5_min_idle_replenishment_via_evictor() {
        init_tracing();
        let config = PoolConfig {
            min_idle_per_key: 2,
            max_idle_per_key: Some(5),
            max_total_per_key: Some(5),
            time_between_eviction_runs: Some(Duration::from_millis(10)),
            ..PoolConfig::default()
        };
        let pool = Pool::new(CountingFactory::new(), config);
        pool.add_object("a".to_string()).unwrap();
        assert_eq!(pool.idle_count(&"a".to_string()), 1);

        let deadline = Instant::now() + Duration::from_millis(500);
        while pool.idle_count(&"a".to_string()) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            pool.idle_count(&"a".to_string()),
            2,
            "the background evictor must replenish idle instances up to min_idle_per_key"
        );
    }

    #[test]
    fn s6_cross_key_reuse_capacity_unblocks_waiter() {
        init_tracing();
        let config = PoolConfig {
            max_total: Some(2),
            max_total_per_key: Some(2),
            max_idle_per_key: Some(2),
            block_when_exhausted: true,
            ..PoolConfig::default()
        };
        let pool = Pool::new(CountingFactory::new(), config);

        let o1 = pool.borrow("k1".to_string()).unwrap();
        let o2 = pool.borrow("k1".to_string()).unwrap();
        assert_eq!(pool.stats().num_total, 2);

        let pool_y = pool.clone();
        let y = thread::spawn(move || {
            pool_y.borrow_with_timeout("k2".to_string(), Some(Duration::from_secs(2)))
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!y.is_finished(), "Y must stay blocked while the global cap is held entirely by k1");

        drop(o1);
        drop(o2);

        let obj = y
            .join()
            .unwrap()
            .expect("Y must unblock once capacity is released, even though it was freed under a different key");
        assert_eq!(*obj, 2, "k2 must get a freshly created instance, not a reused k1 object");
    }

    /// The evictor thread must not keep the pool's `Inner` alive once every
    /// `Pool` handle is dropped — it should hold a weak reference and exit
    /// on its own instead of creating a permanent reference cycle.
    #[test]
    fn evictor_does_not_leak_pool_after_last_handle_dropped() {
        init_tracing();
        let factory_alive = StdArc::new(AtomicBool::new(true));
        struct TrackingFactory(StdArc<AtomicBool>);
        impl Drop for TrackingFactory {
            fn drop(&mut self) {
                self.0.store(false, Ordering::SeqCst);
            }
        }
        impl PooledObjectFactory<String, u32> for TrackingFactory {
            type Error = Never;
            fn make(&self, _key: &String) -> Result<u32, Never> {
                Ok(0)
            }
        }

        let config = PoolConfig {
            time_between_eviction_runs: Some(Duration::from_millis(10)),
            ..PoolConfig::default()
        };
        let pool = Pool::new(TrackingFactory(factory_alive.clone()), config);
        pool.add_object("a".to_string()).unwrap();
        // Let the evictor run at least once so its closure is definitely
        // holding a live reference when the last `Pool` handle goes away.
        thread::sleep(Duration::from_millis(30));
        drop(pool);

        let deadline = Instant::now() + Duration::from_secs(1);
        while factory_alive.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(
            !factory_alive.load(Ordering::SeqCst),
            "dropping the last Pool handle must free the factory, not leave it pinned by the evictor thread"
        );
    }

    #[test]
    fn s4_validation_on_borrow_destroys_and_recreates() {
        init_tracing();
        let factory = StdArc::new(CountingFactory::new());
        struct ArcFactory(StdArc<CountingFactory>);
        impl PooledObjectFactory<String, u32> for ArcFactory {
            type Error = Never;
            fn make(&self, key: &String) -> Result<u32, Never> {
                self.0.make(key)
            }
            fn validate(&self, key: &String, object: &u32) -> bool {
                self.0.validate(key, object)
            }
        }
        let mut config = cfg(5);
        config.test_on_borrow = true;
        let pool = Pool::new(ArcFactory(factory.clone()), config);
        pool.add_object("a".to_string()).unwrap();
        factory.validate_fails_once.store(true, Ordering::Relaxed);
        let obj = pool.borrow("a".to_string()).unwrap();
        assert_eq!(*obj, 1, "the invalid instance (id 0) must be replaced by a fresh one");
        assert_eq!(pool.stats().destroyed_by_borrow_validation, 1);
    }

    #[test]
    fn close_rejects_new_borrows_and_reaps_idle() {
        init_tracing();
        let pool = Pool::new(CountingFactory::new(), cfg(2));
        let o1 = pool.borrow("a".to_string()).unwrap();
        drop(o1);
        pool.close();
        assert!(matches!(pool.borrow("a".to_string()), Err(PoolError::Closed)));
        assert_eq!(pool.stats().num_total, 0);
    }

    #[test]
    fn invalidate_never_reuses() {
        init_tracing();
        let pool = Pool::new(CountingFactory::new(), cfg(2));
        let obj = pool.borrow("a".to_string()).unwrap();
        obj.invalidate();
        assert_eq!(pool.idle_count(&"a".to_string()), 0);
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[test]
    fn not_ours_style_type_safety() {
        // There is no API to return a bare T; only a `Pooled<K, T, F>`
        // obtained from `borrow` can be returned or invalidated, so the
        // "NotOurs" error case is structurally unrepresentable rather than
        // checked at runtime.
    }
}
