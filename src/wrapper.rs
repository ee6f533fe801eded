//! Pooled-object wrapper: state machine, timestamps, and the user object itself.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Lifecycle state of a [`PooledObject`]. Transitions are compare-and-swap
/// only; nothing here ever takes a lock to change state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Idle = 0,
    Allocated = 1,
    Eviction = 2,
    EvictionReturnToHead = 3,
    Invalid = 4,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Idle,
            1 => State::Allocated,
            2 => State::Eviction,
            3 => State::EvictionReturnToHead,
            4 => State::Invalid,
            _ => unreachable!("invalid pooled-object state tag {v}"),
        }
    }
}

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

fn now_nanos() -> u64 {
    epoch().elapsed().as_nanos() as u64
}

/// Wraps a single user object `T` together with its pool lifecycle state.
///
/// Orderable by last-return timestamp ascending (older first); ties are
/// broken by `id`, a monotonically increasing creation sequence number.
pub struct PooledObject<T> {
    id: u64,
    state: AtomicU8,
    created_at: Instant,
    last_borrowed_at: AtomicU64,
    last_returned_at: AtomicU64,
    object: Mutex<Option<T>>,
}

impl<T> fmt::Debug for PooledObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledObject")
            .field("id", &self.id)
            .field("state", &State::from_u8(self.state.load(Ordering::Acquire)))
            .finish()
    }
}

impl<T> PooledObject<T> {
    pub(crate) fn new(id: u64, object: T) -> Self {
        let created = now_nanos();
        PooledObject {
            id,
            state: AtomicU8::new(State::Idle as u8),
            created_at: Instant::now(),
            last_borrowed_at: AtomicU64::new(created),
            last_returned_at: AtomicU64::new(created),
            object: Mutex::new(Some(object)),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Idle -> Allocated (true). Eviction -> EvictionReturnToHead (returns
    /// false, deferring the claim to whoever is running the eviction test).
    /// Any other starting state also returns false.
    pub(crate) fn allocate(&self) -> bool {
        if self
            .state
            .compare_exchange(
                State::Idle as u8,
                State::Allocated as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.last_borrowed_at.store(now_nanos(), Ordering::Release);
            return true;
        }
        let _ = self.state.compare_exchange(
            State::Eviction as u8,
            State::EvictionReturnToHead as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        false
    }

    /// Allocated -> Idle.
    pub(crate) fn deallocate(&self) -> bool {
        let ok = self
            .state
            .compare_exchange(
                State::Allocated as u8,
                State::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if ok {
            self.last_returned_at.store(now_nanos(), Ordering::Release);
        }
        ok
    }

    /// * -> Invalid, unconditionally.
    pub(crate) fn invalidate(&self) {
        self.state.store(State::Invalid as u8, Ordering::Release);
    }

    /// Idle -> Eviction.
    pub(crate) fn start_eviction_test(&self) -> bool {
        self.state
            .compare_exchange(
                State::Idle as u8,
                State::Eviction as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Eviction -> Idle returns true. EvictionReturnToHead -> Idle returns
    /// false, signalling the caller to re-enqueue this wrapper at the head
    /// of the idle deque (an allocate() raced with the eviction test and
    /// must not lose its place).
    pub(crate) fn end_eviction_test(&self) -> bool {
        if self
            .state
            .compare_exchange(
                State::Eviction as u8,
                State::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.last_returned_at.store(now_nanos(), Ordering::Release);
            return true;
        }
        if self
            .state
            .compare_exchange(
                State::EvictionReturnToHead as u8,
                State::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.last_returned_at.store(now_nanos(), Ordering::Release);
            return false;
        }
        debug_assert!(false, "end_eviction_test called outside an eviction test");
        true
    }

    pub(crate) fn is_invalid(&self) -> bool {
        self.state.load(Ordering::Acquire) == State::Invalid as u8
    }

    pub(crate) fn active_time(&self) -> Duration {
        let nanos = now_nanos().saturating_sub(self.last_borrowed_at.load(Ordering::Acquire));
        Duration::from_nanos(nanos)
    }

    pub(crate) fn idle_time(&self) -> Duration {
        let nanos = now_nanos().saturating_sub(self.last_returned_at.load(Ordering::Acquire));
        Duration::from_nanos(nanos)
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Sort key used by `clear_oldest` and the evictor: last-return
    /// timestamp ascending, ties broken by creation order.
    pub(crate) fn order_key(&self) -> (u64, u64) {
        (self.last_returned_at.load(Ordering::Acquire), self.id)
    }

    /// Moves the user object out of the wrapper. Used when handing a
    /// wrapper to a borrower; the object is restored via
    /// [`PooledObject::restore_object`] on return, or consumed by
    /// `factory.destroy` via [`PooledObject::into_object`] on destruction.
    pub(crate) fn take_object(&self) -> T {
        self.object
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .expect("pooled object already taken")
    }

    /// Puts a previously-taken object back, e.g. after a successful
    /// passivate on return.
    pub(crate) fn restore_object(&self, object: T) {
        let mut guard = self.object.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(guard.is_none(), "restoring into a non-empty slot");
        *guard = Some(object);
    }

    /// Like [`PooledObject::take_object`] but returns `None` instead of
    /// panicking if the slot is already empty (the object was already taken
    /// by whichever caller currently has the wrapper checked out).
    pub(crate) fn try_take_object(&self) -> Option<T> {
        self.object.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub(crate) fn into_object(self) -> T {
        self.object
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .expect("pooled object already taken")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_deallocate_roundtrip() {
        let w = PooledObject::new(1, 42);
        assert!(w.allocate());
        assert!(!w.allocate(), "double allocate must fail");
        assert!(w.deallocate());
        assert!(!w.deallocate(), "double deallocate must fail");
        assert!(w.allocate());
    }

    #[test]
    fn eviction_races_with_allocate() {
        let w = PooledObject::new(1, ());
        assert!(w.start_eviction_test());
        // A borrower races in while the evictor holds the wrapper.
        assert!(!w.allocate(), "allocate during eviction test must fail");
        // The evictor must be told to re-enqueue at head.
        assert!(!w.end_eviction_test());
        // Now idle again, an honest allocate succeeds.
        assert!(w.allocate());
    }

    #[test]
    fn eviction_without_race_returns_to_idle() {
        let w = PooledObject::new(1, ());
        assert!(w.start_eviction_test());
        assert!(w.end_eviction_test());
        assert!(w.allocate());
    }

    #[test]
    fn invalidate_from_any_state() {
        let w = PooledObject::new(1, ());
        w.invalidate();
        assert!(w.is_invalid());
        assert!(!w.allocate());
    }

    #[test]
    fn into_object_recovers_value() {
        let w = PooledObject::new(7, String::from("hi"));
        assert_eq!(w.into_object(), "hi");
    }
}
