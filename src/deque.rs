//! A bounded, fair, double-ended blocking queue.
//!
//! Fairness is implemented as a single mutex guarding a [`VecDeque`] plus an
//! explicit FIFO ticket counter, rather than relying on any particular
//! scheduler behavior: a waiter draws a ticket on entry and may only take an
//! item once its ticket is the one currently being served. A waiter that
//! times out or is interrupted before its turn "abandons" its ticket so
//! later arrivals are not blocked behind it forever.

use std::collections::{HashSet, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct Inner<T> {
    items: VecDeque<T>,
    next_ticket: u64,
    now_serving: u64,
    abandoned: HashSet<u64>,
    waiting: usize,
    interrupt_epoch: u64,
}

impl<T> Inner<T> {
    fn advance_past_abandoned(&mut self) {
        while self.abandoned.remove(&self.now_serving) {
            self.now_serving += 1;
        }
    }
}

/// A fair blocking deque of `T`. Cloned out via [`FairDeque::snapshot`] for
/// weakly-consistent iteration; `T` is expected to be a cheap handle (an
/// `Arc`, in this crate's usage).
pub struct FairDeque<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
}

impl<T: Clone> FairDeque<T> {
    pub fn new() -> Self {
        FairDeque {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                next_ticket: 0,
                now_serving: 0,
                abandoned: HashSet::new(),
                waiting: 0,
                interrupt_epoch: 0,
            }),
            not_empty: Condvar::new(),
        }
    }

    pub fn offer_first(&self, item: T) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.items.push_front(item);
        self.not_empty.notify_all();
    }

    pub fn offer_last(&self, item: T) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.items.push_back(item);
        self.not_empty.notify_all();
    }

    pub fn poll_first(&self) -> Option<T> {
        self.take_generic(Some(Duration::ZERO), true)
    }

    pub fn poll_last(&self) -> Option<T> {
        self.take_generic(Some(Duration::ZERO), false)
    }

    pub fn poll_first_timeout(&self, timeout: Option<Duration>) -> Option<T> {
        self.take_generic(timeout, true)
    }

    pub fn poll_last_timeout(&self, timeout: Option<Duration>) -> Option<T> {
        self.take_generic(timeout, false)
    }

    pub fn take_first(&self) -> Option<T> {
        self.take_generic(None, true)
    }

    pub fn take_last(&self) -> Option<T> {
        self.take_generic(None, false)
    }

    /// `timeout = None` waits indefinitely. `timeout = Some(Duration::ZERO)`
    /// is the non-blocking poll case: try once, return immediately.
    fn take_generic(&self, timeout: Option<Duration>, front: bool) -> Option<T> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.advance_past_abandoned();

        // Fast, non-blocking path shared by poll_first/poll_last: never
        // registers a ticket, so it can't starve a real waiter.
        if timeout == Some(Duration::ZERO) {
            if guard.now_serving == guard.next_ticket {
                let item = if front {
                    guard.items.pop_front()
                } else {
                    guard.items.pop_back()
                };
                if item.is_some() {
                    guard.next_ticket += 1;
                    guard.now_serving += 1;
                    self.not_empty.notify_all();
                }
                return item;
            }
            return None;
        }

        let ticket = guard.next_ticket;
        guard.next_ticket += 1;
        guard.waiting += 1;
        let start_epoch = guard.interrupt_epoch;
        let deadline = timeout.map(|d| Instant::now() + d);

        let result = loop {
            if guard.interrupt_epoch != start_epoch {
                break None;
            }
            guard.advance_past_abandoned();
            if guard.now_serving == ticket {
                let item = if front {
                    guard.items.pop_front()
                } else {
                    guard.items.pop_back()
                };
                if let Some(item) = item {
                    guard.now_serving += 1;
                    self.not_empty.notify_all();
                    break Some(item);
                }
                // Our turn, but nothing to take yet: keep our ticket and wait.
            }
            match deadline {
                None => {
                    guard = self
                        .not_empty
                        .wait(guard)
                        .unwrap_or_else(|e| e.into_inner());
                }
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        break None;
                    }
                    let (g, _) = self
                        .not_empty
                        .wait_timeout(guard, dl - now)
                        .unwrap_or_else(|e| e.into_inner());
                    guard = g;
                }
            }
        };

        guard.waiting -= 1;
        if result.is_none() {
            if guard.now_serving == ticket {
                guard.now_serving += 1;
            } else {
                guard.abandoned.insert(ticket);
            }
            guard.advance_past_abandoned();
            self.not_empty.notify_all();
        }
        result
    }

    pub fn has_take_waiters(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).waiting > 0
    }

    pub fn take_queue_len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).waiting
    }

    /// Wakes every blocked `take_*` call; each returns `None` as though it
    /// had timed out. Used by `close()`.
    pub fn interrupt_take_waiters(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.interrupt_epoch += 1;
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Weakly-consistent snapshot, front to back, for iteration by the
    /// evictor and `clear_oldest` without holding the deque lock for the
    /// duration of the scan.
    pub fn snapshot(&self) -> Vec<T> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.items.iter().cloned().collect()
    }

    /// Removes and returns the first item for which `pred` returns true,
    /// scanning front to back. Used when destroying a specific wrapper that
    /// may or may not currently be idle.
    pub fn remove_first_matching<F: Fn(&T) -> bool>(&self, pred: F) -> Option<T> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let pos = inner.items.iter().position(pred)?;
        inner.items.remove(pos)
    }
}

impl<T: Clone> Default for FairDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lifo_push_front_pop_front() {
        let d: FairDeque<i32> = FairDeque::new();
        d.offer_first(1);
        d.offer_first(2);
        assert_eq!(d.poll_first(), Some(2));
        assert_eq!(d.poll_first(), Some(1));
        assert_eq!(d.poll_first(), None);
    }

    #[test]
    fn fifo_push_back_pop_front() {
        let d: FairDeque<i32> = FairDeque::new();
        d.offer_last(1);
        d.offer_last(2);
        assert_eq!(d.poll_first(), Some(1));
        assert_eq!(d.poll_first(), Some(2));
    }

    #[test]
    fn poll_timeout_returns_none_when_empty() {
        let d: FairDeque<i32> = FairDeque::new();
        let start = Instant::now();
        let v = d.poll_first_timeout(Some(Duration::from_millis(30)));
        assert_eq!(v, None);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn waiter_is_unblocked_by_offer() {
        let d: Arc<FairDeque<i32>> = Arc::new(FairDeque::new());
        let d2 = d.clone();
        let h = thread::spawn(move || d2.take_first());
        thread::sleep(Duration::from_millis(20));
        assert!(d.has_take_waiters());
        d.offer_last(99);
        assert_eq!(h.join().unwrap(), Some(99));
    }

    #[test]
    fn fifo_fairness_among_waiters() {
        let d: Arc<FairDeque<i32>> = Arc::new(FairDeque::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let d = d.clone();
            let order = order.clone();
            handles.push(thread::spawn(move || {
                // Stagger arrival so ticket order is deterministic.
                thread::sleep(Duration::from_millis(i * 15));
                let v = d.take_first();
                order.lock().unwrap().push(v.unwrap());
            }));
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(50));
        for i in 0..5 {
            d.offer_last(i);
        }
        for h in handles {
            h.join().unwrap();
        }
        let got = order.lock().unwrap().clone();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn interrupt_wakes_all_waiters() {
        let d: Arc<FairDeque<i32>> = Arc::new(FairDeque::new());
        let d2 = d.clone();
        let h = thread::spawn(move || d2.take_first());
        thread::sleep(Duration::from_millis(20));
        d.interrupt_take_waiters();
        assert_eq!(h.join().unwrap(), None);
    }

    #[test]
    fn abandoned_ticket_does_not_starve_later_waiter() {
        let d: Arc<FairDeque<i32>> = Arc::new(FairDeque::new());
        let d2 = d.clone();
        // First waiter times out quickly without being served.
        let h1 = thread::spawn(move || d2.poll_first_timeout(Some(Duration::from_millis(20))));
        thread::sleep(Duration::from_millis(5));
        let d3 = d.clone();
        let h2 = thread::spawn(move || d3.take_first());
        thread::sleep(Duration::from_millis(60));
        d.offer_last(7);
        assert_eq!(h1.join().unwrap(), None);
        assert_eq!(h2.join().unwrap(), Some(7));
    }

    #[test]
    fn remove_first_matching_scans_middle() {
        let d: FairDeque<i32> = FairDeque::new();
        d.offer_last(1);
        d.offer_last(2);
        d.offer_last(3);
        assert_eq!(d.remove_first_matching(|v| *v == 2), Some(2));
        assert_eq!(d.snapshot(), vec![1, 3]);
    }
}
