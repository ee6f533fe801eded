//! Background eviction thread plumbing: the sleep/wake loop and the
//! key/instance cursor the sweep resumes from on each wake-up.
//!
//! The actual sweep logic (selecting wrappers, applying the eviction
//! policy, destroying or renewing them) lives on `Pool::run_eviction_sweep`
//! in `engine.rs`, since it needs the engine's create/destroy machinery.
//! This module only owns the thread lifecycle.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Resumable cursor: which key we're on, and the sorted idle snapshot for
/// that key we're part-way through testing.
pub(crate) struct EvictorCursor<K, W> {
    pub keys: Vec<K>,
    pub key_idx: usize,
    pub instances: Vec<W>,
    pub instance_idx: usize,
}

impl<K, W> EvictorCursor<K, W> {
    pub fn new() -> Self {
        EvictorCursor {
            keys: Vec::new(),
            key_idx: 0,
            instances: Vec::new(),
            instance_idx: 0,
        }
    }

    pub fn reset_key_list(&mut self, keys: Vec<K>) {
        self.keys = keys;
        self.key_idx = 0;
        self.instances.clear();
        self.instance_idx = 0;
    }

    pub fn advance_key(&mut self) {
        self.key_idx += 1;
        self.instances.clear();
        self.instance_idx = 0;
    }
}

pub(crate) struct EvictorHandle {
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl EvictorHandle {
    /// `sweep` returns `false` to ask the thread to exit on its own, e.g.
    /// once the `Pool` it weakly references has been dropped.
    pub(crate) fn spawn(period: Duration, mut sweep: impl FnMut() -> bool + Send + 'static) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop2 = stop.clone();
        let thread = thread::Builder::new()
            .name("keyed-pool-evictor".into())
            .spawn(move || loop {
                let stopped = {
                    let (lock, cvar) = &*stop2;
                    let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
                    let (guard, _) = cvar
                        .wait_timeout(guard, period)
                        .unwrap_or_else(|e| e.into_inner());
                    *guard
                };
                if stopped || !sweep() {
                    break;
                }
            })
            .expect("failed to spawn keyed-pool evictor thread");
        EvictorHandle {
            stop,
            thread: Some(thread),
        }
    }

    pub(crate) fn stop(mut self) {
        {
            let (lock, cvar) = &*self.stop;
            let mut guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            *guard = true;
            cvar.notify_all();
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn cursor_advance_key_clears_instance_progress() {
        let mut cursor: EvictorCursor<&str, i32> = EvictorCursor::new();
        cursor.reset_key_list(vec!["a", "b"]);
        cursor.instances = vec![1, 2, 3];
        cursor.instance_idx = 2;
        cursor.advance_key();
        assert_eq!(cursor.key_idx, 1);
        assert!(cursor.instances.is_empty());
        assert_eq!(cursor.instance_idx, 0);
    }

    #[test]
    fn spawn_runs_sweep_periodically_until_stopped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let handle = EvictorHandle::spawn(Duration::from_millis(10), move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            true
        });
        thread::sleep(Duration::from_millis(55));
        handle.stop();
        assert!(calls.load(Ordering::SeqCst) >= 3, "expected several sweeps within 55ms at a 10ms period");
    }

    #[test]
    fn sweep_returning_false_exits_the_thread_on_its_own() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        // Models the evictor noticing its weakly-held Pool has been dropped.
        let handle = EvictorHandle::spawn(Duration::from_millis(5), move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            false
        });
        let start = Instant::now();
        // stop() joins; if the thread had not already exited on its own
        // this would still succeed, but we additionally assert it was fast.
        handle.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "thread must exit after the first false return");
    }
}
