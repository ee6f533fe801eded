//! Error kinds surfaced to callers, plus the bounded swallowed-exception
//! audit ring used for errors the engine must not propagate (destroy and
//! passivate failures, and anything the evictor encounters).

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

/// Errors surfaced by the public pool operations.
///
/// Mirrors the teacher's hand-rolled `pool::Error`: a plain enum with
/// manual `Display`/`Error` impls rather than a derive-macro crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum PoolError {
    /// No instance became available within the configured wait.
    Exhausted,
    /// The pool has been closed.
    Closed,
    /// `make` failed, or `activate`/`validate` failed on an instance the
    /// failing borrow itself just created.
    FactoryFailureFatal(Box<dyn StdError + Send + Sync>),
    /// `return_object`/`invalidate_object` called with an object this pool
    /// does not own for the given key.
    NotOurs,
    /// `return_object` called on a wrapper that was already idle.
    DoubleReturn,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PoolError::Exhausted => "pool exhausted: no instance available within the wait limit",
            PoolError::Closed => "pool is closed",
            PoolError::FactoryFailureFatal(_) => "factory failed to produce a usable instance",
            PoolError::NotOurs => "object does not belong to this pool for the given key",
            PoolError::DoubleReturn => "object was already returned to the pool",
        })
    }
}

impl StdError for PoolError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            PoolError::FactoryFailureFatal(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// One entry in the swallowed-exception audit ring.
#[derive(Debug)]
pub struct SwallowedException {
    pub at: Instant,
    pub message: String,
}

/// Bounded ring buffer of the last N errors from `destroy`/`passivate` and
/// other non-fatal factory failures, kept for diagnostics only.
pub struct SwallowedExceptions {
    capacity: usize,
    buf: Mutex<VecDeque<SwallowedException>>,
}

impl SwallowedExceptions {
    pub(crate) fn new(capacity: usize) -> Self {
        SwallowedExceptions {
            capacity: capacity.max(1),
            buf: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
        }
    }

    pub(crate) fn record(&self, message: impl Into<String>) {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(SwallowedException {
            at: Instant::now(),
            message: message.into(),
        });
    }

    /// A point-in-time snapshot of the audit ring, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.buf
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buf.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
