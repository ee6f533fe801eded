//! The factory contract: the only external collaborator this crate
//! requires. Modeled as an object-safe trait (a capability set, not a
//! struct of function pointers) so implementors can carry their own state —
//! a connector, a DSN, a handshake routine.

use std::error::Error as StdError;

/// Creates, checks, and destroys instances of `T` for a given key `K`.
///
/// None of these methods are ever called while a pool-internal lock is
/// held; they may block, perform I/O, or acquire application locks of
/// their own without risking deadlock with the pool.
pub trait PooledObjectFactory<K, T>: Send + Sync {
    /// The error type returned by fallible factory operations.
    type Error: StdError + Send + Sync + 'static;

    /// Creates a brand-new instance for `key`.
    fn make(&self, key: &K) -> Result<T, Self::Error>;

    /// Prepares a checked-out instance for use. Failure destroys it.
    fn activate(&self, key: &K, object: &mut T) -> Result<(), Self::Error> {
        let _ = (key, object);
        Ok(())
    }

    /// Resets an instance being returned to the pool. Failure destroys it.
    fn passivate(&self, key: &K, object: &mut T) -> Result<(), Self::Error> {
        let _ = (key, object);
        Ok(())
    }

    /// Side-effect-free health check. `false` causes destruction.
    ///
    /// Must not panic; a panicking `validate` is treated as `false` by the
    /// engine (see [`crate::engine`]'s use of `std::panic::catch_unwind`).
    fn validate(&self, key: &K, object: &T) -> bool {
        let _ = (key, object);
        true
    }

    /// Releases any external resources held by `object`. Errors are
    /// swallowed into the pool's audit ring, never propagated.
    fn destroy(&self, key: &K, object: T) {
        let _ = (key, object);
    }
}
