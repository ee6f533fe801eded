//! A generic, fair, keyed object pool.
//!
//! Objects are partitioned by an arbitrary key `K`; each key gets its own
//! idle queue and creation accounting, while a global cap (if configured)
//! is shared across all keys. Borrowers block (or fail fast, depending on
//! configuration) when a key is momentarily exhausted, and a background
//! thread evicts idle instances that have overstayed their welcome.
//!
//! The pool does not know how to construct, validate, or tear down `T` —
//! that is supplied by an implementation of [`PooledObjectFactory`].
//!
//! ```no_run
//! use keyed_pool::{Pool, PoolConfig, PooledObjectFactory};
//! use std::convert::Infallible;
//!
//! struct Conn;
//!
//! struct ConnFactory;
//!
//! impl PooledObjectFactory<String, Conn> for ConnFactory {
//!     type Error = Infallible;
//!
//!     fn make(&self, _key: &String) -> Result<Conn, Infallible> {
//!         Ok(Conn)
//!     }
//! }
//!
//! let pool = Pool::new(ConnFactory, PoolConfig::default());
//! let conn = pool.borrow("db-primary".to_string()).unwrap();
//! drop(conn); // returned to the pool automatically
//! ```

mod config;
mod deque;
mod engine;
mod error;
mod evictor;
mod factory;
mod registry;
mod subpool;
mod wrapper;

pub use config::{
    ConfigError, EvictionBatch, EvictionContext, EvictionPolicy, DefaultEvictionPolicy, PoolConfig,
    PoolConfigBuilder,
};
pub use engine::{Pool, Pooled, PoolStats};
pub use error::{PoolError, SwallowedException, SwallowedExceptions};
pub use factory::PooledObjectFactory;
