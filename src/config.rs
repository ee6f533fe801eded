//! Configuration surface: a plain value type snapshot-read by each
//! operation at entry, plus a validated fluent builder.

use std::time::Duration;

/// How many eviction tests to run per sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionBatch {
    /// Run exactly this many tests per sweep (clamped to the idle total).
    Absolute(usize),
    /// Run `ceil(total_idle / divisor)` tests per sweep.
    Fraction(usize),
}

/// Inputs the eviction policy sees for one idle wrapper.
#[derive(Debug, Clone, Copy)]
pub struct EvictionContext {
    pub idle_time: Duration,
    pub min_idle_time: Option<Duration>,
    pub soft_min_idle_time: Option<Duration>,
    pub min_idle_per_key: usize,
    pub idle_count_for_key: usize,
}

/// Pluggable eviction decision function.
pub trait EvictionPolicy: Send + Sync {
    fn should_evict(&self, ctx: &EvictionContext) -> bool;
}

/// Evict when `idle_time > min_idle_time`, or when
/// `idle_time > soft_min_idle_time && idle_count > min_idle_per_key`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEvictionPolicy;

impl EvictionPolicy for DefaultEvictionPolicy {
    fn should_evict(&self, ctx: &EvictionContext) -> bool {
        if let Some(min) = ctx.min_idle_time {
            if ctx.idle_time > min {
                return true;
            }
        }
        if let Some(soft) = ctx.soft_min_idle_time {
            if ctx.idle_time > soft && ctx.idle_count_for_key > ctx.min_idle_per_key {
                return true;
            }
        }
        false
    }
}

/// Snapshot-by-value configuration for a [`crate::engine::Pool`].
///
/// Each public engine operation reads the fields it needs into locals at
/// entry, so a concurrent `Pool::set_config` cannot tear a single call's
/// view of the policy.
#[derive(Clone)]
pub struct PoolConfig {
    pub max_total_per_key: Option<usize>,
    pub max_total: Option<usize>,
    pub max_idle_per_key: Option<usize>,
    pub min_idle_per_key: usize,
    pub max_wait: Option<Duration>,
    pub block_when_exhausted: bool,
    pub lifo: bool,
    pub test_on_borrow: bool,
    pub test_on_return: bool,
    pub test_while_idle: bool,
    pub num_tests_per_eviction_run: EvictionBatch,
    pub min_evictable_idle_time: Option<Duration>,
    pub soft_min_evictable_idle_time: Option<Duration>,
    pub time_between_eviction_runs: Option<Duration>,
    pub swallowed_exception_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_total_per_key: Some(8),
            max_total: None,
            max_idle_per_key: Some(8),
            min_idle_per_key: 0,
            max_wait: None,
            block_when_exhausted: true,
            lifo: true,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            num_tests_per_eviction_run: EvictionBatch::Absolute(3),
            min_evictable_idle_time: Some(Duration::from_secs(30 * 60)),
            soft_min_evictable_idle_time: None,
            time_between_eviction_runs: None,
            swallowed_exception_capacity: 100,
        }
    }
}

impl PoolConfig {
    /// `min_idle_per_key` is effectively capped at `max_idle_per_key`.
    pub(crate) fn effective_min_idle_per_key(&self) -> usize {
        match self.max_idle_per_key {
            Some(max) => self.min_idle_per_key.min(max),
            None => self.min_idle_per_key,
        }
    }

    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }
}

/// Fluent, validating builder for [`PoolConfig`].
#[derive(Clone)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        PoolConfigBuilder {
            config: PoolConfig::default(),
        }
    }
}

/// Error returned by [`PoolConfigBuilder::build`] when options are
/// internally inconsistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid pool configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

macro_rules! setter {
    ($name:ident, $field:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.config.$field = value;
            self
        }
    };
}

impl PoolConfigBuilder {
    setter!(max_total_per_key, max_total_per_key, Option<usize>);
    setter!(max_total, max_total, Option<usize>);
    setter!(max_idle_per_key, max_idle_per_key, Option<usize>);
    setter!(min_idle_per_key, min_idle_per_key, usize);
    setter!(max_wait, max_wait, Option<Duration>);
    setter!(block_when_exhausted, block_when_exhausted, bool);
    setter!(lifo, lifo, bool);
    setter!(test_on_borrow, test_on_borrow, bool);
    setter!(test_on_return, test_on_return, bool);
    setter!(test_while_idle, test_while_idle, bool);
    setter!(num_tests_per_eviction_run, num_tests_per_eviction_run, EvictionBatch);
    setter!(min_evictable_idle_time, min_evictable_idle_time, Option<Duration>);
    setter!(soft_min_evictable_idle_time, soft_min_evictable_idle_time, Option<Duration>);
    setter!(time_between_eviction_runs, time_between_eviction_runs, Option<Duration>);
    setter!(swallowed_exception_capacity, swallowed_exception_capacity, usize);

    pub fn build(self) -> Result<PoolConfig, ConfigError> {
        let c = &self.config;
        if let (Some(max_idle), Some(max_total)) = (c.max_idle_per_key, c.max_total_per_key) {
            if max_idle > max_total {
                return Err(ConfigError(format!(
                    "max_idle_per_key ({max_idle}) cannot exceed max_total_per_key ({max_total})"
                )));
            }
        }
        if c.swallowed_exception_capacity == 0 {
            return Err(ConfigError("swallowed_exception_capacity must be at least 1".into()));
        }
        if let EvictionBatch::Fraction(0) = c.num_tests_per_eviction_run {
            return Err(ConfigError("num_tests_per_eviction_run fraction divisor must be nonzero".into()));
        }
        Ok(self.config)
    }
}
