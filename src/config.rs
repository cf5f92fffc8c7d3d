//! Pool configuration types

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// What `borrow` does when the allocation cap is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ExhaustedAction {
    /// Fail immediately with [`Error::Exhausted`](crate::Error::Exhausted).
    Fail,
    /// Suspend until capacity appears or `max_wait` elapses.
    #[default]
    Block,
    /// Create a new resource anyway, exceeding `max_active`.
    Grow,
}

impl std::fmt::Display for ExhaustedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Fail => "fail",
            Self::Block => "block",
            Self::Grow => "grow",
        })
    }
}

impl std::str::FromStr for ExhaustedAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "fail" => Ok(Self::Fail),
            "block" => Ok(Self::Block),
            "grow" => Ok(Self::Grow),
            other => Err(Error::configuration(format!(
                "unknown exhaustion policy '{other}' (expected fail, block or grow)"
            ))),
        }
    }
}

/// Configuration for a [`Pool`](crate::Pool) or [`KeyedPool`](crate::KeyedPool).
///
/// Every option can also be changed on a live pool through the `set_*`
/// methods; changes take effect on the next operation.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolConfig {
    /// Cap on concurrently allocated resources; `None` = unbounded.
    /// Interpreted per key by keyed pools.
    pub max_active: Option<usize>,
    /// Cap on idle resources; returns beyond it destroy the returned value.
    /// `None` = unbounded. Interpreted per key by keyed pools.
    pub max_idle: Option<usize>,
    /// Floor the evictor maintains by creating new idle resources.
    /// Interpreted per key by keyed pools.
    pub min_idle: usize,
    /// Cap on allocated plus idle resources across all keys. Keyed pools
    /// only; ignored by `Pool`. `None` = unbounded.
    pub max_total: Option<usize>,
    /// Behavior when `max_active` is reached.
    pub when_exhausted: ExhaustedAction,
    /// Upper bound on `Block` waits, measured from the start of the borrow
    /// call. `None` = wait forever.
    pub max_wait: Option<Duration>,
    /// Consult `Factory::validate` when handing out a resource.
    pub test_on_borrow: bool,
    /// Consult `Factory::validate` when a resource is returned.
    pub test_on_return: bool,
    /// Run the activate/validate/passivate triad on idle resources during
    /// eviction sweeps.
    pub test_while_idle: bool,
    /// Period of the idle-eviction sweep. `None` = no evictor.
    pub evict_period: Option<Duration>,
    /// Work budget per sweep. Non-negative values are used verbatim; a
    /// negative value `-n` means roughly one `n`-th of the idle resources,
    /// rounded up.
    pub num_tests_per_run: i32,
    /// Idle age beyond which an entry is eligible for eviction.
    /// `None` = never evict on age alone.
    pub min_evictable_idle: Option<Duration>,
    /// Serve idle resources most recently returned first (`true`) or least
    /// recently returned first (`false`).
    pub lifo: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: Some(8),
            max_idle: Some(8),
            min_idle: 0,
            max_total: None,
            when_exhausted: ExhaustedAction::Block,
            max_wait: None,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            evict_period: None,
            num_tests_per_run: 3,
            min_evictable_idle: Some(Duration::from_secs(30 * 60)),
            lifo: true,
        }
    }
}

impl PoolConfig {
    /// Number of idle entries one eviction sweep examines.
    pub(crate) fn eviction_budget(&self, idle: usize) -> usize {
        if self.num_tests_per_run >= 0 {
            self.num_tests_per_run as usize
        } else {
            idle.div_ceil(self.num_tests_per_run.unsigned_abs() as usize)
        }
    }
}
