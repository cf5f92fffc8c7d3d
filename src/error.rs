//! Error types for pool operations
use thiserror::Error;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error produced by factory callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The lifecycle stage at which a freshly created resource was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStage {
    /// `Factory::activate` failed.
    Activate,
    /// `Factory::validate` returned `false` or failed.
    Validate,
    /// `Factory::passivate` failed.
    Passivate,
}

impl std::fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Activate => "activate",
            Self::Validate => "validate",
            Self::Passivate => "passivate",
        })
    }
}

/// Error type for pool operations
#[derive(Error, Debug)]
pub enum Error {
    /// The pool has been closed; no further borrows are served.
    #[error("pool is closed")]
    Closed,

    /// Capacity is exhausted and the exhaustion policy gave up.
    #[error(
        "pool exhausted: {active}/{max_active} active, {waiters} waiting{}",
        if *timed_out { " (wait timed out)" } else { "" }
    )]
    Exhausted {
        /// Committed allocations at the time of failure.
        active: usize,
        /// The `max_active` bound in effect.
        max_active: usize,
        /// Number of borrowers blocked at the time of failure.
        waiters: usize,
        /// Whether a bounded wait elapsed before capacity appeared.
        timed_out: bool,
    },

    /// A newly created resource failed activation, validation or passivation.
    #[error("newly created resource rejected at {stage}")]
    NoValidResource {
        /// The stage that rejected the resource.
        stage: LifecycleStage,
        /// The factory's own error, when the stage failed rather than
        /// returning `false`.
        #[source]
        source: Option<BoxError>,
    },

    /// The factory itself failed.
    #[error("factory error during {operation}")]
    Factory {
        /// The factory callback that failed (`make` or `destroy`).
        operation: &'static str,
        /// The factory's own error.
        #[source]
        source: BoxError,
    },

    /// Invalid configuration input.
    #[error("configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },
}

impl Error {
    /// Create a configuration error.
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Wrap a factory error from the named callback.
    pub fn factory(operation: &'static str, source: BoxError) -> Self {
        Self::Factory { operation, source }
    }

    pub(crate) fn rejected(stage: LifecycleStage, source: Option<BoxError>) -> Self {
        Self::NoValidResource { stage, source }
    }

    /// Whether retrying the failed operation may succeed without intervention.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}
