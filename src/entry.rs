//! Pooled entry lifecycle wrapper

// `tokio::time::Instant` so idle ages respect the paused test clock; it is
// a thin wrapper over `std::time::Instant` outside tests.
use tokio::time::Instant;

/// Lifecycle state of a pooled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    /// Held by the pool, reachable from exactly one idle structure.
    Idle,
    /// Lent to a borrower, reachable from no idle structure.
    Allocated,
    /// Held out of the idle structure by the evictor while the
    /// activate/validate/passivate triad runs.
    EvictionTest,
    /// Marked for destruction; terminal.
    Invalid,
}

/// One managed resource together with its state and timestamps.
pub(crate) struct Entry<T> {
    pub(crate) value: T,
    pub(crate) state: EntryState,
    pub(crate) created_at: Instant,
    pub(crate) last_idle_at: Instant,
    pub(crate) last_borrow_at: Option<Instant>,
    pub(crate) last_return_at: Option<Instant>,
}

impl<T> Entry<T> {
    /// Wrap a value entering the idle set (via `add_idle` or a return).
    pub(crate) fn idle(value: T) -> Self {
        let now = Instant::now();
        Self {
            value,
            state: EntryState::Idle,
            created_at: now,
            last_idle_at: now,
            last_borrow_at: None,
            last_return_at: None,
        }
    }

    /// Wrap a value returned by a borrower.
    pub(crate) fn returned(value: T) -> Self {
        let now = Instant::now();
        Self {
            last_return_at: Some(now),
            ..Self::idle(value)
        }
    }

    /// Transition to `Allocated` on the way out to a borrower.
    pub(crate) fn allocate(&mut self) {
        self.state = EntryState::Allocated;
        self.last_borrow_at = Some(Instant::now());
    }

    /// How long this entry has been idle.
    pub(crate) fn idle_age(&self) -> std::time::Duration {
        self.last_idle_at.elapsed()
    }
}

impl<T> std::fmt::Debug for Entry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("state", &self.state)
            .field("created_at", &self.created_at)
            .field("last_idle_at", &self.last_idle_at)
            .field("last_borrow_at", &self.last_borrow_at)
            .field("last_return_at", &self.last_return_at)
            .finish_non_exhaustive()
    }
}
