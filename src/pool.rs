//! Single resource pool
//!
//! `Pool<F>` caches idle resources produced by a [`Factory`], bounds the
//! number of concurrently borrowed resources, suspends borrowers when the
//! bound is reached, and lets the shared evictor sweep stale idle entries.
//!
//! All pool state lives behind one `parking_lot::Mutex`; factory callbacks
//! always run with the lock released. Capacity for a new resource is
//! reserved before `make` runs and committed or rolled back afterwards, so
//! `num_active()` only ever reports committed allocations.

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::{ExhaustedAction, PoolConfig};
use crate::entry::{Entry, EntryState};
use crate::error::{BoxError, Error, LifecycleStage, Result};
use crate::evictor;
use crate::factory::Factory;
use crate::idle::{CursorId, IdleDeque};

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total successful borrows.
    pub total_borrows: u64,
    /// Total returns, whether pooled or destroyed.
    pub total_returns: u64,
    /// Total resources ever created.
    pub created: u64,
    /// Total resources ever destroyed.
    pub destroyed: u64,
    /// Resources destroyed by eviction sweeps (subset of `destroyed`).
    pub evicted: u64,
    /// Currently borrowed resources.
    pub active: usize,
    /// Currently idle resources.
    pub idle: usize,
    /// Borrowers currently suspended waiting for capacity.
    pub waiting: usize,
}

/// Monotonic counters kept under the pool lock.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) total_borrows: u64,
    pub(crate) total_returns: u64,
    pub(crate) created: u64,
    pub(crate) destroyed: u64,
    pub(crate) evicted: u64,
}

// ---------------------------------------------------------------------------
// Pool internals
// ---------------------------------------------------------------------------

struct PoolState<T> {
    config: PoolConfig,
    idle: IdleDeque<Entry<T>>,
    /// Committed allocations.
    active: usize,
    /// Slots reserved for in-flight `make` calls; not visible through
    /// `num_active()`.
    reserving: usize,
    closed: bool,
    evict_cursor: Option<CursorId>,
    evictor: Option<evictor::Registration>,
    counters: Counters,
}

impl<T> PoolState<T> {
    fn pop_idle(&mut self) -> Option<Entry<T>> {
        if self.config.lifo {
            self.idle.pop_newest()
        } else {
            self.idle.pop_oldest()
        }
    }

    fn has_capacity(&self) -> bool {
        match self.config.max_active {
            None => true,
            Some(max) => self.active + self.reserving < max,
        }
    }

    fn idle_full(&self) -> bool {
        match self.config.max_idle {
            None => false,
            Some(max) => self.idle.len() >= max,
        }
    }
}

pub(crate) struct PoolInner<F: Factory> {
    factory: F,
    state: Mutex<PoolState<F::Resource>>,
    /// Broadcast on every event that may unblock a suspended borrower.
    wakeup: Notify,
    waiting: AtomicUsize,
}

/// What a borrow iteration decided to do while it held the lock.
enum BorrowPlan<T> {
    /// An idle entry was claimed; activate (and maybe validate) it.
    Idle(Entry<T>, bool),
    /// A slot was reserved; create a new resource.
    Make { test_on_borrow: bool },
    /// Capacity exhausted; suspend until woken or the deadline passes.
    Wait { deadline: Option<Instant> },
}

/// Decrements the waiter count even when the borrow future is cancelled
/// mid-wait.
struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Pool<F>
// ---------------------------------------------------------------------------

/// Pool of reusable resources produced by a [`Factory`].
///
/// Cloning is cheap and shares the same pool. Suspended borrowers are woken
/// in no particular order; fairness among waiters is not guaranteed.
pub struct Pool<F: Factory> {
    pub(crate) inner: Arc<PoolInner<F>>,
}

impl<F: Factory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: Factory> std::fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Pool").field("stats", &stats).finish()
    }
}

impl<F: Factory> Pool<F> {
    /// Create a new pool.
    ///
    /// When `config.evict_period` is set this must run inside a Tokio
    /// runtime, because the sweep is registered with the process-wide
    /// eviction scheduler.
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let evict_period = config.evict_period;
        let pool = Self {
            inner: Arc::new(PoolInner {
                factory,
                state: Mutex::new(PoolState {
                    config,
                    idle: IdleDeque::new(),
                    active: 0,
                    reserving: 0,
                    closed: false,
                    evict_cursor: None,
                    evictor: None,
                    counters: Counters::default(),
                }),
                wakeup: Notify::new(),
                waiting: AtomicUsize::new(0),
            }),
        };
        if let Some(period) = evict_period {
            if period > Duration::ZERO {
                pool.inner.state.lock().evictor =
                    Some(Self::schedule_eviction(&pool.inner, period));
            }
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(evictor = evict_period.is_some(), "created resource pool");
        pool
    }

    fn schedule_eviction(
        inner: &Arc<PoolInner<F>>,
        period: Duration,
    ) -> evictor::Registration {
        let weak = Arc::downgrade(inner);
        evictor::register(
            period,
            Box::new(move || {
                weak.upgrade()
                    .map(|inner| -> futures::future::BoxFuture<'static, ()> {
                        Box::pin(async move {
                            Pool { inner }.evict().await;
                        })
                    })
            }),
        )
    }

    /// Borrow a resource, creating one through the factory if the idle set
    /// is empty and capacity remains.
    ///
    /// With `ExhaustedAction::Block` the call suspends until another
    /// borrower returns, an eviction frees `max_total` room, or the
    /// configured `max_wait` (measured from the start of this call) elapses.
    /// Dropping the returned future while suspended cleanly abandons the
    /// wait.
    pub async fn borrow(&self) -> Result<F::Resource> {
        let inner = &self.inner;
        let started = Instant::now();
        loop {
            let mut notified = pin!(inner.wakeup.notified());
            let plan = {
                let mut guard = inner.state.lock();
                let state = &mut *guard;
                if state.closed {
                    return Err(Error::Closed);
                }
                if let Some(mut entry) = state.pop_idle() {
                    entry.allocate();
                    state.active += 1;
                    BorrowPlan::Idle(entry, state.config.test_on_borrow)
                } else if state.has_capacity() {
                    state.reserving += 1;
                    BorrowPlan::Make {
                        test_on_borrow: state.config.test_on_borrow,
                    }
                } else {
                    match state.config.when_exhausted {
                        ExhaustedAction::Fail => {
                            return Err(Error::Exhausted {
                                active: state.active,
                                max_active: state.config.max_active.unwrap_or(0),
                                waiters: inner.waiting.load(Ordering::Relaxed),
                                timed_out: false,
                            });
                        }
                        ExhaustedAction::Grow => {
                            state.reserving += 1;
                            BorrowPlan::Make {
                                test_on_borrow: state.config.test_on_borrow,
                            }
                        }
                        ExhaustedAction::Block => {
                            // Register for wakeups while still holding the
                            // lock so no broadcast can slip past.
                            notified.as_mut().enable();
                            BorrowPlan::Wait {
                                deadline: state.config.max_wait.map(|d| started + d),
                            }
                        }
                    }
                }
            };

            match plan {
                BorrowPlan::Idle(entry, test_on_borrow) => {
                    match self.prepare(entry.value, test_on_borrow).await {
                        Ok(value) => {
                            inner.state.lock().counters.total_borrows += 1;
                            return Ok(value);
                        }
                        Err(_) => {
                            // A pre-existing idle entry failed activation or
                            // validation: discard it and try another.
                            {
                                let mut state = inner.state.lock();
                                state.active = state.active.saturating_sub(1);
                                state.counters.destroyed += 1;
                            }
                            inner.wakeup.notify_waiters();
                        }
                    }
                }
                BorrowPlan::Make { test_on_borrow } => {
                    return self.make_for_borrow(test_on_borrow).await;
                }
                BorrowPlan::Wait { deadline } => {
                    inner.waiting.fetch_add(1, Ordering::Relaxed);
                    let _wait = WaitGuard(&inner.waiting);
                    match deadline {
                        Some(at) => {
                            if tokio::time::timeout_at(at, notified.as_mut())
                                .await
                                .is_err()
                            {
                                let state = inner.state.lock();
                                return Err(Error::Exhausted {
                                    active: state.active,
                                    max_active: state.config.max_active.unwrap_or(0),
                                    waiters: inner
                                        .waiting
                                        .load(Ordering::Relaxed)
                                        .saturating_sub(1),
                                    timed_out: true,
                                });
                            }
                        }
                        None => notified.as_mut().await,
                    }
                }
            }
        }
    }

    /// `make` + activate (+ validate) for a reserved slot.
    async fn make_for_borrow(&self, test_on_borrow: bool) -> Result<F::Resource> {
        let inner = &self.inner;
        match inner.factory.make().await {
            Err(source) => {
                inner.state.lock().reserving -= 1;
                inner.wakeup.notify_waiters();
                Err(Error::factory("make", source))
            }
            Ok(value) => {
                inner.state.lock().counters.created += 1;
                #[cfg(feature = "tracing")]
                tracing::debug!("created new resource");
                match self.prepare(value, test_on_borrow).await {
                    Ok(value) => {
                        let mut state = inner.state.lock();
                        state.reserving -= 1;
                        state.active += 1;
                        state.counters.total_borrows += 1;
                        Ok(value)
                    }
                    Err((stage, source)) => {
                        {
                            let mut state = inner.state.lock();
                            state.reserving -= 1;
                            state.counters.destroyed += 1;
                        }
                        inner.wakeup.notify_waiters();
                        Err(Error::rejected(stage, source))
                    }
                }
            }
        }
    }

    /// Activate and optionally validate a borrow candidate. Destroys the
    /// value on rejection (destroy errors swallowed) without touching pool
    /// counters.
    async fn prepare(
        &self,
        mut value: F::Resource,
        test: bool,
    ) -> std::result::Result<F::Resource, (LifecycleStage, Option<BoxError>)> {
        let factory = &self.inner.factory;
        if let Err(source) = factory.activate(&mut value).await {
            let _ = factory.destroy(value).await;
            return Err((LifecycleStage::Activate, Some(source)));
        }
        if test {
            let verdict = factory.validate(&value).await;
            let rejection = match verdict {
                Ok(true) => None,
                Ok(false) => Some(None),
                Err(source) => Some(Some(source)),
            };
            if let Some(source) = rejection {
                let _ = factory.destroy(value).await;
                return Err((LifecycleStage::Validate, source));
            }
        }
        Ok(value)
    }

    /// Return a borrowed resource to the pool.
    ///
    /// The resource is validated (if `test_on_return`) and passivated; on
    /// either failing, or when the pool is closed or `max_idle` is reached,
    /// it is destroyed instead of pooled. Destroy errors are swallowed here.
    pub async fn give_back(&self, mut value: F::Resource) {
        let inner = &self.inner;
        let test_on_return = inner.state.lock().config.test_on_return;
        if test_on_return && !matches!(inner.factory.validate(&value).await, Ok(true)) {
            self.discard_returned(value).await;
            return;
        }
        if inner.factory.passivate(&mut value).await.is_err() {
            self.discard_returned(value).await;
            return;
        }
        let mut rejected = Some(value);
        {
            let mut state = inner.state.lock();
            state.active = state.active.saturating_sub(1);
            state.counters.total_returns += 1;
            if !state.closed && !state.idle_full() {
                if let Some(value) = rejected.take() {
                    state.idle.push_newest(Entry::returned(value));
                }
            }
        }
        inner.wakeup.notify_waiters();
        if let Some(value) = rejected {
            let _ = inner.factory.destroy(value).await;
            inner.state.lock().counters.destroyed += 1;
        }
    }

    /// Destroy a returned value that failed validation or passivation.
    async fn discard_returned(&self, value: F::Resource) {
        let inner = &self.inner;
        let _ = inner.factory.destroy(value).await;
        {
            let mut state = inner.state.lock();
            state.active = state.active.saturating_sub(1);
            state.counters.total_returns += 1;
            state.counters.destroyed += 1;
        }
        inner.wakeup.notify_waiters();
        #[cfg(feature = "tracing")]
        tracing::debug!("destroyed resource rejected on return");
    }

    /// Destroy a borrowed resource instead of returning it.
    ///
    /// The only operation that propagates a `destroy` error.
    pub async fn invalidate(&self, value: F::Resource) -> Result<()> {
        let inner = &self.inner;
        let outcome = inner.factory.destroy(value).await;
        {
            let mut state = inner.state.lock();
            state.active = state.active.saturating_sub(1);
            state.counters.destroyed += 1;
        }
        inner.wakeup.notify_waiters();
        outcome.map_err(|source| Error::factory("destroy", source))
    }

    /// Create one resource and place it in the idle set, for pre-filling.
    pub async fn add_idle(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.state.lock().closed {
            return Err(Error::Closed);
        }
        let mut value = inner
            .factory
            .make()
            .await
            .map_err(|source| Error::factory("make", source))?;
        inner.state.lock().counters.created += 1;
        if let Err(source) = inner.factory.passivate(&mut value).await {
            let _ = inner.factory.destroy(value).await;
            inner.state.lock().counters.destroyed += 1;
            return Err(Error::rejected(LifecycleStage::Passivate, Some(source)));
        }
        let mut rejected = Some(value);
        {
            let mut state = inner.state.lock();
            if !state.closed && !state.idle_full() {
                if let Some(value) = rejected.take() {
                    state.idle.push_newest(Entry::idle(value));
                }
            }
        }
        inner.wakeup.notify_waiters();
        if let Some(value) = rejected {
            let _ = inner.factory.destroy(value).await;
            inner.state.lock().counters.destroyed += 1;
        }
        Ok(())
    }

    /// Destroy every idle resource. Borrowed resources are untouched.
    pub async fn clear(&self) {
        let inner = &self.inner;
        loop {
            let entry = { inner.state.lock().idle.pop_oldest() };
            let Some(entry) = entry else { break };
            let _ = inner.factory.destroy(entry.value).await;
            inner.state.lock().counters.destroyed += 1;
        }
    }

    /// Close the pool: destroy all idle resources and stop the eviction
    /// sweep. Further `borrow` / `add_idle` calls fail with
    /// [`Error::Closed`]; returning or invalidating outstanding resources
    /// stays valid and always destroys them. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.evictor = None;
            if let Some(cursor) = state.evict_cursor.take() {
                state.idle.close_cursor(cursor);
            }
        }
        self.clear().await;
        self.inner.wakeup.notify_waiters();
        #[cfg(feature = "tracing")]
        tracing::debug!("pool closed");
    }

    // -- Eviction -----------------------------------------------------------

    /// Run one eviction sweep: examine up to the configured work budget of
    /// idle entries from a persistent cursor, destroy those past
    /// `min_evictable_idle` (or failing the idle test), then restore
    /// `min_idle`.
    ///
    /// Normally driven by the shared scheduler every `evict_period`; exposed
    /// for hosts that prefer to drive eviction themselves.
    pub async fn evict(&self) {
        let inner = &self.inner;
        let budget = {
            let state = inner.state.lock();
            if state.closed {
                return;
            }
            state.config.eviction_budget(state.idle.len())
        };

        for _ in 0..budget {
            let step = {
                let mut guard = inner.state.lock();
                let state = &mut *guard;
                if state.closed {
                    SweepStep::Exhausted
                } else {
                    let cursor = match state.evict_cursor {
                        Some(cursor) => cursor,
                        None => {
                            let cursor = state.idle.open_cursor();
                            state.evict_cursor = Some(cursor);
                            cursor
                        }
                    };
                    match state.idle.cursor_next(cursor) {
                        None => {
                            state.idle.close_cursor(cursor);
                            state.evict_cursor = None;
                            SweepStep::Exhausted
                        }
                        Some(node) => {
                            let aged = state.config.min_evictable_idle.is_some_and(|limit| {
                                state
                                    .idle
                                    .get(node)
                                    .is_some_and(|entry| entry.idle_age() > limit)
                            });
                            if aged {
                                match state.idle.remove(node) {
                                    Some(mut entry) => {
                                        entry.state = EntryState::Invalid;
                                        SweepStep::Destroy(entry)
                                    }
                                    None => SweepStep::Keep,
                                }
                            } else if state.config.test_while_idle {
                                match state.idle.remove(node) {
                                    Some(mut entry) => {
                                        entry.state = EntryState::EvictionTest;
                                        SweepStep::Test(entry)
                                    }
                                    None => SweepStep::Keep,
                                }
                            } else {
                                SweepStep::Keep
                            }
                        }
                    }
                }
            };

            match step {
                SweepStep::Exhausted => break,
                SweepStep::Keep => {}
                SweepStep::Destroy(entry) => self.destroy_evicted(entry).await,
                SweepStep::Test(mut entry) => {
                    if self.idle_triad(&mut entry.value).await {
                        entry.state = EntryState::Idle;
                        let mut survivor = Some(entry);
                        {
                            let mut guard = inner.state.lock();
                            let state = &mut *guard;
                            if !state.closed {
                                if let Some(entry) = survivor.take() {
                                    // Back into the cursor gap: original
                                    // position, already swept.
                                    match state.evict_cursor {
                                        Some(cursor) => {
                                            state.idle.insert_at_cursor(cursor, entry);
                                        }
                                        None => {
                                            state.idle.push_oldest(entry);
                                        }
                                    }
                                }
                            }
                        }
                        if let Some(entry) = survivor {
                            // Pool closed while the triad ran.
                            let _ = inner.factory.destroy(entry.value).await;
                            inner.state.lock().counters.destroyed += 1;
                        }
                    } else {
                        self.destroy_evicted(entry).await;
                    }
                }
            }
        }

        self.ensure_min_idle().await;
    }

    async fn destroy_evicted(&self, entry: Entry<F::Resource>) {
        let inner = &self.inner;
        let _ = inner.factory.destroy(entry.value).await;
        {
            let mut state = inner.state.lock();
            state.counters.destroyed += 1;
            state.counters.evicted += 1;
        }
        inner.wakeup.notify_waiters();
        #[cfg(feature = "tracing")]
        tracing::debug!("evicted idle resource");
    }

    /// The idle-test triad. Rejection leaves destruction to the caller.
    async fn idle_triad(&self, value: &mut F::Resource) -> bool {
        let factory = &self.inner.factory;
        if factory.activate(value).await.is_err() {
            return false;
        }
        if !matches!(factory.validate(value).await, Ok(true)) {
            return false;
        }
        factory.passivate(value).await.is_ok()
    }

    /// Create idle resources until `min_idle` is restored. Creation failures
    /// are swallowed; the next sweep retries.
    async fn ensure_min_idle(&self) {
        let inner = &self.inner;
        loop {
            {
                let state = inner.state.lock();
                if state.closed
                    || state.idle.len() >= state.config.min_idle
                    || state.idle_full()
                {
                    return;
                }
            }
            let Ok(mut value) = inner.factory.make().await else {
                return;
            };
            inner.state.lock().counters.created += 1;
            if inner.factory.passivate(&mut value).await.is_err() {
                let _ = inner.factory.destroy(value).await;
                inner.state.lock().counters.destroyed += 1;
                return;
            }
            let mut rejected = Some(value);
            {
                let mut state = inner.state.lock();
                if !state.closed && state.idle.len() < state.config.min_idle && !state.idle_full()
                {
                    if let Some(value) = rejected.take() {
                        state.idle.push_newest(Entry::idle(value));
                    }
                }
            }
            inner.wakeup.notify_waiters();
            if let Some(value) = rejected {
                let _ = inner.factory.destroy(value).await;
                inner.state.lock().counters.destroyed += 1;
                return;
            }
        }
    }

    // -- Introspection ------------------------------------------------------

    /// Committed allocations. In-flight factory calls are not counted.
    pub fn num_active(&self) -> usize {
        self.inner.state.lock().active
    }

    /// Idle resources currently held by the pool.
    pub fn num_idle(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Whether `close()` has run.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> PoolConfig {
        self.inner.state.lock().config.clone()
    }

    /// Snapshot of the pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            total_borrows: state.counters.total_borrows,
            total_returns: state.counters.total_returns,
            created: state.counters.created,
            destroyed: state.counters.destroyed,
            evicted: state.counters.evicted,
            active: state.active,
            idle: state.idle.len(),
            waiting: self.inner.waiting.load(Ordering::Relaxed),
        }
    }

    // -- Runtime configuration ----------------------------------------------

    fn update_config(&self, mutate: impl FnOnce(&mut PoolConfig)) {
        {
            let mut state = self.inner.state.lock();
            mutate(&mut state.config);
        }
        // Capacity may have grown; let suspended borrowers re-check.
        self.inner.wakeup.notify_waiters();
    }

    /// Change the cap on concurrently borrowed resources.
    pub fn set_max_active(&self, max_active: Option<usize>) {
        self.update_config(|c| c.max_active = max_active);
    }

    /// Change the cap on idle resources.
    pub fn set_max_idle(&self, max_idle: Option<usize>) {
        self.update_config(|c| c.max_idle = max_idle);
    }

    /// Change the idle floor maintained by the evictor.
    pub fn set_min_idle(&self, min_idle: usize) {
        self.update_config(|c| c.min_idle = min_idle);
    }

    /// Change the exhaustion policy.
    pub fn set_when_exhausted(&self, action: ExhaustedAction) {
        self.update_config(|c| c.when_exhausted = action);
    }

    /// Change the bound on `Block` waits.
    pub fn set_max_wait(&self, max_wait: Option<Duration>) {
        self.update_config(|c| c.max_wait = max_wait);
    }

    /// Toggle validation at borrow time.
    pub fn set_test_on_borrow(&self, test: bool) {
        self.update_config(|c| c.test_on_borrow = test);
    }

    /// Toggle validation at return time.
    pub fn set_test_on_return(&self, test: bool) {
        self.update_config(|c| c.test_on_return = test);
    }

    /// Toggle the idle test during eviction sweeps.
    pub fn set_test_while_idle(&self, test: bool) {
        self.update_config(|c| c.test_while_idle = test);
    }

    /// Change the sweep work budget.
    pub fn set_num_tests_per_run(&self, num_tests: i32) {
        self.update_config(|c| c.num_tests_per_run = num_tests);
    }

    /// Change the idle age beyond which entries are evicted.
    pub fn set_min_evictable_idle(&self, age: Option<Duration>) {
        self.update_config(|c| c.min_evictable_idle = age);
    }

    /// Switch between most-recently-returned-first and
    /// least-recently-returned-first service.
    pub fn set_lifo(&self, lifo: bool) {
        self.update_config(|c| c.lifo = lifo);
    }

    /// Change the eviction period. `None` (or a zero period) stops the
    /// sweep; any in-flight sweep runs to completion.
    pub fn set_evict_period(&self, period: Option<Duration>) {
        let mut state = self.inner.state.lock();
        state.config.evict_period = period;
        state.evictor = match period {
            Some(p) if p > Duration::ZERO && !state.closed => {
                Some(Self::schedule_eviction(&self.inner, p))
            }
            _ => None,
        };
    }
}

enum SweepStep<T> {
    /// Cursor exhausted or pool closed; stop this sweep.
    Exhausted,
    /// Entry stays idle.
    Keep,
    /// Entry aged out or failed the idle test.
    Destroy(Entry<T>),
    /// Entry held out for the idle test.
    Test(Entry<T>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use std::sync::atomic::AtomicU64;

    /// Factory producing consecutive integers, counting lifecycle calls.
    #[derive(Default)]
    struct CountingFactory {
        made: AtomicU64,
        destroyed: AtomicU64,
    }

    impl Factory for CountingFactory {
        type Resource = u64;

        async fn make(&self) -> std::result::Result<u64, BoxError> {
            Ok(self.made.fetch_add(1, Ordering::SeqCst))
        }

        async fn destroy(&self, _resource: u64) -> std::result::Result<(), BoxError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn small_pool(max_active: usize) -> Pool<CountingFactory> {
        Pool::new(
            CountingFactory::default(),
            PoolConfig {
                max_active: Some(max_active),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn borrow_creates_then_reuses() {
        let pool = small_pool(4);
        let v = pool.borrow().await.unwrap();
        assert_eq!(v, 0);
        assert_eq!(pool.num_active(), 1);
        pool.give_back(v).await;
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.num_idle(), 1);

        let v = pool.borrow().await.unwrap();
        assert_eq!(v, 0, "idle resource is reused");
        assert_eq!(pool.stats().created, 1);
        pool.give_back(v).await;
    }

    #[tokio::test]
    async fn fail_policy_errors_immediately() {
        let pool = Pool::new(
            CountingFactory::default(),
            PoolConfig {
                max_active: Some(1),
                when_exhausted: ExhaustedAction::Fail,
                ..Default::default()
            },
        );
        let held = pool.borrow().await.unwrap();
        let err = pool.borrow().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Exhausted {
                timed_out: false,
                ..
            }
        ));
        pool.give_back(held).await;
        let v = pool.borrow().await.unwrap();
        pool.give_back(v).await;
    }

    #[tokio::test]
    async fn grow_policy_exceeds_max_active() {
        let pool = Pool::new(
            CountingFactory::default(),
            PoolConfig {
                max_active: Some(1),
                when_exhausted: ExhaustedAction::Grow,
                ..Default::default()
            },
        );
        let a = pool.borrow().await.unwrap();
        let b = pool.borrow().await.unwrap();
        assert_eq!(pool.num_active(), 2);
        pool.give_back(a).await;
        pool.give_back(b).await;
    }

    #[tokio::test]
    async fn invalidate_destroys_and_frees_capacity() {
        let pool = small_pool(1);
        let v = pool.borrow().await.unwrap();
        pool.invalidate(v).await.unwrap();
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.inner.factory.destroyed.load(Ordering::SeqCst), 1);
        // The invalidated value is gone; the next borrow creates a new one.
        let v = pool.borrow().await.unwrap();
        assert_eq!(v, 1);
        pool.give_back(v).await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_borrows() {
        let pool = small_pool(2);
        let held = pool.borrow().await.unwrap();
        pool.add_idle().await.unwrap();
        pool.close().await;
        pool.close().await;
        assert_eq!(pool.num_idle(), 0);
        assert!(matches!(pool.borrow().await, Err(Error::Closed)));
        assert!(matches!(pool.add_idle().await, Err(Error::Closed)));
        // Outstanding resources are destroyed on return.
        pool.give_back(held).await;
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.inner.factory.destroyed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn max_idle_overflow_destroys_returned_value() {
        let pool = Pool::new(
            CountingFactory::default(),
            PoolConfig {
                max_active: Some(4),
                max_idle: Some(1),
                ..Default::default()
            },
        );
        let a = pool.borrow().await.unwrap();
        let b = pool.borrow().await.unwrap();
        pool.give_back(a).await;
        pool.give_back(b).await;
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(pool.inner.factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_destroys_only_idle() {
        let pool = small_pool(4);
        let held = pool.borrow().await.unwrap();
        pool.add_idle().await.unwrap();
        pool.add_idle().await.unwrap();
        pool.clear().await;
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.num_active(), 1);
        assert_eq!(pool.inner.factory.destroyed.load(Ordering::SeqCst), 2);
        pool.give_back(held).await;
        assert_eq!(pool.num_idle(), 1);
    }

    #[tokio::test]
    async fn manual_evict_removes_aged_entries() {
        let pool = Pool::new(
            CountingFactory::default(),
            PoolConfig {
                max_active: Some(8),
                num_tests_per_run: -1,
                min_evictable_idle: Some(Duration::from_millis(1)),
                ..Default::default()
            },
        );
        pool.add_idle().await.unwrap();
        pool.add_idle().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.evict().await;
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.stats().evicted, 2);
    }

    #[tokio::test]
    async fn evict_restores_min_idle() {
        let pool = Pool::new(
            CountingFactory::default(),
            PoolConfig {
                max_active: Some(8),
                min_idle: 2,
                min_evictable_idle: None,
                ..Default::default()
            },
        );
        pool.evict().await;
        assert_eq!(pool.num_idle(), 2);
        // A second sweep does not overshoot.
        pool.evict().await;
        assert_eq!(pool.num_idle(), 2);
    }

    #[tokio::test]
    async fn runtime_config_change_takes_effect() {
        let pool = small_pool(1);
        pool.set_when_exhausted(ExhaustedAction::Fail);
        let held = pool.borrow().await.unwrap();
        assert!(pool.borrow().await.is_err());
        pool.set_max_active(Some(2));
        let second = pool.borrow().await.unwrap();
        pool.give_back(held).await;
        pool.give_back(second).await;
    }
}
