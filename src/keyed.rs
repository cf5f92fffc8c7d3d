//! Keyed resource pool
//!
//! `KeyedPool<F>` multiplexes one sub-pool per opaque key. `max_active` /
//! `max_idle` / `min_idle` apply per key; `max_total` additionally bounds
//! allocated plus idle resources across all keys. When the total cap is hit,
//! a borrow first reclaims the least recently used idle resource of *any*
//! key before falling back to the exhaustion policy.
//!
//! One broadcast wakes every suspended borrower regardless of key; each
//! re-checks its own key's capacity and the total cap.

use std::collections::{HashMap, HashSet};
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
use crate::factory::KeyedFactory;
use crate::idle::{CursorId, IdleDeque, NodeId};
use crate::pool::{Counters, PoolStats};

// ---------------------------------------------------------------------------
// Keyed state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct KeyCounts {
    active: usize,
    reserving: usize,
}

impl KeyCounts {
    fn is_zero(self) -> bool {
        self.active == 0 && self.reserving == 0
    }
}

/// Persistent position of the cross-key eviction sweep.
struct SweepCursor<K> {
    /// Cursor over the key list.
    keys: CursorId,
    /// Key currently being walked and the cursor into its idle set.
    current: Option<(K, CursorId)>,
}

struct KeyedState<K, T> {
    config: PoolConfig,
    /// Idle entries per key; rows exist only while non-empty.
    pools: HashMap<K, IdleDeque<Entry<T>>>,
    /// Active / in-flight counts per key; rows exist only while non-zero.
    counts: HashMap<K, KeyCounts>,
    /// Ordered list of the keys with non-empty idle sets, walked by the
    /// evictor.
    key_list: IdleDeque<K>,
    key_nodes: HashMap<K, NodeId>,
    idle_total: usize,
    active_total: usize,
    reserving_total: usize,
    closed: bool,
    sweep: Option<SweepCursor<K>>,
    evictor: Option<evictor::Registration>,
    counters: Counters,
}

impl<K, T> KeyedState<K, T>
where
    K: Eq + std::hash::Hash + Clone,
{
    fn total_in_use(&self) -> usize {
        self.active_total + self.reserving_total + self.idle_total
    }

    fn total_full(&self) -> bool {
        self.config
            .max_total
            .is_some_and(|max| self.total_in_use() >= max)
    }

    fn key_counts(&self, key: &K) -> KeyCounts {
        self.counts.get(key).copied().unwrap_or_default()
    }

    fn has_key_capacity(&self, key: &K) -> bool {
        match self.config.max_active {
            None => true,
            Some(max) => {
                let counts = self.key_counts(key);
                counts.active + counts.reserving < max
            }
        }
    }

    fn key_idle_len(&self, key: &K) -> usize {
        self.pools.get(key).map_or(0, IdleDeque::len)
    }

    fn key_idle_full(&self, key: &K) -> bool {
        self.config
            .max_idle
            .is_some_and(|max| self.key_idle_len(key) >= max)
    }

    fn reserve(&mut self, key: &K) {
        self.counts.entry(key.clone()).or_default().reserving += 1;
        self.reserving_total += 1;
    }

    fn unreserve(&mut self, key: &K) {
        if let Some(counts) = self.counts.get_mut(key) {
            counts.reserving = counts.reserving.saturating_sub(1);
            if counts.is_zero() {
                self.counts.remove(key);
            }
        }
        self.reserving_total = self.reserving_total.saturating_sub(1);
    }

    /// Flip a reservation into a committed allocation.
    fn commit(&mut self, key: &K) {
        if let Some(counts) = self.counts.get_mut(key) {
            counts.reserving = counts.reserving.saturating_sub(1);
            counts.active += 1;
        }
        self.reserving_total = self.reserving_total.saturating_sub(1);
        self.active_total += 1;
    }

    /// Record an allocation claimed straight from the idle set.
    fn allocate(&mut self, key: &K) {
        self.counts.entry(key.clone()).or_default().active += 1;
        self.active_total += 1;
    }

    /// Undo one committed allocation; count rows vanish at zero.
    fn release_active(&mut self, key: &K) {
        if let Some(counts) = self.counts.get_mut(key) {
            counts.active = counts.active.saturating_sub(1);
            if counts.is_zero() {
                self.counts.remove(key);
            }
        }
        self.active_total = self.active_total.saturating_sub(1);
    }

    /// Insert an idle entry, creating the sub-pool row and key-list node on
    /// the transition from empty.
    fn push_idle(&mut self, key: &K, entry: Entry<T>) {
        let deque = self.pools.entry(key.clone()).or_insert_with(IdleDeque::new);
        let was_empty = deque.is_empty();
        deque.push_newest(entry);
        self.idle_total += 1;
        if was_empty {
            let node = self.key_list.push_newest(key.clone());
            self.key_nodes.insert(key.clone(), node);
        }
    }

    /// Claim an idle entry for a borrower according to `lifo`.
    fn pop_idle(&mut self, key: &K) -> Option<Entry<T>> {
        let deque = self.pools.get_mut(key)?;
        let entry = if self.config.lifo {
            deque.pop_newest()
        } else {
            deque.pop_oldest()
        }?;
        self.idle_total -= 1;
        self.after_idle_removal(key);
        Some(entry)
    }

    /// Drop empty sub-pool rows and their key-list node; invalidates any
    /// sweep position inside the vanished row.
    fn after_idle_removal(&mut self, key: &K) {
        let emptied = self.pools.get(key).is_some_and(IdleDeque::is_empty);
        if !emptied {
            return;
        }
        self.pools.remove(key);
        if let Some(node) = self.key_nodes.remove(key) {
            self.key_list.remove(node);
        }
        if let Some(sweep) = &mut self.sweep {
            if sweep.current.as_ref().is_some_and(|(k, _)| k == key) {
                sweep.current = None;
            }
        }
    }

    /// The least recently used idle entry across all keys, removed.
    fn lru_idle_victim(&mut self) -> Option<(K, Entry<T>)> {
        let mut best: Option<(K, Instant)> = None;
        for (key, deque) in &self.pools {
            if let Some((_, entry)) = deque.peek_oldest() {
                if best
                    .as_ref()
                    .is_none_or(|(_, oldest)| entry.last_idle_at < *oldest)
                {
                    best = Some((key.clone(), entry.last_idle_at));
                }
            }
        }
        let (key, _) = best?;
        let entry = self.pools.get_mut(&key)?.pop_oldest()?;
        self.idle_total -= 1;
        self.after_idle_removal(&key);
        Some((key, entry))
    }

    /// Pop one idle entry from any key, oldest key first. For draining.
    fn pop_any_idle(&mut self) -> Option<(K, Entry<T>)> {
        let (_, key) = self.key_list.peek_oldest()?;
        let key = key.clone();
        let entry = self.pop_idle_any_order(&key)?;
        Some((key, entry))
    }

    fn pop_idle_any_order(&mut self, key: &K) -> Option<Entry<T>> {
        let entry = self.pools.get_mut(key)?.pop_oldest()?;
        self.idle_total -= 1;
        self.after_idle_removal(key);
        Some(entry)
    }
}

pub(crate) struct KeyedInner<F: KeyedFactory> {
    factory: F,
    state: Mutex<KeyedState<F::Key, F::Resource>>,
    wakeup: Notify,
    waiting: AtomicUsize,
}

enum BorrowPlan<K, T> {
    Idle(Entry<T>, bool),
    Make { test_on_borrow: bool },
    /// Destroy the reclaimed LRU idle entry (owned by the carried key),
    /// then retry.
    Reclaim(K, Entry<T>),
    Wait { deadline: Option<Instant> },
}

enum SweepStep<K, T> {
    Exhausted,
    /// Advanced to the next key, or skipped an entry that stays idle.
    Advance,
    Destroy(K, Entry<T>),
    Test(K, Entry<T>),
}

struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// KeyedPool<F>
// ---------------------------------------------------------------------------

/// Pool of reusable resources multiplexed over opaque keys.
///
/// Cloning is cheap and shares the same pool.
pub struct KeyedPool<F: KeyedFactory> {
    pub(crate) inner: Arc<KeyedInner<F>>,
}

impl<F: KeyedFactory> Clone for KeyedPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: KeyedFactory> std::fmt::Debug for KeyedPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("KeyedPool").field("stats", &stats).finish()
    }
}

impl<F: KeyedFactory> KeyedPool<F> {
    /// Create a new keyed pool.
    ///
    /// When `config.evict_period` is set this must run inside a Tokio
    /// runtime (the sweep is registered with the process-wide scheduler).
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let evict_period = config.evict_period;
        let pool = Self {
            inner: Arc::new(KeyedInner {
                factory,
                state: Mutex::new(KeyedState {
                    config,
                    pools: HashMap::new(),
                    counts: HashMap::new(),
                    key_list: IdleDeque::new(),
                    key_nodes: HashMap::new(),
                    idle_total: 0,
                    active_total: 0,
                    reserving_total: 0,
                    closed: false,
                    sweep: None,
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
        tracing::debug!(evictor = evict_period.is_some(), "created keyed resource pool");
        pool
    }

    fn schedule_eviction(
        inner: &Arc<KeyedInner<F>>,
        period: Duration,
    ) -> evictor::Registration {
        let weak = Arc::downgrade(inner);
        evictor::register(
            period,
            Box::new(move || {
                weak.upgrade()
                    .map(|inner| -> futures::future::BoxFuture<'static, ()> {
                        Box::pin(async move {
                            KeyedPool { inner }.evict().await;
                        })
                    })
            }),
        )
    }

    /// Borrow a resource for `key`, creating one if the key's idle set is
    /// empty and both the per-key and total caps leave room.
    ///
    /// When `max_total` is reached, the least recently used idle resource of
    /// any key is destroyed to make room before the exhaustion policy
    /// applies.
    pub async fn borrow(&self, key: &F::Key) -> Result<F::Resource> {
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
                if let Some(mut entry) = state.pop_idle(key) {
                    entry.allocate();
                    state.allocate(key);
                    BorrowPlan::Idle(entry, state.config.test_on_borrow)
                } else {
                    let mut reclaimed = None;
                    if state.total_full() {
                        reclaimed = state.lru_idle_victim();
                    }
                    match reclaimed {
                        Some((victim_key, entry)) => BorrowPlan::Reclaim(victim_key, entry),
                        None if !state.total_full() && state.has_key_capacity(key) => {
                            state.reserve(key);
                            BorrowPlan::Make {
                                test_on_borrow: state.config.test_on_borrow,
                            }
                        }
                        None => match state.config.when_exhausted {
                            ExhaustedAction::Fail => {
                                return Err(Error::Exhausted {
                                    active: state.key_counts(key).active,
                                    max_active: state.config.max_active.unwrap_or(0),
                                    waiters: inner.waiting.load(Ordering::Relaxed),
                                    timed_out: false,
                                });
                            }
                            ExhaustedAction::Grow => {
                                state.reserve(key);
                                BorrowPlan::Make {
                                    test_on_borrow: state.config.test_on_borrow,
                                }
                            }
                            ExhaustedAction::Block => {
                                notified.as_mut().enable();
                                BorrowPlan::Wait {
                                    deadline: state.config.max_wait.map(|d| started + d),
                                }
                            }
                        },
                    }
                }
            };

            match plan {
                BorrowPlan::Idle(entry, test_on_borrow) => {
                    match self.prepare(key, entry.value, test_on_borrow).await {
                        Ok(value) => {
                            inner.state.lock().counters.total_borrows += 1;
                            return Ok(value);
                        }
                        Err(_) => {
                            {
                                let mut state = inner.state.lock();
                                state.release_active(key);
                                state.counters.destroyed += 1;
                            }
                            inner.wakeup.notify_waiters();
                        }
                    }
                }
                BorrowPlan::Make { test_on_borrow } => {
                    return self.make_for_borrow(key, test_on_borrow).await;
                }
                BorrowPlan::Reclaim(victim_key, entry) => {
                    let _ = inner.factory.destroy(&victim_key, entry.value).await;
                    inner.state.lock().counters.destroyed += 1;
                    // Total room freed; waiters on other keys may proceed.
                    inner.wakeup.notify_waiters();
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
                                    active: state.key_counts(key).active,
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

    async fn make_for_borrow(&self, key: &F::Key, test_on_borrow: bool) -> Result<F::Resource> {
        let inner = &self.inner;
        match inner.factory.make(key).await {
            Err(source) => {
                inner.state.lock().unreserve(key);
                inner.wakeup.notify_waiters();
                Err(Error::factory("make", source))
            }
            Ok(value) => {
                inner.state.lock().counters.created += 1;
                #[cfg(feature = "tracing")]
                tracing::debug!(key = ?key, "created new resource");
                match self.prepare(key, value, test_on_borrow).await {
                    Ok(value) => {
                        let mut state = inner.state.lock();
                        state.commit(key);
                        state.counters.total_borrows += 1;
                        Ok(value)
                    }
                    Err((stage, source)) => {
                        {
                            let mut state = inner.state.lock();
                            state.unreserve(key);
                            state.counters.destroyed += 1;
                        }
                        inner.wakeup.notify_waiters();
                        Err(Error::rejected(stage, source))
                    }
                }
            }
        }
    }

    async fn prepare(
        &self,
        key: &F::Key,
        mut value: F::Resource,
        test: bool,
    ) -> std::result::Result<F::Resource, (LifecycleStage, Option<BoxError>)> {
        let factory = &self.inner.factory;
        if let Err(source) = factory.activate(key, &mut value).await {
            let _ = factory.destroy(key, value).await;
            return Err((LifecycleStage::Activate, Some(source)));
        }
        if test {
            let rejection = match factory.validate(key, &value).await {
                Ok(true) => None,
                Ok(false) => Some(None),
                Err(source) => Some(Some(source)),
            };
            if let Some(source) = rejection {
                let _ = factory.destroy(key, value).await;
                return Err((LifecycleStage::Validate, source));
            }
        }
        Ok(value)
    }

    /// Return a borrowed resource to its key's sub-pool.
    pub async fn give_back(&self, key: &F::Key, mut value: F::Resource) {
        let inner = &self.inner;
        let test_on_return = inner.state.lock().config.test_on_return;
        if test_on_return && !matches!(inner.factory.validate(key, &value).await, Ok(true)) {
            self.discard_returned(key, value).await;
            return;
        }
        if inner.factory.passivate(key, &mut value).await.is_err() {
            self.discard_returned(key, value).await;
            return;
        }
        let mut rejected = Some(value);
        {
            let mut state = inner.state.lock();
            state.release_active(key);
            state.counters.total_returns += 1;
            if !state.closed && !state.key_idle_full(key) {
                if let Some(value) = rejected.take() {
                    state.push_idle(key, Entry::returned(value));
                }
            }
        }
        inner.wakeup.notify_waiters();
        if let Some(value) = rejected {
            let _ = inner.factory.destroy(key, value).await;
            inner.state.lock().counters.destroyed += 1;
        }
    }

    async fn discard_returned(&self, key: &F::Key, value: F::Resource) {
        let inner = &self.inner;
        let _ = inner.factory.destroy(key, value).await;
        {
            let mut state = inner.state.lock();
            state.release_active(key);
            state.counters.total_returns += 1;
            state.counters.destroyed += 1;
        }
        inner.wakeup.notify_waiters();
    }

    /// Destroy a borrowed resource instead of returning it. The only
    /// operation that propagates a `destroy` error.
    pub async fn invalidate(&self, key: &F::Key, value: F::Resource) -> Result<()> {
        let inner = &self.inner;
        let outcome = inner.factory.destroy(key, value).await;
        {
            let mut state = inner.state.lock();
            state.release_active(key);
            state.counters.destroyed += 1;
        }
        inner.wakeup.notify_waiters();
        outcome.map_err(|source| Error::factory("destroy", source))
    }

    /// Create one resource for `key` and place it in the key's idle set.
    pub async fn add_idle(&self, key: &F::Key) -> Result<()> {
        let inner = &self.inner;
        if inner.state.lock().closed {
            return Err(Error::Closed);
        }
        let mut value = inner
            .factory
            .make(key)
            .await
            .map_err(|source| Error::factory("make", source))?;
        inner.state.lock().counters.created += 1;
        if let Err(source) = inner.factory.passivate(key, &mut value).await {
            let _ = inner.factory.destroy(key, value).await;
            inner.state.lock().counters.destroyed += 1;
            return Err(Error::rejected(LifecycleStage::Passivate, Some(source)));
        }
        let mut rejected = Some(value);
        {
            let mut state = inner.state.lock();
            if !state.closed && !state.key_idle_full(key) && !state.total_full() {
                if let Some(value) = rejected.take() {
                    state.push_idle(key, Entry::idle(value));
                }
            }
        }
        inner.wakeup.notify_waiters();
        if let Some(value) = rejected {
            let _ = inner.factory.destroy(key, value).await;
            inner.state.lock().counters.destroyed += 1;
        }
        Ok(())
    }

    /// Destroy every idle resource across all keys.
    pub async fn clear(&self) {
        let inner = &self.inner;
        loop {
            let popped = { inner.state.lock().pop_any_idle() };
            let Some((key, entry)) = popped else { break };
            let _ = inner.factory.destroy(&key, entry.value).await;
            inner.state.lock().counters.destroyed += 1;
        }
    }

    /// Destroy every idle resource of one key.
    pub async fn clear_key(&self, key: &F::Key) {
        let inner = &self.inner;
        loop {
            let entry = { inner.state.lock().pop_idle_any_order(key) };
            let Some(entry) = entry else { break };
            let _ = inner.factory.destroy(key, entry.value).await;
            inner.state.lock().counters.destroyed += 1;
        }
    }

    /// Close the pool: destroy all idle resources of every key and stop the
    /// eviction sweep. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.evictor = None;
            if let Some(sweep) = state.sweep.take() {
                state.key_list.close_cursor(sweep.keys);
            }
        }
        self.clear().await;
        self.inner.wakeup.notify_waiters();
        #[cfg(feature = "tracing")]
        tracing::debug!("keyed pool closed");
    }

    // -- Eviction -----------------------------------------------------------

    /// Run one eviction sweep across all keys.
    ///
    /// The work budget is shared: each unit either examines one idle entry
    /// or advances to the next key. Normally driven by the shared scheduler
    /// every `evict_period`.
    pub async fn evict(&self) {
        let inner = &self.inner;
        let budget = {
            let state = inner.state.lock();
            if state.closed {
                return;
            }
            state.config.eviction_budget(state.idle_total)
        };

        for _ in 0..budget {
            let step = {
                let mut guard = inner.state.lock();
                let state = &mut *guard;
                if state.closed {
                    SweepStep::Exhausted
                } else {
                    Self::sweep_step(state)
                }
            };

            match step {
                SweepStep::Exhausted => break,
                SweepStep::Advance => {}
                SweepStep::Destroy(key, entry) => self.destroy_evicted(&key, entry).await,
                SweepStep::Test(key, mut entry) => {
                    if self.idle_triad(&key, &mut entry.value).await {
                        entry.state = EntryState::Idle;
                        let mut survivor = Some(entry);
                        {
                            let mut guard = inner.state.lock();
                            let state = &mut *guard;
                            if !state.closed {
                                if let Some(entry) = survivor.take() {
                                    Self::reinsert_survivor(state, &key, entry);
                                }
                            }
                        }
                        if let Some(entry) = survivor {
                            let _ = inner.factory.destroy(&key, entry.value).await;
                            inner.state.lock().counters.destroyed += 1;
                        }
                    } else {
                        self.destroy_evicted(&key, entry).await;
                    }
                }
            }
        }

        self.ensure_min_idle().await;
    }

    /// One unit of sweep work under the lock.
    fn sweep_step(state: &mut KeyedState<F::Key, F::Resource>) -> SweepStep<F::Key, F::Resource> {
        if state.sweep.is_none() {
            let keys = state.key_list.open_cursor();
            state.sweep = Some(SweepCursor {
                keys,
                current: None,
            });
        }
        let current = state
            .sweep
            .as_ref()
            .and_then(|sweep| sweep.current.clone());

        match current {
            None => {
                // Advance the outer cursor to the next key.
                let keys_cursor = state.sweep.as_ref().expect("sweep cursor is open").keys;
                match state.key_list.cursor_next(keys_cursor) {
                    None => {
                        state.key_list.close_cursor(keys_cursor);
                        state.sweep = None;
                        SweepStep::Exhausted
                    }
                    Some(node) => {
                        let Some(key) = state.key_list.get(node).cloned() else {
                            return SweepStep::Advance;
                        };
                        let Some(deque) = state.pools.get_mut(&key) else {
                            return SweepStep::Advance;
                        };
                        let entries = deque.open_cursor();
                        state.sweep.as_mut().expect("sweep cursor is open").current =
                            Some((key, entries));
                        SweepStep::Advance
                    }
                }
            }
            Some((key, entries)) => {
                let Some(deque) = state.pools.get_mut(&key) else {
                    // Row vanished while the sweep was parked on it.
                    state.sweep.as_mut().expect("sweep cursor is open").current = None;
                    return SweepStep::Advance;
                };
                match deque.cursor_next(entries) {
                    None => {
                        deque.close_cursor(entries);
                        state.sweep.as_mut().expect("sweep cursor is open").current = None;
                        SweepStep::Advance
                    }
                    Some(node) => {
                        let aged = state.config.min_evictable_idle.is_some_and(|limit| {
                            deque
                                .get(node)
                                .is_some_and(|entry| entry.idle_age() > limit)
                        });
                        if aged {
                            match deque.remove(node) {
                                Some(mut entry) => {
                                    entry.state = EntryState::Invalid;
                                    state.idle_total -= 1;
                                    state.after_idle_removal(&key);
                                    SweepStep::Destroy(key, entry)
                                }
                                None => SweepStep::Advance,
                            }
                        } else if state.config.test_while_idle {
                            match deque.remove(node) {
                                Some(mut entry) => {
                                    entry.state = EntryState::EvictionTest;
                                    state.idle_total -= 1;
                                    state.after_idle_removal(&key);
                                    SweepStep::Test(key, entry)
                                }
                                None => SweepStep::Advance,
                            }
                        } else {
                            SweepStep::Advance
                        }
                    }
                }
            }
        }
    }

    /// Put an entry that passed the idle test back where it was: into the
    /// sweep's entry-cursor gap when the sweep is still parked on its key,
    /// otherwise as a fresh idle entry.
    fn reinsert_survivor(
        state: &mut KeyedState<F::Key, F::Resource>,
        key: &F::Key,
        entry: Entry<F::Resource>,
    ) {
        let parked = state
            .sweep
            .as_ref()
            .and_then(|sweep| sweep.current.as_ref())
            .and_then(|(k, entries)| (k == key).then_some(*entries));
        match parked {
            Some(entries) => {
                if let Some(deque) = state.pools.get_mut(key) {
                    deque.insert_at_cursor(entries, entry);
                    state.idle_total += 1;
                } else {
                    state.push_idle(key, entry);
                }
            }
            None => state.push_idle(key, entry),
        }
    }

    async fn destroy_evicted(&self, key: &F::Key, entry: Entry<F::Resource>) {
        let inner = &self.inner;
        let _ = inner.factory.destroy(key, entry.value).await;
        {
            let mut state = inner.state.lock();
            state.counters.destroyed += 1;
            state.counters.evicted += 1;
        }
        inner.wakeup.notify_waiters();
        #[cfg(feature = "tracing")]
        tracing::debug!(key = ?key, "evicted idle resource");
    }

    async fn idle_triad(&self, key: &F::Key, value: &mut F::Resource) -> bool {
        let factory = &self.inner.factory;
        if factory.activate(key, value).await.is_err() {
            return false;
        }
        if !matches!(factory.validate(key, value).await, Ok(true)) {
            return false;
        }
        factory.passivate(key, value).await.is_ok()
    }

    /// Restore `min_idle` for every present key, bounded by `max_idle` and
    /// `max_total`. Creation failures are swallowed; the next sweep retries.
    async fn ensure_min_idle(&self) {
        let keys = {
            let state = self.inner.state.lock();
            if state.closed || state.config.min_idle == 0 {
                return;
            }
            Self::present_keys(&state)
        };
        for key in keys {
            self.ensure_key_min_idle(&key).await;
        }
    }

    async fn ensure_key_min_idle(&self, key: &F::Key) {
        let inner = &self.inner;
        loop {
            {
                let state = inner.state.lock();
                if state.closed
                    || state.key_idle_len(key) >= state.config.min_idle
                    || state.key_idle_full(key)
                    || state.total_full()
                {
                    return;
                }
            }
            let Ok(mut value) = inner.factory.make(key).await else {
                return;
            };
            inner.state.lock().counters.created += 1;
            if inner.factory.passivate(key, &mut value).await.is_err() {
                let _ = inner.factory.destroy(key, value).await;
                inner.state.lock().counters.destroyed += 1;
                return;
            }
            let mut rejected = Some(value);
            {
                let mut state = inner.state.lock();
                if !state.closed
                    && state.key_idle_len(key) < state.config.min_idle
                    && !state.key_idle_full(key)
                    && !state.total_full()
                {
                    if let Some(value) = rejected.take() {
                        state.push_idle(key, Entry::idle(value));
                    }
                }
            }
            inner.wakeup.notify_waiters();
            if let Some(value) = rejected {
                let _ = inner.factory.destroy(key, value).await;
                inner.state.lock().counters.destroyed += 1;
                return;
            }
        }
    }

    fn present_keys(state: &KeyedState<F::Key, F::Resource>) -> Vec<F::Key> {
        let mut keys: HashSet<F::Key> = state.pools.keys().cloned().collect();
        keys.extend(state.counts.keys().cloned());
        keys.into_iter().collect()
    }

    // -- Introspection ------------------------------------------------------

    /// Committed allocations across all keys.
    pub fn num_active(&self) -> usize {
        self.inner.state.lock().active_total
    }

    /// Committed allocations for one key.
    pub fn num_active_key(&self, key: &F::Key) -> usize {
        self.inner.state.lock().key_counts(key).active
    }

    /// Idle resources across all keys.
    pub fn num_idle(&self) -> usize {
        self.inner.state.lock().idle_total
    }

    /// Idle resources for one key.
    pub fn num_idle_key(&self, key: &F::Key) -> usize {
        self.inner.state.lock().key_idle_len(key)
    }

    /// Keys that currently have idle or active resources.
    pub fn keys(&self) -> Vec<F::Key> {
        let state = self.inner.state.lock();
        Self::present_keys(&state)
    }

    /// Whether `close()` has run.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> PoolConfig {
        self.inner.state.lock().config.clone()
    }

    /// Snapshot of the pool statistics, aggregated over all keys.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            total_borrows: state.counters.total_borrows,
            total_returns: state.counters.total_returns,
            created: state.counters.created,
            destroyed: state.counters.destroyed,
            evicted: state.counters.evicted,
            active: state.active_total,
            idle: state.idle_total,
            waiting: self.inner.waiting.load(Ordering::Relaxed),
        }
    }

    // -- Runtime configuration ----------------------------------------------

    fn update_config(&self, mutate: impl FnOnce(&mut PoolConfig)) {
        {
            let mut state = self.inner.state.lock();
            mutate(&mut state.config);
        }
        self.inner.wakeup.notify_waiters();
    }

    /// Change the per-key cap on concurrently borrowed resources.
    pub fn set_max_active(&self, max_active: Option<usize>) {
        self.update_config(|c| c.max_active = max_active);
    }

    /// Change the per-key cap on idle resources.
    pub fn set_max_idle(&self, max_idle: Option<usize>) {
        self.update_config(|c| c.max_idle = max_idle);
    }

    /// Change the cross-key cap on allocated plus idle resources.
    pub fn set_max_total(&self, max_total: Option<usize>) {
        self.update_config(|c| c.max_total = max_total);
    }

    /// Change the per-key idle floor maintained by the evictor.
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
    /// sweep.
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
