//! Shared eviction scheduler
//!
//! One background task per process hosts the periodic sweeps of every live
//! pool. The driver starts when the first pool registers, re-plans its
//! deadline whenever the task set changes, and exits when the last
//! registration is dropped. Jobs hold `Weak` references into their pool, so
//! the scheduler never keeps a pool alive; a job that reports its pool gone
//! is dropped at its next due time.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A sweep callback. Returns `None` once the owning pool is gone.
pub(crate) type SweepJob = Box<dyn FnMut() -> Option<BoxFuture<'static, ()>> + Send>;

/// Handle to one scheduled sweep; dropping it unschedules the sweep.
pub(crate) struct Registration {
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let shared = scheduler();
        shared.state.lock().tasks.remove(&self.id);
        shared.changed.notify_one();
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish()
    }
}

struct Task {
    period: Duration,
    next_at: Instant,
    job: SweepJob,
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<u64, Task>,
    next_id: u64,
    driver_alive: bool,
    /// Bumped per spawned driver so a stale driver's teardown cannot clear
    /// the liveness flag of its successor.
    driver_generation: u64,
}

struct Scheduler {
    state: Mutex<SchedulerState>,
    changed: Notify,
}

fn scheduler() -> &'static Scheduler {
    static SCHEDULER: OnceLock<Scheduler> = OnceLock::new();
    SCHEDULER.get_or_init(|| Scheduler {
        state: Mutex::new(SchedulerState::default()),
        changed: Notify::new(),
    })
}

/// Schedule `job` to run every `period`.
///
/// Must be called from within a Tokio runtime: the driver task is spawned on
/// the current handle when the scheduler transitions from empty to non-empty.
pub(crate) fn register(period: Duration, job: SweepJob) -> Registration {
    let shared = scheduler();
    let (id, spawn_generation) = {
        let mut state = shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.tasks.insert(
            id,
            Task {
                period,
                next_at: Instant::now() + period,
                job,
            },
        );
        let spawn_generation = if state.driver_alive {
            None
        } else {
            state.driver_alive = true;
            state.driver_generation += 1;
            Some(state.driver_generation)
        };
        (id, spawn_generation)
    };
    match spawn_generation {
        Some(generation) => drop(tokio::spawn(drive(generation))),
        // Wake the driver so it re-plans against the new deadline.
        None => shared.changed.notify_one(),
    }
    Registration { id }
}

/// Clears the liveness flag when the driver future completes or is dropped
/// with its runtime, so the next registration can respawn it. Guarded by a
/// generation check: only the current driver may clear the flag.
struct DriverGuard {
    generation: u64,
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        let mut state = scheduler().state.lock();
        if state.driver_generation == self.generation {
            state.driver_alive = false;
        }
    }
}

async fn drive(generation: u64) {
    let shared = scheduler();
    let _guard = DriverGuard { generation };
    loop {
        let next_at = {
            let mut state = shared.state.lock();
            if state.tasks.is_empty() {
                // Cleared under the same lock as the emptiness check, so a
                // concurrent register either sees tasks handled by this
                // driver or spawns the next one.
                state.driver_alive = false;
                return;
            }
            state
                .tasks
                .values()
                .map(|t| t.next_at)
                .min()
                .expect("task set is non-empty")
        };
        // Sleep until the earliest deadline, or re-plan early when the task
        // set changes.
        let _ = tokio::time::timeout_at(next_at, shared.changed.notified()).await;

        let mut due: Vec<BoxFuture<'static, ()>> = Vec::new();
        {
            let mut state = shared.state.lock();
            let now = Instant::now();
            let mut gone = Vec::new();
            for (id, task) in &mut state.tasks {
                if task.next_at <= now {
                    task.next_at = now + task.period;
                    match (task.job)() {
                        Some(sweep) => due.push(sweep),
                        None => gone.push(*id),
                    }
                }
            }
            for id in gone {
                state.tasks.remove(&id);
            }
        }
        for sweep in due {
            sweep.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// The scheduler is process-global; tests that tick it must not overlap,
    /// and each must own the runtime hosting the driver for its whole
    /// lifetime. The lock is taken outside the runtime so the driver task is
    /// fully torn down (clearing the liveness flag) before the next test
    /// registers.
    fn with_paused_runtime(test: impl FnOnce() -> BoxFuture<'static, ()>) {
        static SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());
        let _serial = SERIAL
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .expect("failed to build runtime");
        rt.block_on(test());
    }

    fn counting_job(counter: &Arc<AtomicU32>) -> SweepJob {
        let counter = Arc::clone(counter);
        Box::new(move || {
            let counter = Arc::clone(&counter);
            Some(Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
        })
    }

    #[test]
    fn registered_job_fires_periodically() {
        with_paused_runtime(|| {
            Box::pin(async {
                let fired = Arc::new(AtomicU32::new(0));
                let registration = register(Duration::from_millis(50), counting_job(&fired));

                tokio::time::sleep(Duration::from_millis(275)).await;
                let seen = fired.load(Ordering::SeqCst);
                assert!(seen >= 4, "expected at least 4 ticks, saw {seen}");

                drop(registration);
                tokio::time::sleep(Duration::from_millis(200)).await;
                let after = fired.load(Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                assert_eq!(
                    fired.load(Ordering::SeqCst),
                    after,
                    "unregistered job must not fire"
                );
            })
        });
    }

    #[test]
    fn job_reporting_pool_gone_is_removed() {
        with_paused_runtime(|| {
            Box::pin(async {
                let calls = Arc::new(AtomicU32::new(0));
                let calls_in_job = Arc::clone(&calls);
                let registration = register(
                    Duration::from_millis(20),
                    Box::new(move || {
                        calls_in_job.fetch_add(1, Ordering::SeqCst);
                        None
                    }),
                );

                tokio::time::sleep(Duration::from_millis(100)).await;
                assert_eq!(
                    calls.load(Ordering::SeqCst),
                    1,
                    "a job returning None is dropped after one call"
                );
                drop(registration);
            })
        });
    }

    #[test]
    fn two_registrations_tick_independently() {
        with_paused_runtime(|| {
            Box::pin(async {
                let fast = Arc::new(AtomicU32::new(0));
                let slow = Arc::new(AtomicU32::new(0));
                let r1 = register(Duration::from_millis(20), counting_job(&fast));
                let r2 = register(Duration::from_millis(100), counting_job(&slow));

                tokio::time::sleep(Duration::from_millis(210)).await;
                assert!(fast.load(Ordering::SeqCst) >= 8);
                let slow_seen = slow.load(Ordering::SeqCst);
                assert!((1..=3).contains(&slow_seen), "saw {slow_seen}");

                drop(r1);
                drop(r2);
            })
        });
    }
}
