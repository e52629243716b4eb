//! The scheduling core: task execution, the schedule/wake decision, victim
//! selection, the worker event loop and the future completion protocol.
#![expect(unsafe_code, reason = "raw task pointers cross thread boundaries")]

use core::ptr;
use core::sync::atomic::Ordering::{Acquire, AcqRel, Release};

use std::panic::{AssertUnwindSafe, catch_unwind};

use crossbeam_utils::Backoff;
use ec_sync::EventNotifier;

use crate::barrier::ScopedBarrier;
use crate::context::WorkerContext;
use crate::rng::VictimPermutation;
use crate::task::{SENTINEL_THIEF, Task, is_ready_future, ready_future};

// -----------------------------------------------------------------------------
// Steal policy

/// Window over which the steal strategy is re-evaluated.
const ADAPT_WINDOW: u32 = 25;

/// Gate for the adaptive one-task/half-queue strategy switch.
///
/// Shipped disabled: under reduction-heavy load the half-queue path can hand
/// a thief a chunk whose sibling already completed it, tripping the
/// not-yet-completed assertion in `run`. Single-steal until that interleaving
/// is characterised; the strategy plumbing below stays compiled and tested.
pub(crate) const STEAL_HALF_ADAPTIVE: bool = false;

// -----------------------------------------------------------------------------
// Task execution

impl WorkerContext {
    /// Runs `task` to completion on this worker.
    ///
    /// Installs the task as current, invokes the body, retires the task from
    /// its scope, then either frees it (no future) or publishes completion
    /// and wakes a parked waiter.
    ///
    /// # Safety
    ///
    /// `task` must be a live task owned by this worker (freshly popped or
    /// stolen).
    pub(crate) unsafe fn run(&self, task: *mut Task) {
        debug_assert!(unsafe { !(*task).completed.load(Acquire) });

        let prev_task = self.current_task.replace(task);
        let prev_scope = self.current_scope.replace(unsafe { (*task).scoped_barrier });

        let body = unsafe { (*task).body };
        let env = Task::env(task);
        // Task closures are declared not to unwind: a leaked panic would
        // strand every waiter, so it takes the process down.
        if catch_unwind(AssertUnwindSafe(|| unsafe { body(env) })).is_err() {
            log::error!("task body panicked; aborting");
            std::process::abort();
        }

        let barrier = unsafe { (*task).scoped_barrier };
        if !barrier.is_null() {
            unsafe { (*barrier).unlist_descendant() };
        }

        self.current_task.set(prev_task);
        self.current_scope.set(prev_scope);

        self.counters.inc_tasks_executed();
        self.recent_tasks.set(self.recent_tasks.get().wrapping_add(1));

        if unsafe { !(*task).has_future } {
            unsafe { Task::free(task) };
            return;
        }

        // Publish the result, then hand the waiter slot to the sync side.
        // Exactly one of the two protocols fires: either the waiter already
        // installed its notifier (we read it here and wake it), or it will
        // find `ready_future` and never park.
        unsafe {
            (*task).completed.store(true, Release);
            let waiter = (*task).waiter.swap(ready_future(), AcqRel);
            if !waiter.is_null() {
                debug_assert!(!is_ready_future(waiter));
                (*waiter).notify();
            }
        }
    }

    /// Publishes a prepared task on the local queue, waking one worker when
    /// the queue transitions from empty (or unconditionally on `force_wake`).
    ///
    /// The transition rule keeps one syscall off every spawn in a burst while
    /// preserving the invariant that published work always has at least one
    /// worker running, stealing or in pre-sleep.
    ///
    /// # Safety
    ///
    /// `task` must be fully initialised and not yet published.
    pub(crate) unsafe fn schedule(&self, task: *mut Task, force_wake: bool) {
        let queue = self.queue();
        let was_empty = queue.is_empty();
        queue.push(task as *mut u8);
        if force_wake || was_empty {
            self.pool_state().global_backoff.wake();
        }
        log::trace!(
            "worker {} scheduled task (wake = {})",
            self.id.get(),
            force_wake || was_empty
        );
    }

    #[inline]
    pub(crate) fn pop_local(&self) -> Option<*mut Task> {
        self.queue().pop().map(|raw| raw as *mut Task)
    }

    // -------------------------------------------------------------------------
    // Stealing

    /// One stealing round over a fresh victim permutation.
    ///
    /// On success the thief publishes its id on the task so that a worker
    /// awaiting the task can leapfrog to this queue.
    pub(crate) fn try_steal_adaptive(&self) -> Option<*mut Task> {
        let pool = self.pool_state();
        let num_threads = pool.num_threads();
        if num_threads == 1 {
            return None;
        }

        let half = STEAL_HALF_ADAPTIVE && self.steal_half.get();
        for victim in VictimPermutation::new(&self.rng, num_threads, self.id.get()) {
            let victim_queue = pool.queue_of(victim);
            let stolen = if half {
                victim_queue.steal_half_into(self.queue())
            } else {
                victim_queue.steal()
            };
            if let Some(raw) = stolen {
                let task = raw as *mut Task;
                unsafe {
                    (*task).thief_id.store(self.id.get() as i32, Release);
                }
                self.note_theft(half);
                log::trace!("worker {} stole task from worker {victim}", self.id.get());
                return Some(task);
            }
        }
        None
    }

    /// Single-task steal round, regardless of the adaptive strategy.
    pub(crate) fn try_steal_one(&self) -> Option<*mut Task> {
        let pool = self.pool_state();
        let num_threads = pool.num_threads();
        if num_threads == 1 {
            return None;
        }

        for victim in VictimPermutation::new(&self.rng, num_threads, self.id.get()) {
            if let Some(raw) = pool.queue_of(victim).steal() {
                let task = raw as *mut Task;
                unsafe {
                    (*task).thief_id.store(self.id.get() as i32, Release);
                }
                self.note_theft(false);
                return Some(task);
            }
        }
        None
    }

    /// Steals one task from the specific worker that stole the awaited task.
    ///
    /// A thief running the awaited task may have enqueued children the task
    /// transitively waits on, so its queue is the one worth raiding.
    pub(crate) fn try_leap(&self, thief: usize) -> Option<*mut Task> {
        debug_assert_ne!(thief, self.id.get());
        let raw = self.pool_state().queue_of(thief).steal()?;
        let task = raw as *mut Task;
        unsafe {
            (*task).thief_id.store(self.id.get() as i32, Release);
        }
        self.recent_leaps.set(self.recent_leaps.get().wrapping_add(1));
        self.counters.inc_leaps();
        self.note_theft(false);
        Some(task)
    }

    fn note_theft(&self, half: bool) {
        self.recent_thefts.set(self.recent_thefts.get() + 1);
        if half {
            self.recent_half_thefts.set(self.recent_half_thefts.get() + 1);
        }
        if self.recent_thefts.get() >= ADAPT_WINDOW {
            self.adapt_steal_strategy();
        }
    }

    /// Re-evaluates the one-task/half-queue choice over the last
    /// [`ADAPT_WINDOW`] thefts.
    ///
    /// The ratio estimates tasks genuinely executed per steal request, net of
    /// leapfrogs and single-steals: below 2 in half-queue mode the thieves
    /// are mostly re-stealing each other's loot, so fall back to one-task;
    /// a ratio of exactly 1 in one-task mode means a thief consumes only what
    /// it steals, the signature of fine-grained work worth batching.
    fn adapt_steal_strategy(&self) {
        let tasks = i64::from(self.recent_tasks.get());
        let leaps = i64::from(self.recent_leaps.get());
        let thefts = i64::from(self.recent_thefts.get());
        let half_thefts = i64::from(self.recent_half_thefts.get());

        let ratio = (tasks - leaps - (thefts - half_thefts)) / i64::from(ADAPT_WINDOW);
        if self.steal_half.get() {
            if ratio < 2 {
                self.steal_half.set(false);
            }
        } else if ratio == 1 {
            self.steal_half.set(true);
        }

        self.recent_tasks.set(0);
        self.recent_thefts.set(0);
        self.recent_leaps.set(0);
        self.recent_half_thefts.set(0);
    }

    // -------------------------------------------------------------------------
    // Waiting

    /// Runs tasks until `barrier` clears.
    ///
    /// Used at scope exits: drains the local queue (anything, not only
    /// descendants; completion is re-checked every round), steals when
    /// empty, and spins with CPU pauses otherwise. Never parks: a scope
    /// covers one logical phase and clears quickly under realistic load.
    pub(crate) unsafe fn execute_until_cleared(&self, barrier: &ScopedBarrier) {
        let backoff = Backoff::new();
        while !barrier.is_cleared() {
            if let Some(task) = self.pop_local() {
                unsafe { self.run(task) };
                continue;
            }
            if let Some(task) = self.try_steal_one() {
                self.counters.inc_thefts_await();
                unsafe { self.run(task) };
                continue;
            }
            backoff.spin();
        }
    }

    /// Blocks until `task` completes, making itself useful meanwhile.
    ///
    /// First drains its own spawned descendants (handing anything unrelated
    /// back to the pool with a forced wake), then loops: leapfrog to the
    /// thief if one is published, otherwise steal anywhere, otherwise run
    /// unrelated local work, otherwise park on the task's waiter slot.
    ///
    /// # Safety
    ///
    /// `task` must be a live future-carrying task this worker's flowvar owns.
    pub(crate) unsafe fn complete_future(&self, task: *mut Task) {
        // Phase 1: our own queue holds the awaited task's likeliest
        // prerequisites, spawned by the current task.
        while unsafe { !(*task).completed.load(Acquire) } {
            let Some(candidate) = self.pop_local() else {
                break;
            };
            if unsafe { (*candidate).parent } != self.current_task.get() {
                // Not ours: put it back in circulation rather than stalling
                // whoever depends on it.
                unsafe { self.schedule(candidate, true) };
                break;
            }
            unsafe { self.run(candidate) };
        }

        // Phase 2: seek work anywhere until the future lands.
        while unsafe { !(*task).completed.load(Acquire) } {
            let thief = unsafe { (*task).thief_id.load(Acquire) };
            let stolen = if thief != SENTINEL_THIEF {
                self.try_leap(thief as usize)
            } else {
                self.try_steal_one()
            };
            let found = stolen.or_else(|| self.pop_local());

            if let Some(candidate) = found {
                self.counters.inc_thefts_await();
                unsafe { self.run(candidate) };
                continue;
            }

            // Nothing runnable: install our notifier and park. The completer
            // sets `completed` before exchanging the waiter slot, so if our
            // install loses the exchange race the next loop check exits.
            self.local_backoff.prepare_to_park();
            let notifier = &self.local_backoff as *const EventNotifier as *mut EventNotifier;
            let installed = unsafe {
                (*task)
                    .waiter
                    .compare_exchange(ptr::null_mut(), notifier, AcqRel, Acquire)
            };
            if installed.is_ok() {
                self.counters.inc_future_parks();
                log::trace!("worker {} parked on a future", self.id.get());
                self.local_backoff.park();
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Event loop

/// Main loop of workers `1..num_threads`: drain the local queue, declare
/// sleep intent, make one stealing round, then run what was found or park.
/// A successful steal wakes one more worker, since where one task was stolen
/// more may follow. Termination is observed only from the park slot, which
/// guarantees every queue drained before the worker exits.
pub(crate) fn worker_event_loop(ctx: &WorkerContext) {
    let pool = ctx.pool_state();
    let id = ctx.id.get();

    loop {
        while let Some(task) = ctx.pop_local() {
            unsafe { ctx.run(task) };
        }

        let ticket = pool.global_backoff.sleepy();

        if let Some(task) = ctx.try_steal_adaptive() {
            pool.global_backoff.cancel_sleep();
            // There may be more where that came from.
            pool.global_backoff.wake();
            ctx.counters.inc_thefts_idle();
            unsafe { ctx.run(task) };
            continue;
        }

        if pool.terminate_of(id).load(Acquire) {
            pool.global_backoff.cancel_sleep();
            log::trace!("worker {id} terminating");
            break;
        }

        ctx.counters.inc_global_sleeps();
        log::trace!("worker {id} sleeping");
        pool.global_backoff.sleep(ticket);
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    fn window(ctx: &WorkerContext, tasks: u32, leaps: u32, half_thefts: u32) {
        ctx.recent_tasks.set(tasks);
        ctx.recent_leaps.set(leaps);
        ctx.recent_half_thefts.set(half_thefts);
        ctx.recent_thefts.set(ADAPT_WINDOW);
        ctx.adapt_steal_strategy();
    }

    #[test]
    fn adaptive_policy_switches_both_ways() {
        crate::context::WORKER.with(|ctx| {
            // One task per single steal: fine-grained, batch up.
            ctx.steal_half.set(false);
            window(ctx, 2 * ADAPT_WINDOW, 0, 0);
            assert!(ctx.steal_half.get());

            // Thieves re-stealing each other's batches: back off.
            window(ctx, ADAPT_WINDOW, 0, ADAPT_WINDOW);
            assert!(!ctx.steal_half.get());

            // High yield per single steal: stay on single.
            window(ctx, 3 * ADAPT_WINDOW, 0, 0);
            assert!(!ctx.steal_half.get());
        });
    }

    #[test]
    fn adaptation_resets_its_window() {
        crate::context::WORKER.with(|ctx| {
            window(ctx, 5, 1, 2);
            assert_eq!(ctx.recent_tasks.get(), 0);
            assert_eq!(ctx.recent_thefts.get(), 0);
            assert_eq!(ctx.recent_leaps.get(), 0);
            assert_eq!(ctx.recent_half_thefts.get(), 0);
        });
    }
}
