//! Thread-local worker state.
//!
//! Every thread that belongs to a pool (the constructing thread as worker 0
//! and each spawned worker) binds the `WORKER` slot exactly once. The slot
//! holds a raw pointer to the pool state (kept alive by the pool handle on
//! worker 0 and by an `Arc` clone on spawned workers), so no lifetime
//! parameter leaks into thread-local storage.
//!
//! Mixing two pools on one OS thread is a contract violation and is caught
//! by the bind assertion.
#![expect(unsafe_code, reason = "raw pool pointer in thread-local storage")]

use core::cell::Cell;
use core::ptr;

use ec_sync::{EventNotifier, TaskQueue};

use crate::metrics::Counters;
use crate::pool::PoolState;
use crate::rng::WorkerRng;
use crate::task::{Task, root_task};

// -----------------------------------------------------------------------------
// WorkerContext

/// Per-thread scheduler state.
///
/// The queue itself lives in the pool (thieves need to reach it); the context
/// holds the worker's id, the in-progress task/scope pointers that `run`
/// saves and restores, the victim-selection RNG, the notifier used when this
/// worker awaits one specific task, and the adaptive-steal counters.
pub(crate) struct WorkerContext {
    pub(crate) id: Cell<usize>,
    pub(crate) pool: Cell<*const PoolState>,
    /// Task currently being run, or [`root_task`] outside any task.
    pub(crate) current_task: Cell<*mut Task>,
    /// Innermost scope barrier, or null outside any scope.
    pub(crate) current_scope: Cell<*mut crate::barrier::ScopedBarrier>,
    pub(crate) rng: WorkerRng,
    /// Parked on while awaiting a specific future; its address is published
    /// into the awaited task's `waiter` slot.
    pub(crate) local_backoff: EventNotifier,

    // Adaptive steal-strategy state over a sliding window of thefts.
    pub(crate) steal_half: Cell<bool>,
    pub(crate) recent_tasks: Cell<u32>,
    pub(crate) recent_thefts: Cell<u32>,
    pub(crate) recent_leaps: Cell<u32>,
    pub(crate) recent_half_thefts: Cell<u32>,

    pub(crate) counters: Counters,
}

thread_local! {
    // `const {}` enables the more efficient thread-local implementation.
    pub(crate) static WORKER: WorkerContext = const { WorkerContext::unbound() };
}

impl WorkerContext {
    const fn unbound() -> Self {
        Self {
            id: Cell::new(0),
            pool: Cell::new(ptr::null()),
            current_task: Cell::new(root_task()),
            current_scope: Cell::new(ptr::null_mut()),
            rng: WorkerRng::fixed(),
            local_backoff: EventNotifier::new(),
            steal_half: Cell::new(false),
            recent_tasks: Cell::new(0),
            recent_thefts: Cell::new(0),
            recent_leaps: Cell::new(0),
            recent_half_thefts: Cell::new(0),
            counters: Counters::new(),
        }
    }

    /// Binds this thread to `pool` as worker `id`.
    ///
    /// Panics if the thread already belongs to a pool: one OS thread may
    /// serve at most one pool at a time.
    pub(crate) fn bind(&self, pool: *const PoolState, id: usize) {
        assert!(
            self.pool.get().is_null(),
            "thread is already bound to a threadpool"
        );
        self.pool.set(pool);
        self.id.set(id);
        self.current_task.set(root_task());
        self.current_scope.set(ptr::null_mut());
        self.steal_half.set(false);
        self.recent_tasks.set(0);
        self.recent_thefts.set(0);
        self.recent_leaps.set(0);
        self.recent_half_thefts.set(0);
        self.rng.reseed(id);
    }

    /// Releases the thread at pool teardown.
    pub(crate) fn unbind(&self) {
        self.pool.set(ptr::null());
    }

    #[inline(always)]
    pub(crate) fn is_bound(&self) -> bool {
        !self.pool.get().is_null()
    }

    /// The pool this thread belongs to.
    ///
    /// The returned reference is valid for the duration of the bind: worker
    /// threads hold an `Arc` to the state, and worker 0 is unbound before the
    /// pool handle drops it.
    #[inline(always)]
    pub(crate) fn pool_state(&self) -> &PoolState {
        let pool = self.pool.get();
        debug_assert!(!pool.is_null(), "not a threadpool thread");
        unsafe { &*pool }
    }

    /// This worker's own queue.
    #[inline(always)]
    pub(crate) fn queue(&self) -> &TaskQueue {
        self.pool_state().queue_of(self.id.get())
    }
}
