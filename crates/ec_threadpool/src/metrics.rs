//! Scheduler event counters behind the `metrics` cargo feature.
//!
//! Per-worker [`Counters`] live in the thread-local context and use plain
//! `Cell`s; they are folded into the pool-wide [`PoolCounters`] when a worker
//! exits and logged at shutdown. With the feature disabled both types are
//! zero-sized and every recording call compiles to nothing.

#[cfg(feature = "metrics")]
pub(crate) use self::enabled::{Counters, PoolCounters};

#[cfg(not(feature = "metrics"))]
pub(crate) use self::disabled::{Counters, PoolCounters};

// -----------------------------------------------------------------------------
// Enabled

#[cfg(feature = "metrics")]
mod enabled {
    use core::cell::Cell;
    use core::sync::atomic::{AtomicU64, Ordering::Relaxed};

    /// Per-worker event totals.
    pub(crate) struct Counters {
        pub tasks_executed: Cell<u64>,
        pub thefts_idle: Cell<u64>,
        pub thefts_await: Cell<u64>,
        pub leaps: Cell<u64>,
        pub loop_splits: Cell<u64>,
        pub global_sleeps: Cell<u64>,
        pub future_parks: Cell<u64>,
    }

    impl Counters {
        pub const fn new() -> Self {
            Self {
                tasks_executed: Cell::new(0),
                thefts_idle: Cell::new(0),
                thefts_await: Cell::new(0),
                leaps: Cell::new(0),
                loop_splits: Cell::new(0),
                global_sleeps: Cell::new(0),
                future_parks: Cell::new(0),
            }
        }

        #[inline(always)]
        pub fn inc_tasks_executed(&self) {
            self.tasks_executed.set(self.tasks_executed.get() + 1);
        }

        #[inline(always)]
        pub fn inc_thefts_idle(&self) {
            self.thefts_idle.set(self.thefts_idle.get() + 1);
        }

        #[inline(always)]
        pub fn inc_thefts_await(&self) {
            self.thefts_await.set(self.thefts_await.get() + 1);
        }

        #[inline(always)]
        pub fn inc_leaps(&self) {
            self.leaps.set(self.leaps.get() + 1);
        }

        #[inline(always)]
        pub fn add_loop_splits(&self, n: u64) {
            self.loop_splits.set(self.loop_splits.get() + n);
        }

        #[inline(always)]
        pub fn inc_global_sleeps(&self) {
            self.global_sleeps.set(self.global_sleeps.get() + 1);
        }

        #[inline(always)]
        pub fn inc_future_parks(&self) {
            self.future_parks.set(self.future_parks.get() + 1);
        }
    }

    /// Pool-wide totals, folded from worker counters as workers exit.
    pub(crate) struct PoolCounters {
        tasks_executed: AtomicU64,
        thefts_idle: AtomicU64,
        thefts_await: AtomicU64,
        leaps: AtomicU64,
        loop_splits: AtomicU64,
        global_sleeps: AtomicU64,
        future_parks: AtomicU64,
    }

    impl PoolCounters {
        pub const fn new() -> Self {
            Self {
                tasks_executed: AtomicU64::new(0),
                thefts_idle: AtomicU64::new(0),
                thefts_await: AtomicU64::new(0),
                leaps: AtomicU64::new(0),
                loop_splits: AtomicU64::new(0),
                global_sleeps: AtomicU64::new(0),
                future_parks: AtomicU64::new(0),
            }
        }

        pub fn absorb(&self, worker: &Counters) {
            self.tasks_executed.fetch_add(worker.tasks_executed.take(), Relaxed);
            self.thefts_idle.fetch_add(worker.thefts_idle.take(), Relaxed);
            self.thefts_await.fetch_add(worker.thefts_await.take(), Relaxed);
            self.leaps.fetch_add(worker.leaps.take(), Relaxed);
            self.loop_splits.fetch_add(worker.loop_splits.take(), Relaxed);
            self.global_sleeps.fetch_add(worker.global_sleeps.take(), Relaxed);
            self.future_parks.fetch_add(worker.future_parks.take(), Relaxed);
        }

        pub fn emit(&self) {
            log::debug!(
                "threadpool totals: tasks={} thefts_idle={} thefts_await={} leaps={} \
                 loop_splits={} global_sleeps={} future_parks={}",
                self.tasks_executed.load(Relaxed),
                self.thefts_idle.load(Relaxed),
                self.thefts_await.load(Relaxed),
                self.leaps.load(Relaxed),
                self.loop_splits.load(Relaxed),
                self.global_sleeps.load(Relaxed),
                self.future_parks.load(Relaxed),
            );
        }
    }
}

// -----------------------------------------------------------------------------
// Disabled

#[cfg(not(feature = "metrics"))]
mod disabled {
    /// Zero-sized stand-in; every recording call is a no-op.
    pub(crate) struct Counters;

    impl Counters {
        pub const fn new() -> Self {
            Self
        }

        #[inline(always)]
        pub fn inc_tasks_executed(&self) {}

        #[inline(always)]
        pub fn inc_thefts_idle(&self) {}

        #[inline(always)]
        pub fn inc_thefts_await(&self) {}

        #[inline(always)]
        pub fn inc_leaps(&self) {}

        #[inline(always)]
        pub fn add_loop_splits(&self, _n: u64) {}

        #[inline(always)]
        pub fn inc_global_sleeps(&self) {}

        #[inline(always)]
        pub fn inc_future_parks(&self) {}
    }

    /// Zero-sized stand-in.
    pub(crate) struct PoolCounters;

    impl PoolCounters {
        pub const fn new() -> Self {
            Self
        }

        pub fn absorb(&self, _worker: &Counters) {}

        pub fn emit(&self) {}
    }
}
