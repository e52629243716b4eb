//! The threadpool: construction, the public spawning surface, and teardown.
#![expect(unsafe_code, reason = "task headers and pool state cross thread boundaries")]

use core::marker::PhantomData;
use core::mem::{ManuallyDrop, MaybeUninit};
use core::ops::Range;
use core::ptr;
use core::sync::atomic::Ordering::{Acquire, Release};
use core::sync::atomic::{AtomicBool, AtomicUsize};

use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_utils::{Backoff, CachePadded};
use ec_sync::{EventCount, TaskQueue};

use crate::balancer::{
    ForLoopEnv, ReduceEnv, ReduceOps, parallel_for_wrapper, parallel_reduce_wrapper,
};
use crate::barrier::ScopedBarrier;
use crate::context::WORKER;
use crate::error::BuildError;
use crate::flowvar::Flowvar;
use crate::metrics::PoolCounters;
use crate::task::{FutureEnvHead, Task, TaskFn, is_root_task};
use crate::worker::worker_event_loop;

// -----------------------------------------------------------------------------
// Config

/// Initial capacity of each per-worker deque.
const DEFAULT_QUEUE_CAPACITY: usize = 32;

const DEFAULT_THREAD_NAME: &str = "ec-worker";

// -----------------------------------------------------------------------------
// PoolState

struct WorkerSlot {
    queue: TaskQueue,
    terminate: AtomicBool,
}

/// Shared pool state: one cache-padded slot per worker, the global backoff,
/// and the init rendezvous. Reached from worker threads through an `Arc`
/// clone and from thread-local contexts through a raw pointer.
pub(crate) struct PoolState {
    workers: Box<[CachePadded<WorkerSlot>]>,
    pub(crate) global_backoff: EventCount,
    /// Workers that have bound their thread-local context.
    ready: AtomicUsize,
    pub(crate) totals: PoolCounters,
}

impl PoolState {
    fn new(num_threads: usize, queue_capacity: usize) -> Self {
        Self {
            workers: (0..num_threads)
                .map(|_| {
                    CachePadded::new(WorkerSlot {
                        queue: TaskQueue::new(queue_capacity),
                        terminate: AtomicBool::new(false),
                    })
                })
                .collect(),
            global_backoff: EventCount::new(),
            ready: AtomicUsize::new(0),
            totals: PoolCounters::new(),
        }
    }

    #[inline(always)]
    pub(crate) fn num_threads(&self) -> usize {
        self.workers.len()
    }

    #[inline(always)]
    pub(crate) fn queue_of(&self, id: usize) -> &TaskQueue {
        &self.workers[id].queue
    }

    #[inline(always)]
    pub(crate) fn terminate_of(&self, id: usize) -> &AtomicBool {
        &self.workers[id].terminate
    }

    fn all_queues_empty(&self) -> bool {
        self.workers.iter().all(|slot| slot.queue.is_empty())
    }
}

// -----------------------------------------------------------------------------
// ThreadpoolBuilder

/// Builder for a [`Threadpool`].
///
/// Configurable parameters:
///
/// - [`num_threads`]: Total number of workers, **including** the constructing
///   thread, which becomes worker 0. Defaults to the number of logical cores.
///
/// - [`queue_capacity`]: Initial capacity of each per-worker task deque
///   (default 32, rounded up to a power of two). Queues grow on demand; this
///   only sizes the first allocation.
///
/// - [`thread_name`]: Thread name prefix. Workers are named
///   `{thread_name} ({id})`, e.g. `ec-worker (1)`.
///
/// - [`stack_size`]: Stack size for worker threads. Default is
///   system-dependent.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use ec_threadpool::ThreadpoolBuilder;
///
/// let pool = ThreadpoolBuilder::new()
///     .num_threads(2)
///     .thread_name(String::from("doc"))
///     .build()
///     .unwrap();
///
/// let result = Arc::new(AtomicU32::new(0));
///
/// pool.sync_scope(|| {
///     for _ in 0..100 {
///         let result = Arc::clone(&result);
///         ec_threadpool::spawn(move || {
///             result.fetch_add(1, Ordering::AcqRel);
///         });
///     }
/// });
///
/// assert_eq!(result.load(Ordering::Acquire), 100);
/// ```
///
/// [`num_threads`]: Self::num_threads
/// [`queue_capacity`]: Self::queue_capacity
/// [`thread_name`]: Self::thread_name
/// [`stack_size`]: Self::stack_size
#[derive(Default)]
#[must_use]
pub struct ThreadpoolBuilder {
    num_threads: Option<usize>,
    queue_capacity: Option<usize>,
    thread_name: Option<String>,
    stack_size: Option<usize>,
}

impl ThreadpoolBuilder {
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            num_threads: None,
            queue_capacity: None,
            thread_name: None,
            stack_size: None,
        }
    }

    /// Sets the total number of workers, including the constructing thread.
    ///
    /// Clamped to at least 1. If unset, defaults to the logical core count.
    #[inline]
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// Sets the initial capacity of each per-worker deque.
    #[inline]
    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = Some(queue_capacity);
        self
    }

    /// Sets the worker thread name prefix.
    #[inline]
    pub fn thread_name(mut self, thread_name: String) -> Self {
        self.thread_name = Some(thread_name);
        self
    }

    /// Overrides the stack size of worker threads.
    #[inline]
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Builds the pool, binding the current thread as worker 0.
    ///
    /// Returns an error if a worker thread cannot be spawned; the workers
    /// that did start are torn down before the error is returned.
    pub fn build(self) -> Result<Threadpool, BuildError> {
        let num_threads = self
            .num_threads
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, |n| n.get()))
            .max(1);
        let queue_capacity = self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);

        let state = Arc::new(PoolState::new(num_threads, queue_capacity));

        WORKER.with(|ctx| ctx.bind(Arc::as_ptr(&state), 0));

        let mut threads = Vec::with_capacity(num_threads - 1);
        for id in 1..num_threads {
            let worker_state = Arc::clone(&state);
            let name = format!(
                "{} ({id})",
                self.thread_name.as_deref().unwrap_or(DEFAULT_THREAD_NAME)
            );

            let mut builder = thread::Builder::new().name(name);
            if let Some(stack_size) = self.stack_size {
                builder = builder.stack_size(stack_size);
            }

            match builder.spawn(move || worker_entry(worker_state, id)) {
                Ok(handle) => threads.push(handle),
                Err(source) => {
                    teardown_partial(&state, threads);
                    WORKER.with(|ctx| ctx.unbind());
                    return Err(BuildError::ThreadSpawn { worker: id, source });
                }
            }
        }

        // Rendezvous: return only once every worker has bound its context
        // and seeded its RNG.
        let backoff = Backoff::new();
        while state.ready.load(Acquire) < num_threads - 1 {
            backoff.snooze();
        }

        log::debug!("threadpool started with {num_threads} workers");
        Ok(Threadpool { state, threads })
    }
}

fn worker_entry(state: Arc<PoolState>, id: usize) {
    WORKER.with(|ctx| {
        ctx.bind(Arc::as_ptr(&state), id);
        state.ready.fetch_add(1, Release);

        worker_event_loop(ctx);

        state.totals.absorb(&ctx.counters);
        ctx.unbind();
    });
}

/// Stops and joins the workers spawned before a construction failure.
fn teardown_partial(state: &PoolState, threads: Vec<JoinHandle<()>>) {
    for slot in state.workers.iter() {
        slot.terminate.store(true, Release);
    }
    for handle in threads {
        // A worker may not even have registered a sleep intent yet, so keep
        // waking until it observes the termination flag.
        while !handle.is_finished() {
            state.global_backoff.wake_all();
            thread::yield_now();
        }
        let _ = handle.join();
    }
}

// -----------------------------------------------------------------------------
// Threadpool

/// A work-stealing fork-join threadpool.
///
/// The constructing thread becomes **worker 0** and stays a full member of
/// the pool: it runs tasks whenever it blocks in [`Flowvar::sync`],
/// [`sync_scope`](Threadpool::sync_scope) or the parallel loops. The
/// remaining workers run an event loop that drains their own deque, steals
/// from random victims, and parks on the pool's global backoff when the pool
/// is idle.
///
/// # Submitting work
///
/// - [`spawn`](Threadpool::spawn): fire-and-forget.
/// - [`spawn_with_handle`](Threadpool::spawn_with_handle): returns a
///   [`Flowvar`] to sync on.
/// - [`spawn_awaitable`](Threadpool::spawn_awaitable): fire-and-join without
///   a result.
/// - [`parallel_for`](Threadpool::parallel_for) /
///   [`parallel_reduce`](Threadpool::parallel_reduce): data parallelism with
///   just-in-time range splitting driven by the observed number of idle
///   workers.
/// - [`sync_scope`](Threadpool::sync_scope): structured join of everything
///   spawned inside a closure, transitively.
///
/// The same operations are available as free functions ([`crate::spawn`] and
/// friends) which act on the pool owning the current thread; tasks use those
/// to spawn and sync nested work.
///
/// # Lifecycle
///
/// Tasks must not unwind; a panicking task aborts the process. Dropping the
/// pool (or calling [`shutdown`](Threadpool::shutdown)) waits for all pending
/// work, then terminates and joins every worker. A pool is not nestable: a
/// thread serves at most one pool at a time.
///
/// # Examples
///
/// ```
/// use ec_threadpool::Threadpool;
///
/// let pool = Threadpool::new();
///
/// let fv = pool.spawn_with_handle(|| 21 * 2);
/// assert_eq!(fv.sync(), 42);
///
/// let sum = pool.parallel_reduce(0..1000, 1, || 0u64, |acc, i| acc + i as u64, |a, b| a + b);
/// assert_eq!(sum, 499_500);
/// ```
pub struct Threadpool {
    state: Arc<PoolState>,
    threads: Vec<JoinHandle<()>>,
}

impl Threadpool {
    /// Creates a pool with default configuration (one worker per logical
    /// core).
    ///
    /// # Panics
    ///
    /// Panics if a worker thread cannot be spawned; use
    /// [`ThreadpoolBuilder::build`] to handle that case.
    pub fn new() -> Self {
        ThreadpoolBuilder::new()
            .build()
            .expect("failed to spawn threadpool workers")
    }

    /// Total number of workers, including the constructing thread.
    #[inline]
    pub fn num_threads(&self) -> usize {
        self.state.num_threads()
    }

    /// In debug builds, checks that the calling thread belongs to this pool.
    #[inline(always)]
    fn debug_check_member(&self) {
        #[cfg(debug_assertions)]
        WORKER.with(|ctx| {
            debug_assert!(
                ptr::eq(ctx.pool.get(), Arc::as_ptr(&self.state)),
                "called from a thread that does not belong to this threadpool"
            );
        });
    }

    /// Spawns a fire-and-forget task. See [`crate::spawn`].
    #[inline]
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.debug_check_member();
        crate::spawn(f);
    }

    /// Spawns a task and returns a [`Flowvar`] for its result. See
    /// [`crate::spawn_with_handle`].
    #[inline]
    pub fn spawn_with_handle<T, F>(&self, f: F) -> Flowvar<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.debug_check_member();
        crate::spawn_with_handle(f)
    }

    /// Spawns a void task that can still be joined. See
    /// [`crate::spawn_awaitable`].
    #[inline]
    pub fn spawn_awaitable<F>(&self, f: F) -> Flowvar<bool>
    where
        F: FnOnce() + Send + 'static,
    {
        self.debug_check_member();
        crate::spawn_awaitable(f)
    }

    /// Runs `body` for every index of `range`, in parallel. See
    /// [`crate::parallel_for`].
    #[inline]
    pub fn parallel_for<F>(&self, range: Range<usize>, body: F)
    where
        F: Fn(usize) + Sync,
    {
        self.debug_check_member();
        crate::parallel_for(range, body);
    }

    /// Strided variant of [`parallel_for`](Threadpool::parallel_for).
    #[inline]
    pub fn parallel_for_strided<F>(&self, range: Range<usize>, stride: usize, body: F)
    where
        F: Fn(usize) + Sync,
    {
        self.debug_check_member();
        crate::parallel_for_strided(range, stride, body);
    }

    /// Parallel reduction over `range`. See [`crate::parallel_reduce`].
    #[inline]
    pub fn parallel_reduce<T, I, F, M>(
        &self,
        range: Range<usize>,
        stride: usize,
        init: I,
        fold: F,
        merge: M,
    ) -> T
    where
        T: Send,
        I: Fn() -> T + Sync,
        F: Fn(T, usize) -> T + Sync,
        M: Fn(T, T) -> T + Sync,
    {
        self.debug_check_member();
        crate::parallel_reduce(range, stride, init, fold, merge)
    }

    /// Structured join: blocks until every task spawned inside `body`
    /// (transitively) has completed. See [`crate::sync_scope`].
    #[inline]
    pub fn sync_scope<R>(&self, body: impl FnOnce() -> R) -> R {
        self.debug_check_member();
        crate::sync_scope(body)
    }

    /// Blocks until the pool has no pending work: every queue empty, every
    /// task retired, every other worker asleep.
    ///
    /// Root-only: must be called from the constructing thread, outside any
    /// task.
    pub fn sync_all(&self) {
        WORKER.with(|ctx| {
            debug_assert!(
                ptr::eq(ctx.pool.get(), Arc::as_ptr(&self.state)),
                "sync_all called from a foreign thread"
            );
            debug_assert_eq!(ctx.id.get(), 0, "sync_all is root-only");
            debug_assert!(
                is_root_task(ctx.current_task.get()),
                "sync_all must not run inside a task"
            );

            let backoff = Backoff::new();
            loop {
                while let Some(task) = ctx.pop_local() {
                    unsafe { ctx.run(task) };
                }
                if let Some(task) = ctx.try_steal_one() {
                    ctx.counters.inc_thefts_idle();
                    unsafe { ctx.run(task) };
                    continue;
                }

                // Quiescent iff every other worker is committed asleep and
                // no queue holds work: a committed sleeper cannot have a
                // task in flight.
                let (pre_sleep, committed) = self.state.global_backoff.num_waiters();
                if pre_sleep == 0
                    && committed as usize == self.state.num_threads() - 1
                    && self.state.all_queues_empty()
                {
                    break;
                }
                backoff.snooze();
            }
        });
    }

    /// Waits for all pending work, then terminates, joins and frees every
    /// worker. Also performed on drop.
    ///
    /// Root-only.
    #[inline]
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Default for Threadpool {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Threadpool {
    fn drop(&mut self) {
        // During a panic unwind the queues may be non-empty; skip the drain
        // and let workers retire what they can before observing termination.
        let panicking = thread::panicking();
        if !panicking {
            self.sync_all();
        }

        for slot in self.state.workers.iter() {
            slot.terminate.store(true, Release);
        }
        self.state.global_backoff.wake_all();

        for handle in core::mem::take(&mut self.threads) {
            let joined = handle.join();
            if !panicking {
                joined.expect("worker thread panicked");
            }
        }

        WORKER.with(|ctx| {
            self.state.totals.absorb(&ctx.counters);
            ctx.unbind();
        });
        self.state.totals.emit();
        log::debug!("threadpool with {} workers shut down", self.state.num_threads());
    }
}

// -----------------------------------------------------------------------------
// Spawn environments

#[repr(C)]
struct SpawnEnv<F> {
    f: ManuallyDrop<F>,
}

#[repr(C)]
struct SpawnFutureEnv<T, F> {
    head: FutureEnvHead<T>,
    f: ManuallyDrop<F>,
}

unsafe fn call_spawn<F: FnOnce()>(env: *mut u8) {
    let env = env as *mut SpawnEnv<F>;
    let f = unsafe { ManuallyDrop::take(&mut (*env).f) };
    f();
}

unsafe fn call_spawn_future<T, F: FnOnce() -> T>(env: *mut u8) {
    let env = env as *mut SpawnFutureEnv<T, F>;
    unsafe {
        let f = ManuallyDrop::take(&mut (*env).f);
        let result = f();
        (*env).head.result.write(result);
    }
}

// -----------------------------------------------------------------------------
// Free-function API

/// Spawns a fire-and-forget task on the pool owning the current thread.
///
/// The task runs LIFO on the same worker unless stolen, and registers on the
/// innermost [`sync_scope`] if one is active. Usable from inside tasks to
/// spawn nested work.
///
/// # Panics
///
/// Panics if the current thread does not belong to a pool.
pub fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    WORKER.with(|ctx| {
        assert!(ctx.is_bound(), "spawn requires a threadpool thread");
        let scope = ctx.current_scope.get();
        unsafe {
            let task = Task::new(
                call_spawn::<F> as TaskFn,
                SpawnEnv {
                    f: ManuallyDrop::new(f),
                },
                ctx.current_task.get(),
                scope,
                false,
            );
            if !scope.is_null() {
                (*scope).register_descendant();
            }
            ctx.schedule(task, false);
        }
    });
}

/// Spawns a task on the pool owning the current thread and returns a
/// [`Flowvar`] that must be [`sync`](Flowvar::sync)ed for its result.
///
/// # Panics
///
/// Panics if the current thread does not belong to a pool.
pub fn spawn_with_handle<T, F>(f: F) -> Flowvar<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    WORKER.with(|ctx| {
        assert!(ctx.is_bound(), "spawn requires a threadpool thread");
        let scope = ctx.current_scope.get();
        unsafe {
            let task = Task::new(
                call_spawn_future::<T, F> as TaskFn,
                SpawnFutureEnv {
                    head: FutureEnvHead {
                        task: ptr::null_mut(),
                        result: MaybeUninit::<T>::uninit(),
                    },
                    f: ManuallyDrop::new(f),
                },
                ctx.current_task.get(),
                scope,
                true,
            );
            Task::set_future_self_ptr(task);
            if !scope.is_null() {
                (*scope).register_descendant();
            }
            ctx.schedule(task, false);
            Flowvar::from_task(task)
        }
    })
}

/// Spawns a void task whose completion can still be joined: the returned
/// flowvar always syncs to `true`.
pub fn spawn_awaitable<F>(f: F) -> Flowvar<bool>
where
    F: FnOnce() + Send + 'static,
{
    spawn_with_handle(move || {
        f();
        true
    })
}

/// Runs `body(i)` for every `i` in `range`, in parallel, on the pool owning
/// the current thread. Returns once the whole range has been executed.
///
/// The range is split just-in-time: it runs sequentially until other workers
/// are observed idle, then sheds balanced chunks for them to steal.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicU64, Ordering};
/// use ec_threadpool::Threadpool;
///
/// let pool = Threadpool::new();
/// let sum = AtomicU64::new(0);
///
/// pool.parallel_for(0..1000, |i| {
///     sum.fetch_add(i as u64, Ordering::Relaxed);
/// });
///
/// assert_eq!(sum.load(Ordering::Acquire), 499_500);
/// ```
///
/// # Panics
///
/// Panics if the current thread does not belong to a pool.
pub fn parallel_for<F>(range: Range<usize>, body: F)
where
    F: Fn(usize) + Sync,
{
    parallel_for_strided(range, 1, body);
}

/// [`parallel_for`] over `range.step_by(stride)`.
pub fn parallel_for_strided<F>(range: Range<usize>, stride: usize, body: F)
where
    F: Fn(usize) + Sync,
{
    assert!(stride >= 1, "stride must be at least 1");
    if range.is_empty() {
        return;
    }

    WORKER.with(|ctx| {
        assert!(ctx.is_bound(), "parallel_for requires a threadpool thread");
        debug_assert!(range.end <= isize::MAX as usize);

        let start = range.start as isize;
        let stop = range.end as isize;
        let stride = stride as isize;
        let steps = (stop - start + stride - 1) / stride;

        // Completion is tracked by a dedicated scope: the loop task and
        // every split it sheds retire on this barrier.
        let barrier = ScopedBarrier::new();

        // SAFETY: `body` is only reached through the raw pointer in the loop
        // env, and every task holding that pointer retires on `barrier`
        // before `execute_until_cleared` returns below.
        unsafe {
            let task = Task::new_loop(
                parallel_for_wrapper::<F> as TaskFn,
                ForLoopEnv {
                    body: &body as *const F,
                },
                ctx.current_task.get(),
                &barrier as *const ScopedBarrier as *mut ScopedBarrier,
                false,
                start,
                stop,
                stride,
                steps,
            );
            barrier.register_descendant();
            ctx.schedule(task, false);
            ctx.execute_until_cleared(&barrier);
        }
    });
}

/// Parallel reduction of `range` on the pool owning the current thread.
///
/// `init` produces each thread-local accumulator, `fold` absorbs one index
/// into it, and `merge` combines two partials. `merge` must be associative
/// with `init()` as identity; commutativity is not required (partials merge
/// in reverse split order, each exactly once).
///
/// # Examples
///
/// ```
/// use ec_threadpool::Threadpool;
///
/// let pool = Threadpool::new();
/// let sum = pool.parallel_reduce(0..100, 1, || 0u64, |acc, i| acc + i as u64, |a, b| a + b);
/// assert_eq!(sum, 4950);
/// ```
///
/// # Panics
///
/// Panics if the current thread does not belong to a pool.
pub fn parallel_reduce<T, I, F, M>(range: Range<usize>, stride: usize, init: I, fold: F, merge: M) -> T
where
    T: Send,
    I: Fn() -> T + Sync,
    F: Fn(T, usize) -> T + Sync,
    M: Fn(T, T) -> T + Sync,
{
    assert!(stride >= 1, "stride must be at least 1");
    if range.is_empty() {
        return init();
    }

    WORKER.with(|ctx| {
        assert!(ctx.is_bound(), "parallel_reduce requires a threadpool thread");
        debug_assert!(range.end <= isize::MAX as usize);

        let start = range.start as isize;
        let stop = range.end as isize;
        let stride = stride as isize;
        let steps = (stop - start + stride - 1) / stride;

        let ops = ReduceOps {
            init,
            fold,
            merge,
            _result: PhantomData,
        };
        let scope = ctx.current_scope.get();

        // SAFETY: `ops` is only reached through the raw pointer in the loop
        // env. The root loop task completes only after merging every split,
        // and the `sync` below blocks until then, pinning this frame.
        unsafe {
            let task = Task::new_loop(
                parallel_reduce_wrapper::<T, I, F, M> as TaskFn,
                ReduceEnv {
                    head: FutureEnvHead {
                        task: ptr::null_mut(),
                        result: MaybeUninit::<T>::uninit(),
                    },
                    ops: &ops as *const ReduceOps<T, I, F, M>,
                },
                ctx.current_task.get(),
                scope,
                true,
                start,
                stop,
                stride,
                steps,
            );
            Task::set_future_self_ptr(task);
            if !scope.is_null() {
                (*scope).register_descendant();
            }
            ctx.schedule(task, false);
            Flowvar::<T>::from_task(task).sync()
        }
    })
}

/// Structured join on the pool owning the current thread: runs `body`, then
/// blocks until every task spawned inside it has completed, transitively,
/// splits included.
///
/// The wait never parks; the caller drains its own queue and steals until
/// the scope clears.
///
/// # Panics
///
/// Panics if the current thread does not belong to a pool. A panic from
/// `body` is resumed after the scope has been waited out, so no spawned task
/// outlives its captures.
pub fn sync_scope<R>(body: impl FnOnce() -> R) -> R {
    WORKER.with(|ctx| {
        assert!(ctx.is_bound(), "sync_scope requires a threadpool thread");

        let barrier = ScopedBarrier::new();
        let prev = ctx
            .current_scope
            .replace(&barrier as *const ScopedBarrier as *mut ScopedBarrier);

        let result = catch_unwind(AssertUnwindSafe(body));

        unsafe { ctx.execute_until_cleared(&barrier) };
        ctx.current_scope.set(prev);

        match result {
            Ok(value) => value,
            Err(payload) => resume_unwind(payload),
        }
    })
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn small_pool(num_threads: usize) -> Threadpool {
        ThreadpoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(String::from("test"))
            .build()
            .unwrap()
    }

    #[test]
    fn sync_returns_the_spawned_result() {
        let pool = small_pool(4);
        let fv = pool.spawn_with_handle(|| 6 * 7);
        assert_eq!(fv.sync(), 42);
    }

    #[test]
    fn spawn_awaitable_syncs_to_true() {
        let pool = small_pool(2);
        let ran = Arc::new(AtomicUsize::new(0));

        let marker = Arc::clone(&ran);
        let fv = pool.spawn_awaitable(move || {
            marker.fetch_add(1, Ordering::Relaxed);
        });

        assert!(fv.sync());
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn is_ready_is_idempotent() {
        let pool = small_pool(2);
        let fv = pool.spawn_with_handle(|| 1u32);

        while !fv.is_ready() {
            std::hint::spin_loop();
        }
        assert!(fv.is_ready());
        assert!(fv.is_ready());
        assert_eq!(fv.sync(), 1);
    }

    #[test]
    fn recursive_fibonacci() {
        fn fib(n: u64) -> u64 {
            if n < 2 {
                return n;
            }
            let x = crate::spawn_with_handle(move || fib(n - 1));
            let y = fib(n - 2);
            x.sync() + y
        }

        let pool = small_pool(4);
        let fv = pool.spawn_with_handle(|| fib(20));
        assert_eq!(fv.sync(), 6765);
    }

    #[test]
    fn deeply_nested_spawn_and_sync() {
        let pool = small_pool(2);

        // A spawns B and syncs it; B spawns C and syncs it.
        let fv = pool.spawn_with_handle(|| {
            let b = crate::spawn_with_handle(|| {
                let c = crate::spawn_with_handle(|| 1u32);
                c.sync() + 1
            });
            b.sync() + 1
        });
        assert_eq!(fv.sync(), 3);
    }

    #[test]
    fn parallel_for_sums_the_range() {
        let pool = small_pool(4);
        let sum = AtomicU64::new(0);

        pool.parallel_for(0..1000, |i| {
            sum.fetch_add(i as u64, Ordering::Relaxed);
        });

        assert_eq!(sum.load(Ordering::Relaxed), 499_500);
    }

    #[test]
    fn parallel_for_visits_each_index_exactly_once() {
        let pool = small_pool(4);
        let hits: Vec<AtomicU8> = (0..10_000).map(|_| AtomicU8::new(0)).collect();

        pool.parallel_for(0..hits.len(), |i| {
            hits[i].fetch_add(1, Ordering::Relaxed);
        });

        for (i, hit) in hits.iter().enumerate() {
            assert_eq!(hit.load(Ordering::Relaxed), 1, "index {i}");
        }
    }

    #[test]
    fn strided_loop_visits_the_stride_grid() {
        let pool = small_pool(3);
        let visited = Mutex::new(Vec::new());

        pool.parallel_for_strided(0..10, 3, |i| {
            visited.lock().unwrap().push(i);
        });

        let mut visited = visited.into_inner().unwrap();
        visited.sort_unstable();
        assert_eq!(visited, [0, 3, 6, 9]);
    }

    #[test]
    fn empty_range_spawns_nothing() {
        let pool = small_pool(2);
        pool.parallel_for(5..5, |_| unreachable!("empty range must not run"));

        let folded = pool.parallel_reduce(
            3..3,
            1,
            || 17u32,
            |_, _| unreachable!("empty range must not fold"),
            |_, _| unreachable!("empty range must not merge"),
        );
        assert_eq!(folded, 17);
    }

    #[test]
    fn parallel_reduce_matches_closed_form() {
        let pool = small_pool(4);

        let sum = pool.parallel_reduce(
            0..1_000_000,
            1,
            || 0u64,
            |acc, i| acc + (i % 1000) as u64,
            |a, b| a + b,
        );

        // 1000 complete cycles of 0 + 1 + ... + 999.
        assert_eq!(sum, 1000 * 499_500);
    }

    #[test]
    fn parallel_reduce_with_stride() {
        let pool = small_pool(3);

        let sum = pool.parallel_reduce(0..100, 7, || 0u64, |acc, i| acc + i as u64, |a, b| a + b);

        let expected: u64 = (0..100).step_by(7).map(|i| i as u64).sum();
        assert_eq!(sum, expected);
    }

    #[test]
    fn sync_scope_waits_for_every_spawn() {
        let pool = small_pool(4);
        let done = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        pool.sync_scope(|| {
            for _ in 0..8 {
                let done = Arc::clone(&done);
                crate::spawn(move || {
                    std::thread::sleep(Duration::from_millis(5));
                    done.fetch_add(1, Ordering::Release);
                });
            }
        });

        assert_eq!(done.load(Ordering::Acquire), 8);
        assert!(started.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn sync_scope_tracks_transitive_descendants() {
        let pool = small_pool(4);
        let count = Arc::new(AtomicUsize::new(0));

        pool.sync_scope(|| {
            for _ in 0..4 {
                let count = Arc::clone(&count);
                crate::spawn(move || {
                    let inner = Arc::clone(&count);
                    crate::spawn(move || {
                        inner.fetch_add(1, Ordering::Release);
                    });
                    count.fetch_add(1, Ordering::Release);
                });
            }
        });

        assert_eq!(count.load(Ordering::Acquire), 8);
    }

    #[test]
    fn single_thread_pool_serialises_everything() {
        let pool = small_pool(1);
        let sum = AtomicU64::new(0);

        let fv = pool.spawn_with_handle(|| 5u64);
        pool.parallel_for(0..100, |i| {
            sum.fetch_add(i as u64, Ordering::Relaxed);
        });

        assert_eq!(fv.sync(), 5);
        assert_eq!(sum.load(Ordering::Relaxed), 4950);
        pool.sync_all();
    }

    #[test]
    fn sync_all_drains_detached_spawns() {
        let pool = small_pool(3);
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..500 {
            let count = Arc::clone(&count);
            pool.spawn(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }

        pool.sync_all();
        assert_eq!(count.load(Ordering::Relaxed), 500);
    }

    #[test]
    fn shutdown_under_load_retires_every_task() {
        let pool = small_pool(4);
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..100_000 {
            let count = Arc::clone(&count);
            pool.spawn(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }

        pool.shutdown();
        assert_eq!(count.load(Ordering::Relaxed), 100_000);
    }

    #[test]
    fn pools_are_reusable_sequentially_on_one_thread() {
        for _ in 0..3 {
            let pool = small_pool(2);
            let fv = pool.spawn_with_handle(|| 1u32);
            assert_eq!(fv.sync(), 1);
            drop(pool);
        }
    }

    #[test]
    fn parked_sync_wakes_on_completion() {
        let pool = small_pool(2);

        // The worker steals the task and sleeps inside it, so the syncing
        // root has nothing else to do and must park on the waiter slot.
        let fv = pool.spawn_with_handle(|| {
            std::thread::sleep(Duration::from_millis(20));
            7u32
        });
        assert_eq!(fv.sync(), 7);
    }

    #[test]
    fn reduce_nested_inside_scope() {
        let pool = small_pool(4);
        let total = Arc::new(AtomicU64::new(0));

        pool.sync_scope(|| {
            let total = Arc::clone(&total);
            crate::spawn(move || {
                let sum =
                    crate::parallel_reduce(0..10_000, 1, || 0u64, |acc, i| acc + i as u64, |a, b| {
                        a + b
                    });
                total.store(sum, Ordering::Release);
            });
        });

        assert_eq!(total.load(Ordering::Acquire), 49_995_000);
    }
}
