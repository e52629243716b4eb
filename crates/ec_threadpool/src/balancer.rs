//! Just-in-time splitting of parallel-for ranges.
//!
//! A loop task does not pre-partition its range. It runs sequentially and
//! polls a cheap check at geometrically backed-off indices; only when other
//! workers are observably idle does it carve the remainder into ±1-balanced
//! chunks and publish them. Fine-grained loops on a busy pool therefore pay
//! almost nothing for the option of parallelism.
#![expect(unsafe_code, reason = "loop wrappers drive raw task headers")]

use core::marker::PhantomData;
use core::ptr;

use crate::context::{WORKER, WorkerContext};
use crate::flowvar::Flowvar;
use crate::task::{FutureEnvHead, ReductionDagNode, Task};

// -----------------------------------------------------------------------------
// LoopBackoff

/// Prevents `1 << window_log_size` from overflowing the stride shift on
/// degenerate loops that fail the idle check for a very long time.
const MAX_WINDOW_LOG_SIZE: u32 = 32;

/// Split-check schedule for one run of a loop task.
///
/// The check fires when the loop index reaches `next_check`, which then
/// advances by `stride << window_log_size`. The window follows a log-log
/// iterated backoff: it takes `log2(window_log_size)` consecutive failures to
/// widen the window one notch, while any success narrows it immediately.
pub(crate) struct LoopBackoff {
    next_check: isize,
    window_log_size: u32,
    round: u32,
}

impl LoopBackoff {
    #[inline]
    pub(crate) fn new(start: isize) -> Self {
        Self {
            next_check: start,
            window_log_size: 0,
            round: 0,
        }
    }

    /// The check found nothing to do: widen the window, slowly.
    #[inline]
    fn increase(&mut self) {
        self.round += 1;
        if self.round >= log2_floor(self.window_log_size) {
            self.round = 0;
            self.window_log_size = (self.window_log_size + 1).min(MAX_WINDOW_LOG_SIZE);
        }
    }

    /// The check split work off: narrow the window.
    #[inline]
    fn decrease(&mut self) {
        self.round = 0;
        self.window_log_size = self.window_log_size.saturating_sub(1);
    }
}

#[inline(always)]
fn log2_floor(x: u32) -> u32 {
    (u32::BITS - 1) - (x | 1).leading_zeros()
}

// -----------------------------------------------------------------------------
// Load balancing

/// Poll site executed before every loop iteration; does nothing except on
/// check indices.
///
/// On fire: splits will not be consumed while previous ones still sit in the
/// local queue, so that case only widens the window. Otherwise the number of
/// idle workers is estimated from the global backoff's waiter counts, plus
/// one for the spawner while this chunk has not run its first iteration
/// (the spawner published the task and is on its way to wait for it).
///
/// # Safety
///
/// `task` must be the loop task currently run by `ctx`'s worker.
#[inline]
unsafe fn load_balance_loop(
    ctx: &WorkerContext,
    task: *mut Task,
    idx: isize,
    backoff: &mut LoopBackoff,
) {
    if idx != backoff.next_check {
        return;
    }

    if unsafe { (*task).loop_steps_left } > 1 {
        if !ctx.queue().is_empty() {
            backoff.increase();
        } else {
            let (pre_sleep, committed) = ctx.pool_state().global_backoff.num_waiters();
            let mut approx_idle = pre_sleep as isize + committed as isize;
            if unsafe { (*task).is_first_iter } {
                approx_idle += 1;
            }

            if approx_idle > 0 {
                unsafe { split_and_dispatch(ctx, task, idx, approx_idle as usize) };
                backoff.decrease();
            } else {
                backoff.increase();
            }
        }
    }

    backoff.next_check += unsafe { (*task).loop_stride } << backoff.window_log_size;
}

/// Carves the remaining `[idx, stop)` steps into `approx_idle + 1` chunks
/// whose sizes differ by at most one, keeps chunk 0 on the running task and
/// publishes the rest as upper splits.
///
/// Each split is a byte copy of the running task (header + env) with its
/// range rewritten and its synchronization state reset. Splits inherit the
/// scope barrier; future-carrying splits (reductions) get their env
/// self-pointer re-pointed and are linked into the running task's reduction
/// DAG for the merge phase.
///
/// # Safety
///
/// `task` must be the loop task currently run by `ctx`'s worker, with more
/// than one step left.
#[cold]
unsafe fn split_and_dispatch(
    ctx: &WorkerContext,
    task: *mut Task,
    cur_idx: isize,
    approx_idle: usize,
) {
    let stride = unsafe { (*task).loop_stride };
    let orig_stop = unsafe { (*task).loop_stop };
    let steps_left = unsafe { (*task).loop_steps_left };
    debug_assert!(steps_left > 1);

    let chunks = approx_idle as isize + 1;
    let base = steps_left / chunks;
    let cutoff = steps_left % chunks;

    // Chunk 0 stays with us.
    let keep = base + (cutoff > 0) as isize;
    unsafe {
        (*task).loop_steps_left = keep;
        (*task).loop_stop = orig_stop.min(cur_idx + keep * stride);
    }

    let mut dispatched = 0u64;
    for i in 1..chunks {
        let chunk = base + (i < cutoff) as isize;
        if chunk == 0 {
            // More claimed idlers than remaining steps.
            break;
        }
        let offset = cur_idx
            + stride
                * if i < cutoff {
                    chunk * i
                } else {
                    base * i + cutoff
                };

        unsafe {
            let upper = Task::clone_for_split(task);
            (*upper).loop_start = offset;
            (*upper).loop_stop = orig_stop.min(offset + chunk * stride);
            (*upper).loop_steps_left = chunk;

            let barrier = (*upper).scoped_barrier;
            if !barrier.is_null() {
                (*barrier).register_descendant();
            }

            if (*upper).has_future {
                Task::set_future_self_ptr(upper);
                let node = Box::into_raw(Box::new(ReductionDagNode {
                    task: upper,
                    next: (*task).reduction_dag,
                }));
                (*task).reduction_dag = node;
            }

            ctx.queue().push(upper as *mut u8);
        }
        dispatched += 1;
    }

    ctx.counters.add_loop_splits(dispatched);
    log::trace!(
        "worker {} split {dispatched} chunk(s) off a loop at index {cur_idx}",
        ctx.id.get()
    );
    ctx.pool_state().global_backoff.wake_all();
}

// -----------------------------------------------------------------------------
// Loop environments

/// Env of a plain parallel-for task: a pointer to the caller's body closure.
/// The caller blocks until the whole range retires, which pins the closure.
#[repr(C)]
pub(crate) struct ForLoopEnv<F> {
    pub(crate) body: *const F,
}

/// Env of a parallel-reduce task: the future head (self-pointer + result
/// slot), then a pointer to the caller's operation bundle.
#[repr(C)]
pub(crate) struct ReduceEnv<T, O> {
    pub(crate) head: FutureEnvHead<T>,
    pub(crate) ops: *const O,
}

/// The three user phases of a reduction, borrowed from the caller's frame.
pub(crate) struct ReduceOps<T, I, F, M> {
    /// Thread-local accumulator init.
    pub(crate) init: I,
    /// Fold one index into the local accumulator.
    pub(crate) fold: F,
    /// Combine the local accumulator with one remote partial.
    pub(crate) merge: M,
    pub(crate) _result: PhantomData<fn() -> T>,
}

// -----------------------------------------------------------------------------
// Loop wrappers

/// Trampoline of parallel-for tasks: the balanced loop around the user body.
pub(crate) unsafe fn parallel_for_wrapper<F>(env: *mut u8)
where
    F: Fn(usize) + Sync,
{
    let body = unsafe { &*(*(env as *const ForLoopEnv<F>)).body };

    WORKER.with(|ctx| {
        let task = ctx.current_task.get();
        unsafe {
            let stride = (*task).loop_stride;
            let mut backoff = LoopBackoff::new((*task).loop_start);
            let mut idx = (*task).loop_start;
            while idx < (*task).loop_stop {
                load_balance_loop(ctx, task, idx, &mut backoff);
                body(idx as usize);
                (*task).loop_steps_left -= 1;
                (*task).is_first_iter = false;
                idx += stride;
            }
            debug_assert_eq!((*task).loop_steps_left, 0);
        }
    });
}

/// Trampoline of parallel-reduce tasks: prologue, balanced loop, merge of
/// every partial in the reduction DAG (reverse spawn order), epilogue.
pub(crate) unsafe fn parallel_reduce_wrapper<T, I, F, M>(env: *mut u8)
where
    T: Send,
    I: Fn() -> T + Sync,
    F: Fn(T, usize) -> T + Sync,
    M: Fn(T, T) -> T + Sync,
{
    let env = env as *mut ReduceEnv<T, ReduceOps<T, I, F, M>>;

    WORKER.with(|ctx| {
        let task = ctx.current_task.get();
        unsafe {
            let ops = &*(*env).ops;

            let mut acc = (ops.init)();

            let stride = (*task).loop_stride;
            let mut backoff = LoopBackoff::new((*task).loop_start);
            let mut idx = (*task).loop_start;
            while idx < (*task).loop_stop {
                load_balance_loop(ctx, task, idx, &mut backoff);
                acc = (ops.fold)(acc, idx as usize);
                (*task).loop_steps_left -= 1;
                (*task).is_first_iter = false;
                idx += stride;
            }

            // Each partial is itself a loop task produced by a split; splits
            // are chained strictly parent-to-child, so the walk is acyclic
            // and needs no coordination beyond syncing each flowvar.
            let mut node = (*task).reduction_dag;
            while !node.is_null() {
                let dag = Box::from_raw(node);
                let remote = Flowvar::<T>::from_task(dag.task);
                acc = (ops.merge)(acc, remote.sync());
                node = dag.next;
            }
            (*task).reduction_dag = ptr::null_mut();

            (*(env as *mut FutureEnvHead<T>)).result.write(acc);
        }
    });
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::{LoopBackoff, log2_floor};

    #[test]
    fn log2_floor_values() {
        assert_eq!(log2_floor(0), 0);
        assert_eq!(log2_floor(1), 0);
        assert_eq!(log2_floor(2), 1);
        assert_eq!(log2_floor(3), 1);
        assert_eq!(log2_floor(4), 2);
        assert_eq!(log2_floor(1024), 10);
    }

    #[test]
    fn window_widens_slowly_and_narrows_fast() {
        let mut backoff = LoopBackoff::new(0);

        // First failures widen quickly while the window is tiny.
        backoff.increase();
        assert_eq!(backoff.window_log_size, 1);
        backoff.increase();
        assert_eq!(backoff.window_log_size, 2);

        backoff.increase();
        assert_eq!(backoff.window_log_size, 3);
        backoff.increase();
        assert_eq!(backoff.window_log_size, 4);

        // From window 4 it takes log2(4) = 2 failures per notch.
        backoff.increase();
        assert_eq!(backoff.window_log_size, 4);
        backoff.increase();
        assert_eq!(backoff.window_log_size, 5);

        // One success narrows one notch and resets the round counter.
        backoff.decrease();
        assert_eq!(backoff.window_log_size, 4);
        assert_eq!(backoff.round, 0);
    }
}
