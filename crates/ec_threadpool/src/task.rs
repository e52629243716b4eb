//! The task header and its inline environment.
//!
//! A task is one heap allocation: a fixed `Task` header followed by a
//! variable-size, type-erased environment. The header carries the trampoline
//! function pointer, ancestry, parallel-for metadata and the synchronization
//! state; the environment carries whatever the trampoline was monomorphised
//! for. Keeping the environment inline is what makes loop splitting a plain
//! `memcpy` of the whole block.
#![expect(unsafe_code, reason = "manual layout of header + inline environment")]

use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr};

use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};

use ec_sync::EventNotifier;

use crate::barrier::ScopedBarrier;

// -----------------------------------------------------------------------------
// Sentinels

/// `loop_steps_left` value of a task that is not a parallel-for chunk.
pub(crate) const NOT_A_LOOP: isize = -1;

/// `thief_id` value of a task that has not been stolen.
pub(crate) const SENTINEL_THIEF: i32 = -1;

const ROOT_TASK_ADDR: usize = 0xEFFA_CED0;
const READY_FUTURE_ADDR: usize = 0xCA11_AB1E;

/// Parent of top-level tasks and `current_task` of a worker that is not
/// running one. Never dereferenced.
#[inline(always)]
pub(crate) const fn root_task() -> *mut Task {
    ptr::without_provenance_mut(ROOT_TASK_ADDR)
}

#[inline(always)]
pub(crate) fn is_root_task(task: *const Task) -> bool {
    task.addr() == ROOT_TASK_ADDR
}

/// `waiter` value published by the completer: the future is done and no
/// notifier will be read. Never dereferenced.
#[inline(always)]
pub(crate) const fn ready_future() -> *mut EventNotifier {
    ptr::without_provenance_mut(READY_FUTURE_ADDR)
}

#[inline(always)]
pub(crate) fn is_ready_future(waiter: *const EventNotifier) -> bool {
    waiter.addr() == READY_FUTURE_ADDR
}

// -----------------------------------------------------------------------------
// Task

/// Type-erased task body. Receives a pointer to the task's environment; the
/// running task itself is available through the worker context.
pub(crate) type TaskFn = unsafe fn(*mut u8);

/// Task header. The environment follows at [`Task::env`].
///
/// Field ownership once the task is published:
/// - the loop metadata, `is_first_iter` and `reduction_dag` are mutated only
///   by the worker currently running the task;
/// - `completed` flips false→true exactly once, by the runner, after the body
///   returns;
/// - `thief_id` is written at most once, by the thief whose steal won;
/// - `waiter` is exchanged by the syncing worker (installing its notifier)
///   and by the completer (publishing [`ready_future`]).
#[repr(C, align(64))]
pub(crate) struct Task {
    pub(crate) body: TaskFn,
    pub(crate) env_size: u32,
    /// True if a [`Flowvar`](crate::Flowvar) was handed out: the flowvar owns
    /// the free, and completion must be published.
    pub(crate) has_future: bool,
    /// True until a parallel-for chunk has run its first iteration; the
    /// load balancer counts the not-yet-started spawner as idle while set.
    pub(crate) is_first_iter: bool,
    pub(crate) parent: *mut Task,
    pub(crate) scoped_barrier: *mut ScopedBarrier,
    /// Sibling split tasks whose partial results this task must merge
    /// (parallel-reduce only).
    pub(crate) reduction_dag: *mut ReductionDagNode,

    // Loop metadata, meaningful only when `loop_steps_left != NOT_A_LOOP`.
    pub(crate) loop_start: isize,
    /// Exclusive.
    pub(crate) loop_stop: isize,
    pub(crate) loop_stride: isize,
    pub(crate) loop_steps_left: isize,

    pub(crate) completed: AtomicBool,
    pub(crate) thief_id: AtomicI32,
    pub(crate) waiter: AtomicPtr<EventNotifier>,
}

impl Task {
    const ALIGN: usize = 64;

    fn layout(env_size: usize) -> Layout {
        // `size_of::<Task>()` is a multiple of 64, so the env lands on a
        // 64-byte boundary and any env alignment up to 64 is satisfied.
        Layout::from_size_align(size_of::<Task>() + env_size, Self::ALIGN)
            .expect("task environment too large")
    }

    fn alloc_raw(env_size: usize) -> *mut Task {
        let layout = Self::layout(env_size);
        let task = unsafe { alloc(layout) } as *mut Task;
        if task.is_null() {
            handle_alloc_error(layout);
        }
        task
    }

    /// Pointer to the inline environment.
    #[inline(always)]
    pub(crate) fn env(task: *mut Task) -> *mut u8 {
        unsafe { (task as *mut u8).add(size_of::<Task>()) }
    }

    /// Frees the header + environment block.
    ///
    /// # Safety
    ///
    /// `task` must have been produced by this module and not freed before,
    /// and no other thread may still access it.
    pub(crate) unsafe fn free(task: *mut Task) {
        let env_size = unsafe { (*task).env_size } as usize;
        unsafe { dealloc(task as *mut u8, Self::layout(env_size)) }
    }

    /// Allocates a non-loop task and moves `env` into the inline buffer.
    ///
    /// # Safety
    ///
    /// `body` must be the trampoline monomorphised for `E`.
    pub(crate) unsafe fn new<E>(
        body: TaskFn,
        env: E,
        parent: *mut Task,
        scoped_barrier: *mut ScopedBarrier,
        has_future: bool,
    ) -> *mut Task {
        unsafe {
            let task = Self::new_loop(
                body,
                env,
                parent,
                scoped_barrier,
                has_future,
                0,
                0,
                0,
                NOT_A_LOOP,
            );
            (*task).is_first_iter = false;
            task
        }
    }

    /// Allocates a loop task covering `[start, stop)` with `stride`.
    ///
    /// # Safety
    ///
    /// `body` must be the trampoline monomorphised for `E`.
    pub(crate) unsafe fn new_loop<E>(
        body: TaskFn,
        env: E,
        parent: *mut Task,
        scoped_barrier: *mut ScopedBarrier,
        has_future: bool,
        start: isize,
        stop: isize,
        stride: isize,
        steps: isize,
    ) -> *mut Task {
        const {
            assert!(align_of::<E>() <= Task::ALIGN);
        }

        let task = Self::alloc_raw(size_of::<E>());
        unsafe {
            (*task).body = body;
            (*task).env_size = size_of::<E>() as u32;
            (*task).has_future = has_future;
            (*task).is_first_iter = true;
            (*task).parent = parent;
            (*task).scoped_barrier = scoped_barrier;
            (*task).reduction_dag = ptr::null_mut();
            (*task).loop_start = start;
            (*task).loop_stop = stop;
            (*task).loop_stride = stride;
            (*task).loop_steps_left = steps;
            (*task).completed = AtomicBool::new(false);
            (*task).thief_id = AtomicI32::new(SENTINEL_THIEF);
            (*task).waiter = AtomicPtr::new(ptr::null_mut());
            ptr::write(Self::env(task) as *mut E, env);
        }
        task
    }

    /// Copies the whole header + env block for an upper loop split and resets
    /// the copy's synchronization state. The caller overwrites the loop range
    /// and fixes up the env self-pointer if the task carries a future.
    ///
    /// # Safety
    ///
    /// `task` must be a live loop task owned by the calling worker.
    pub(crate) unsafe fn clone_for_split(task: *mut Task) -> *mut Task {
        unsafe {
            let size = size_of::<Task>() + (*task).env_size as usize;
            let upper = Self::alloc_raw((*task).env_size as usize);
            ptr::copy_nonoverlapping(task as *const u8, upper as *mut u8, size);

            (*upper).is_first_iter = false;
            (*upper).reduction_dag = ptr::null_mut();
            (*upper).completed = AtomicBool::new(false);
            (*upper).thief_id = AtomicI32::new(SENTINEL_THIEF);
            (*upper).waiter = AtomicPtr::new(ptr::null_mut());
            upper
        }
    }

    /// Re-points the env's leading self-pointer at `task` itself.
    ///
    /// # Safety
    ///
    /// The task's env must begin with a [`FutureEnvHead`].
    pub(crate) unsafe fn set_future_self_ptr(task: *mut Task) {
        unsafe {
            debug_assert!((*task).has_future);
            // The head's first field is the self-pointer, at env offset 0
            // regardless of the result type.
            *(Self::env(task) as *mut *mut Task) = task;
        }
    }
}

// -----------------------------------------------------------------------------
// FutureEnvHead

/// Leading fields of the environment of every future-carrying task: the
/// self-pointer first, the result slot second. Fixed layout so a split can
/// fix up the self-pointer without knowing `T`.
#[repr(C)]
pub(crate) struct FutureEnvHead<T> {
    /// Back-pointer to the owning task; re-pointed when a split copies the
    /// env into a new allocation.
    pub(crate) task: *mut Task,
    /// Written by the trampoline before the runner releases `completed`.
    pub(crate) result: MaybeUninit<T>,
}

// -----------------------------------------------------------------------------
// ReductionDagNode

/// One link of a task's reduction DAG: a sibling split whose partial result
/// must be merged. Nodes are pushed LIFO as splits are carved off, so the
/// merge walk runs in reverse spawn order. Owned by the splitting task and
/// freed as the walk consumes them.
pub(crate) struct ReductionDagNode {
    pub(crate) task: *mut Task,
    pub(crate) next: *mut ReductionDagNode,
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_cache_line_sized() {
        assert_eq!(size_of::<Task>() % 64, 0);
        assert_eq!(align_of::<Task>(), 64);
    }

    #[test]
    fn sentinels_are_recognised() {
        assert!(is_root_task(root_task()));
        assert!(is_ready_future(ready_future()));
        assert!(!is_root_task(ptr::null_mut()));
        assert!(!is_ready_future(ptr::null_mut()));
    }

    #[test]
    fn alloc_roundtrip_preserves_env() {
        unsafe fn never(_: *mut u8) {
            unreachable!();
        }

        let env: [u64; 3] = [1, 2, 3];
        let task = unsafe {
            Task::new(
                never,
                env,
                root_task(),
                core::ptr::null_mut(),
                false,
            )
        };

        unsafe {
            assert_eq!((*task).env_size as usize, size_of::<[u64; 3]>());
            assert_eq!((*task).loop_steps_left, NOT_A_LOOP);
            assert_eq!(*(Task::env(task) as *const [u64; 3]), [1, 2, 3]);
            Task::free(task);
        }
    }

    #[test]
    fn split_clone_copies_env_and_resets_sync_state() {
        unsafe fn never(_: *mut u8) {
            unreachable!();
        }

        let task = unsafe {
            Task::new_loop(
                never,
                0xABCD_u64,
                root_task(),
                core::ptr::null_mut(),
                false,
                0,
                100,
                1,
                100,
            )
        };

        unsafe {
            use core::sync::atomic::Ordering::Relaxed;

            (*task).thief_id.store(3, Relaxed);
            let upper = Task::clone_for_split(task);

            assert_eq!(*(Task::env(upper) as *const u64), 0xABCD);
            assert_eq!((*upper).thief_id.load(Relaxed), SENTINEL_THIEF);
            assert!(!(*upper).completed.load(Relaxed));
            assert!(!(*upper).is_first_iter);
            assert_eq!((*upper).loop_stop, 100);

            Task::free(upper);
            Task::free(task);
        }
    }
}
