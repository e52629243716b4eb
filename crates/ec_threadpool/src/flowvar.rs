#![expect(unsafe_code, reason = "handle over a raw task allocation")]

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::Ordering::Acquire;

use crate::context::WORKER;
use crate::task::{FutureEnvHead, Task};

// -----------------------------------------------------------------------------
// Flowvar

/// Handle to the future result of a spawned task.
///
/// Created by [`spawn_with_handle`], [`spawn_awaitable`] and internally by
/// parallel reductions; consumed by [`sync`], which blocks until the task
/// completed and returns its result. While blocked, the calling worker keeps
/// executing other tasks rather than idling.
///
/// Dropping a `Flowvar` without syncing it is a logic error: the task's
/// allocation leaks. Debug builds assert on it.
///
/// [`spawn_with_handle`]: crate::spawn_with_handle
/// [`spawn_awaitable`]: crate::spawn_awaitable
/// [`sync`]: Flowvar::sync
#[must_use = "a flowvar must be synced; dropping it leaks the task"]
pub struct Flowvar<T> {
    /// Null once synced.
    task: Cell<*mut Task>,
    _result: PhantomData<T>,
}

unsafe impl<T: Send> Send for Flowvar<T> {}

impl<T> Flowvar<T> {
    /// # Safety
    ///
    /// `task` must be a published future-carrying task whose env begins with
    /// a `FutureEnvHead<T>`, and this must be its only flowvar.
    pub(crate) unsafe fn from_task(task: *mut Task) -> Self {
        debug_assert!(unsafe { (*task).has_future });
        Self {
            task: Cell::new(task),
            _result: PhantomData,
        }
    }

    /// Non-blocking completion probe.
    #[inline]
    pub fn is_ready(&self) -> bool {
        let task = self.task.get();
        debug_assert!(!task.is_null());
        unsafe { (*task).completed.load(Acquire) }
    }

    /// Blocks until the task completed and returns its result.
    ///
    /// Must be called from a thread of the pool the task was spawned on. The
    /// worker runs its own descendants, steals, and finally parks while it
    /// waits; see the completion protocol in the crate docs.
    pub fn sync(self) -> T {
        let task = self.task.replace(ptr::null_mut());
        debug_assert!(!task.is_null());

        WORKER.with(|ctx| {
            debug_assert!(ctx.is_bound(), "sync must run on a threadpool thread");
            unsafe {
                if !(*task).completed.load(Acquire) {
                    ctx.complete_future(task);
                }

                // The runner's release of `completed` orders its env writes
                // before our acquire above.
                let head = Task::env(task) as *mut FutureEnvHead<T>;
                debug_assert_eq!((*head).task, task);
                let result = (*head).result.assume_init_read();
                Task::free(task);
                result
            }
        })
    }
}

impl<T> Drop for Flowvar<T> {
    fn drop(&mut self) {
        debug_assert!(
            self.task.get().is_null(),
            "flowvar dropped without sync; the task allocation leaks"
        );
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::Flowvar;

    #[test]
    fn is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Flowvar<u64>>();
        assert_send::<Flowvar<bool>>();
    }
}
