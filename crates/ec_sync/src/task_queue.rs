//! See <https://docs.rs/crate/crossbeam-deque/latest> and
//! "Correct and Efficient Work-Stealing for Weak Memory Models"
//! (Lê, Pop, Cohen, Zappa Nardelli, PPoPP 2013).
//!
//! Specialised to pointer-sized elements: every slot is an `AtomicPtr`, which
//! keeps all cross-thread slot accesses free of torn reads without an epoch
//! collector.
#![expect(unsafe_code, reason = "lock-free deque over raw pointers")]

use core::ptr;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use core::sync::atomic::{AtomicIsize, AtomicPtr, fence};

use crossbeam_utils::CachePadded;

// -----------------------------------------------------------------------------
// Buffer

/// One ring buffer generation of the deque.
struct Buffer {
    /// Power-of-two slot array.
    slots: Box<[AtomicPtr<u8>]>,
    /// `slots.len() - 1`.
    mask: isize,
    /// The previous, smaller generation.
    ///
    /// Retired generations stay allocated until the queue is dropped: a thief
    /// that loaded the buffer pointer before the owner grew the queue may
    /// still read from it. Entries are never mutated once published, and the
    /// grow copies every live logical index, so such stale reads remain
    /// valid. Total retired memory is bounded by the geometric growth.
    prev: *mut Buffer,
}

impl Buffer {
    fn alloc(capacity: usize, prev: *mut Buffer) -> *mut Buffer {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        Box::into_raw(Box::new(Buffer {
            slots,
            mask: capacity as isize - 1,
            prev,
        }))
    }

    #[inline(always)]
    fn capacity(&self) -> isize {
        self.mask + 1
    }

    /// Stores `task` at logical index `index`.
    #[inline(always)]
    fn write(&self, index: isize, task: *mut u8) {
        self.slots[(index & self.mask) as usize].store(task, Relaxed);
    }

    /// Loads the task at logical index `index`.
    #[inline(always)]
    fn read(&self, index: isize) -> *mut u8 {
        self.slots[(index & self.mask) as usize].load(Relaxed)
    }
}

// -----------------------------------------------------------------------------
// TaskQueue

/// A per-worker work-stealing deque over raw task pointers.
///
/// The queue has exactly one logical owner (the worker whose id matches the
/// queue's slot in the pool). [`push`] and [`pop`] are owner-only and operate
/// on the hot (LIFO) end with a single release store on publish. Any other
/// thread may call [`steal`], which removes the **oldest** entry, or
/// [`steal_half_into`], which additionally migrates up to half of the
/// remaining entries into the caller's own queue.
///
/// `steal` never blocks: under contention or emptiness it returns `None` and
/// the caller retries on another victim.
///
/// [`push`]: TaskQueue::push
/// [`pop`]: TaskQueue::pop
/// [`steal`]: TaskQueue::steal
/// [`steal_half_into`]: TaskQueue::steal_half_into
pub struct TaskQueue {
    /// Thief end: the oldest live logical index. Advanced by successful
    /// steals and by `pop` when it races a thief for the last entry.
    top: CachePadded<AtomicIsize>,
    /// Owner end: one past the newest live logical index.
    bottom: CachePadded<AtomicIsize>,
    /// Current buffer generation. Replaced (never mutated) on growth.
    buffer: AtomicPtr<Buffer>,
}

unsafe impl Send for TaskQueue {}
unsafe impl Sync for TaskQueue {}

impl TaskQueue {
    /// Creates a queue with room for `capacity` entries before the first
    /// growth. Rounded up to a power of two, minimum 2.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        Self {
            top: CachePadded::new(AtomicIsize::new(0)),
            bottom: CachePadded::new(AtomicIsize::new(0)),
            buffer: AtomicPtr::new(Buffer::alloc(capacity, ptr::null_mut())),
        }
    }

    /// Pushes a task on the owner end.
    ///
    /// Owner-only. Amortized O(1); grows the buffer when full.
    pub fn push(&self, task: *mut u8) {
        let b = self.bottom.load(Relaxed);
        let t = self.top.load(Acquire);
        let mut buffer = unsafe { &*self.buffer.load(Relaxed) };

        if b - t >= buffer.capacity() {
            buffer = unsafe { &*self.grow(t, b) };
        }

        buffer.write(b, task);
        self.bottom.store(b + 1, Release);
    }

    /// Doubles the buffer, copying the live logical range `[t, b)`.
    #[cold]
    fn grow(&self, t: isize, b: isize) -> *mut Buffer {
        let old_ptr = self.buffer.load(Relaxed);
        let old = unsafe { &*old_ptr };
        let new_ptr = Buffer::alloc(old.capacity() as usize * 2, old_ptr);
        let new = unsafe { &*new_ptr };
        for i in t..b {
            new.write(i, old.read(i));
        }
        // Publish before the subsequent bottom store so that a thief which
        // acquires the new bottom also sees the new buffer.
        self.buffer.store(new_ptr, Release);
        new_ptr
    }

    /// Pops the most recently pushed task.
    ///
    /// Owner-only.
    pub fn pop(&self) -> Option<*mut u8> {
        let b = self.bottom.load(Relaxed) - 1;
        let buffer = unsafe { &*self.buffer.load(Relaxed) };
        self.bottom.store(b, Relaxed);
        fence(SeqCst);
        let t = self.top.load(Relaxed);

        if t > b {
            // Queue was empty; undo the reservation.
            self.bottom.store(b + 1, Relaxed);
            return None;
        }

        let task = buffer.read(b);
        if t == b {
            // Last entry: race any thief for it via `top`.
            let won = self.top.compare_exchange(t, t + 1, SeqCst, Relaxed).is_ok();
            self.bottom.store(b + 1, Relaxed);
            return won.then_some(task);
        }
        Some(task)
    }

    /// Steals the oldest task.
    ///
    /// Callable from any thread. Fails with `None` when the queue is empty or
    /// when another thief (or the owner, on the last entry) wins the race.
    pub fn steal(&self) -> Option<*mut u8> {
        let t = self.top.load(Acquire);
        fence(SeqCst);
        let b = self.bottom.load(Acquire);
        if t >= b {
            return None;
        }

        let buffer = unsafe { &*self.buffer.load(Acquire) };
        let task = buffer.read(t);
        self.top
            .compare_exchange(t, t + 1, SeqCst, Relaxed)
            .is_ok()
            .then_some(task)
    }

    /// Steals up to half of this queue into `local`, returning one task for
    /// the caller to run immediately.
    ///
    /// `local` must be the queue owned by the calling worker. Used when the
    /// stealing policy suspects the victim holds coarse-grained work.
    pub fn steal_half_into(&self, local: &TaskQueue) -> Option<*mut u8> {
        let first = self.steal()?;
        let mut budget = (self.peek() as usize).div_ceil(2);
        while budget > 0 {
            match self.steal() {
                Some(task) => local.push(task),
                None => break,
            }
            budget -= 1;
        }
        Some(first)
    }

    /// Advisory number of queued tasks.
    ///
    /// May under- or over-estimate by one under concurrent operations.
    #[inline]
    pub fn peek(&self) -> i32 {
        let b = self.bottom.load(Relaxed);
        let t = self.top.load(Relaxed);
        (b - t).max(0) as i32
    }

    /// Advisory emptiness check. See [`peek`](TaskQueue::peek).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.peek() == 0
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        // The scheduler tears queues down only after they drained; any task
        // still queued here would leak.
        debug_assert!(self.is_empty());

        let mut buffer = *self.buffer.get_mut();
        while !buffer.is_null() {
            let boxed = unsafe { Box::from_raw(buffer) };
            buffer = boxed.prev;
        }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::TaskQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn fake(i: usize) -> *mut u8 {
        // Distinct, never-dereferenced markers.
        core::ptr::without_provenance_mut(i + 1)
    }

    fn index(p: *mut u8) -> usize {
        p.addr() - 1
    }

    #[test]
    fn owner_pop_is_lifo() {
        let q = TaskQueue::new(8);
        for i in 0..4 {
            q.push(fake(i));
        }
        for i in (0..4).rev() {
            assert_eq!(q.pop().map(index), Some(i));
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn steal_takes_oldest() {
        let q = TaskQueue::new(8);
        for i in 0..4 {
            q.push(fake(i));
        }
        assert_eq!(q.steal().map(index), Some(0));
        assert_eq!(q.steal().map(index), Some(1));
        assert_eq!(q.pop().map(index), Some(3));
        assert_eq!(q.pop().map(index), Some(2));
        assert!(q.steal().is_none());
    }

    #[test]
    fn grows_past_initial_capacity() {
        let q = TaskQueue::new(2);
        for i in 0..1000 {
            q.push(fake(i));
        }
        assert_eq!(q.peek(), 1000);
        for i in (0..1000).rev() {
            assert_eq!(q.pop().map(index), Some(i));
        }
    }

    #[test]
    fn steal_half_moves_entries() {
        let victim = TaskQueue::new(32);
        let local = TaskQueue::new(32);
        for i in 0..10 {
            victim.push(fake(i));
        }

        let got = victim.steal_half_into(&local).map(index);
        assert_eq!(got, Some(0));
        // Up to half of the 9 remaining entries migrated.
        let moved = local.peek();
        assert!(moved >= 1 && moved <= 5, "moved {moved}");
        assert_eq!(victim.peek() + moved, 9);
    }

    #[test]
    fn concurrent_thieves_lose_nothing() {
        const TASKS: usize = 10_000;
        const THIEVES: usize = 4;

        let q = TaskQueue::new(4);
        let seen = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..THIEVES {
                s.spawn(|| {
                    loop {
                        if let Some(p) = q.steal() {
                            seen.fetch_add(index(p), Ordering::Relaxed);
                        } else if seen.load(Ordering::Relaxed) >= done_marker() {
                            break;
                        }
                        std::hint::spin_loop();
                    }
                });
            }

            // Owner interleaves pushes and pops.
            let mut owner_sum = 0usize;
            for i in 0..TASKS {
                q.push(fake(i));
                if i % 3 == 0 {
                    if let Some(p) = q.pop() {
                        owner_sum += index(p);
                    }
                }
            }
            while let Some(p) = q.pop() {
                owner_sum += index(p);
            }
            seen.fetch_add(owner_sum + done_marker(), Ordering::Relaxed);
        });

        let total: usize = (0..TASKS).sum();
        assert_eq!(seen.load(Ordering::Relaxed) - done_marker(), total);
    }

    /// Sentinel added to the shared sum once the owner is done, so thieves
    /// know when an empty queue means "finished" rather than "not yet".
    fn done_marker() -> usize {
        1 << 60
    }
}
