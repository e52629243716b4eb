//! A multi-waiter parking primitive in the classic eventcount shape:
//! waiters snapshot an epoch, re-check their condition, and only block if the
//! epoch has not moved; every wake advances the epoch.

use core::sync::atomic::Ordering::{Relaxed, SeqCst};
use core::sync::atomic::{AtomicU32, AtomicU64, fence};

use std::sync::{Condvar, Mutex, PoisonError};

use crossbeam_utils::CachePadded;

// -----------------------------------------------------------------------------
// SleepTicket

/// Token returned by [`EventCount::sleepy`].
///
/// Snapshot of the epoch at pre-sleep time. A wake occurring between
/// [`sleepy`] and [`sleep`] invalidates the ticket: the subsequent
/// [`sleep`] call consumes the wake and returns without blocking.
///
/// [`sleepy`]: EventCount::sleepy
/// [`sleep`]: EventCount::sleep
#[must_use = "a sleepy ticket must be passed to `sleep` or cancelled"]
pub struct SleepTicket {
    epoch: u64,
}

// -----------------------------------------------------------------------------
// EventCount

/// Multi-producer/multi-consumer parking with a two-phase sleep.
///
/// An idle worker first declares intent with [`sleepy`], makes one last
/// attempt at finding work, then either commits with [`sleep`] or abandons
/// with [`cancel_sleep`]. A producer that publishes work calls [`wake`]; the
/// two-phase protocol closes the classic race where work is published right
/// after the worker's last failed search.
///
/// [`wake`] prefers pre-sleep waiters over committed sleepers: the former
/// observe the advanced epoch when they commit and return without a syscall.
///
/// Spurious wake-ups are permitted; callers re-check their own condition.
///
/// [`sleepy`]: EventCount::sleepy
/// [`sleep`]: EventCount::sleep
/// [`cancel_sleep`]: EventCount::cancel_sleep
/// [`wake`]: EventCount::wake
pub struct EventCount {
    /// Advanced by every wake. Read lock-free by `sleepy`, written under
    /// `lock` so a committed sleeper cannot miss an advance between its
    /// epoch check and its condvar wait.
    epoch: CachePadded<AtomicU64>,
    /// Number of waiters between `sleepy` and `sleep`/`cancel_sleep`.
    pre_sleep: CachePadded<AtomicU32>,
    /// Number of waiters blocked inside `sleep`.
    committed: CachePadded<AtomicU32>,
    lock: Mutex<()>,
    cond: Condvar,
}

impl EventCount {
    pub const fn new() -> Self {
        Self {
            epoch: CachePadded::new(AtomicU64::new(0)),
            pre_sleep: CachePadded::new(AtomicU32::new(0)),
            committed: CachePadded::new(AtomicU32::new(0)),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Declares intent to sleep and snapshots the epoch.
    ///
    /// Must be followed by exactly one of [`sleep`](EventCount::sleep) or
    /// [`cancel_sleep`](EventCount::cancel_sleep).
    #[inline]
    pub fn sleepy(&self) -> SleepTicket {
        self.pre_sleep.fetch_add(1, SeqCst);
        SleepTicket {
            epoch: self.epoch.load(SeqCst),
        }
    }

    /// Abandons a declared sleep intent.
    #[inline]
    pub fn cancel_sleep(&self) {
        self.pre_sleep.fetch_sub(1, SeqCst);
    }

    /// Commits the sleep and blocks until a wake moves the epoch past the
    /// ticket. Returns immediately if one already has.
    pub fn sleep(&self, ticket: SleepTicket) {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.pre_sleep.fetch_sub(1, SeqCst);
        self.committed.fetch_add(1, SeqCst);

        while self.epoch.load(SeqCst) == ticket.epoch {
            guard = self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }

        self.committed.fetch_sub(1, SeqCst);
    }

    /// Wakes at most one waiter, preferring pre-sleep over committed.
    pub fn wake(&self) {
        // Pairs with the SeqCst counter update in `sleepy`: either this load
        // observes the waiter, or the waiter's post-`sleepy` search observes
        // the work published before this call.
        fence(SeqCst);
        if self.pre_sleep.load(Relaxed) == 0 && self.committed.load(Relaxed) == 0 {
            return;
        }

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.epoch.fetch_add(1, SeqCst);
        // A pre-sleep waiter absorbs the epoch advance without blocking;
        // signal the condvar only when none can.
        if self.pre_sleep.load(Relaxed) == 0 && self.committed.load(Relaxed) > 0 {
            self.cond.notify_one();
        }
    }

    /// Wakes every waiter.
    pub fn wake_all(&self) {
        fence(SeqCst);
        if self.pre_sleep.load(Relaxed) == 0 && self.committed.load(Relaxed) == 0 {
            return;
        }

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.epoch.fetch_add(1, SeqCst);
        self.cond.notify_all();
    }

    /// Advisory `(pre_sleep, committed)` waiter counts.
    ///
    /// Racy by nature; used as an idle-worker estimate by load balancing.
    #[inline]
    pub fn num_waiters(&self) -> (u32, u32) {
        (self.pre_sleep.load(Relaxed), self.committed.load(Relaxed))
    }
}

impl Default for EventCount {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::EventCount;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wake_between_sleepy_and_sleep_is_consumed() {
        let ev = EventCount::new();
        let ticket = ev.sleepy();
        assert_eq!(ev.num_waiters(), (1, 0));
        ev.wake();
        // The ticket is stale: this must not block.
        ev.sleep(ticket);
        assert_eq!(ev.num_waiters(), (0, 0));
    }

    #[test]
    fn cancel_restores_counts() {
        let ev = EventCount::new();
        let _ticket = ev.sleepy();
        ev.cancel_sleep();
        assert_eq!(ev.num_waiters(), (0, 0));
    }

    #[test]
    fn wake_releases_committed_sleeper() {
        let ev = EventCount::new();
        let flag = AtomicBool::new(false);
        let gate = Barrier::new(2);

        thread::scope(|s| {
            s.spawn(|| {
                let ticket = ev.sleepy();
                gate.wait();
                ev.sleep(ticket);
                flag.store(true, Ordering::Release);
            });

            gate.wait();
            // Wait for the sleeper to commit, then wake it.
            while ev.num_waiters().1 == 0 {
                thread::yield_now();
            }
            ev.wake();
        });

        assert!(flag.load(Ordering::Acquire));
    }

    #[test]
    fn wake_all_releases_everyone() {
        let ev = EventCount::new();
        const SLEEPERS: u32 = 4;

        thread::scope(|s| {
            for _ in 0..SLEEPERS {
                s.spawn(|| {
                    let ticket = ev.sleepy();
                    ev.sleep(ticket);
                });
            }

            while ev.num_waiters().1 != SLEEPERS {
                thread::sleep(Duration::from_millis(1));
            }
            ev.wake_all();
        });

        assert_eq!(ev.num_waiters(), (0, 0));
    }

    #[test]
    fn wake_without_waiters_is_cheap_noop() {
        let ev = EventCount::new();
        ev.wake();
        ev.wake_all();
        assert_eq!(ev.num_waiters(), (0, 0));
    }
}
