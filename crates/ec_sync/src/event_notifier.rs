//! One-shot park/notify for a single consumer: the degenerate one-waiter
//! sibling of [`EventCount`](crate::EventCount), used when a worker must wait
//! for one specific task to complete.

use std::sync::{Condvar, Mutex, PoisonError};

// -----------------------------------------------------------------------------
// EventNotifier

/// Single-consumer one-shot park/notify.
///
/// Protocol, per wait:
///
/// 1. The consumer calls [`prepare_to_park`], arming the notifier.
/// 2. The consumer publishes its address somewhere the producer will find it,
///    re-checks its condition, and calls [`park`].
/// 3. The producer calls [`notify`]. Once armed, `notify` is idempotent and
///    may land before or after `park`; an early notify makes `park` return
///    immediately.
///
/// The notifier is reusable: the next `prepare_to_park` re-arms it.
///
/// [`prepare_to_park`]: EventNotifier::prepare_to_park
/// [`park`]: EventNotifier::park
/// [`notify`]: EventNotifier::notify
pub struct EventNotifier {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl EventNotifier {
    pub const fn new() -> Self {
        Self {
            signalled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Arms the notifier for one park/notify round.
    ///
    /// Consumer-only. Must not be called while a previous round's `notify`
    /// can still arrive.
    pub fn prepare_to_park(&self) {
        let mut signalled = self.signalled.lock().unwrap_or_else(PoisonError::into_inner);
        *signalled = false;
    }

    /// Blocks until [`notify`](EventNotifier::notify) is called.
    ///
    /// Consumer-only. Returns immediately if the notify already landed.
    pub fn park(&self) {
        let mut signalled = self.signalled.lock().unwrap_or_else(PoisonError::into_inner);
        while !*signalled {
            signalled = self.cond.wait(signalled).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wakes the consumer. Idempotent once armed.
    pub fn notify(&self) {
        let mut signalled = self.signalled.lock().unwrap_or_else(PoisonError::into_inner);
        *signalled = true;
        self.cond.notify_one();
    }
}

impl Default for EventNotifier {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::EventNotifier;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn notify_before_park_returns_immediately() {
        let n = EventNotifier::new();
        n.prepare_to_park();
        n.notify();
        n.notify(); // idempotent
        n.park();
    }

    #[test]
    fn park_until_notified_from_another_thread() {
        let n = EventNotifier::new();
        let gate = Barrier::new(2);

        thread::scope(|s| {
            s.spawn(|| {
                gate.wait();
                n.notify();
            });

            n.prepare_to_park();
            gate.wait();
            n.park();
        });
    }

    #[test]
    fn reusable_across_rounds() {
        let n = EventNotifier::new();
        for _ in 0..3 {
            n.prepare_to_park();
            n.notify();
            n.park();
        }
    }
}
