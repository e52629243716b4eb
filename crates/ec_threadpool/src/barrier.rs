use core::sync::atomic::AtomicI64;
use core::sync::atomic::Ordering::{Acquire, Release};

// -----------------------------------------------------------------------------
// ScopedBarrier

/// Counter of in-flight descendant tasks for one lexical scope.
///
/// Every spawn targeting the scope increments the counter before the task is
/// published; the worker running the task decrements it after the task body
/// returns. The scope exit blocks until the counter reads zero, at which
/// point every transitive descendant has completed.
///
/// Lives on the stack of the scope owner; tasks hold a raw pointer to it,
/// which the blocking wait at scope exit keeps valid.
pub(crate) struct ScopedBarrier {
    descendants: AtomicI64,
}

impl ScopedBarrier {
    #[inline]
    pub const fn new() -> Self {
        Self {
            descendants: AtomicI64::new(0),
        }
    }

    /// Accounts for a task spawned into this scope. Called before the task
    /// can possibly run.
    #[inline]
    pub fn register_descendant(&self) {
        self.descendants.fetch_add(1, Release);
    }

    /// Retires a finished task. Called by the running worker after the task
    /// body returns.
    #[inline]
    pub fn unlist_descendant(&self) {
        let previous = self.descendants.fetch_sub(1, Release);
        debug_assert!(previous > 0);
    }

    /// True once every registered descendant has retired.
    ///
    /// Acquire-loads so the caller observes the env writes of all retired
    /// descendants.
    #[inline]
    pub fn is_cleared(&self) -> bool {
        self.descendants.load(Acquire) == 0
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::ScopedBarrier;

    #[test]
    fn clears_only_when_balanced() {
        let barrier = ScopedBarrier::new();
        assert!(barrier.is_cleared());

        barrier.register_descendant();
        barrier.register_descendant();
        assert!(!barrier.is_cleared());

        barrier.unlist_descendant();
        assert!(!barrier.is_cleared());
        barrier.unlist_descendant();
        assert!(barrier.is_cleared());
    }
}
