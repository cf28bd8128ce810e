use std::cell::Cell;

use crate::error::{Error, Result};

/// Byte accounting for everything queued inside the broker.
///
/// Every staged enqueue reserves its bytes here before becoming visible, so
/// memory pressure surfaces as a distinguished failure at staging time and
/// transactions can roll back cleanly. A deterministic failure injector
/// drives the out-of-memory tests.
pub(crate) struct MemPool {
    capacity: Option<usize>,
    used: Cell<usize>,
    /// When set, this many reservations succeed and the next one fails.
    fail_after: Cell<Option<usize>>,
}

impl MemPool {
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            used: Cell::new(0),
            fail_after: Cell::new(None),
        }
    }

    /// Reserve `bytes`, failing when the pool is exhausted.
    pub(crate) fn reserve(&self, bytes: usize) -> Result<()> {
        if let Some(countdown) = self.fail_after.get() {
            if countdown == 0 {
                self.fail_after.set(None);
                return Err(Error::no_memory());
            }

            self.fail_after.set(Some(countdown - 1));
        }

        let used = self.used.get();

        if let Some(capacity) = self.capacity {
            if used + bytes > capacity {
                return Err(Error::no_memory());
            }
        }

        self.used.set(used + bytes);
        Ok(())
    }

    /// Return `bytes` to the pool.
    pub(crate) fn release(&self, bytes: usize) {
        let used = self.used.get();
        debug_assert!(bytes <= used, "released more than was reserved");
        self.used.set(used.saturating_sub(bytes));
    }

    /// The number of bytes currently reserved.
    pub(crate) fn used(&self) -> usize {
        self.used.get()
    }

    /// Arrange for the reservation after the next `countdown` to fail once.
    pub(crate) fn fail_after(&self, countdown: usize) {
        self.fail_after.set(Some(countdown));
    }
}

#[cfg(test)]
mod tests {
    use super::MemPool;

    #[test]
    fn capacity_is_enforced() {
        let pool = MemPool::new(Some(100));
        pool.reserve(60).unwrap();
        pool.reserve(40).unwrap();
        assert!(pool.reserve(1).is_err());

        pool.release(40);
        pool.reserve(30).unwrap();
        assert_eq!(pool.used(), 90);
    }

    #[test]
    fn injected_failure_fires_once() {
        let pool = MemPool::new(None);
        pool.fail_after(2);

        pool.reserve(1).unwrap();
        pool.reserve(1).unwrap();
        assert!(pool.reserve(1).unwrap_err().is_no_memory());
        pool.reserve(1).unwrap();
    }
}
