//! Memory-budgeted gate for concurrent uploads
//!
//! Every upload holds `ceil(size / 1024)` permits from a fixed pool for the
//! duration of the transfer. The pool is a fair (FIFO) semaphore, so a large
//! request waiting for budget is never overtaken by later, smaller ones.

use crate::error::{Direction, Error, Result};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Bounds the total KiB of blob data in flight
#[derive(Debug)]
pub struct MemoryGovernor {
    semaphore: Semaphore,
    capacity_kb: u32,
}

/// Budget held by one in-flight transfer; released on drop
#[derive(Debug)]
#[must_use = "dropping the permit releases the budget immediately"]
pub struct MemoryPermit<'a> {
    _permit: Option<SemaphorePermit<'a>>,
    kb: u32,
}

impl MemoryPermit<'_> {
    /// KiB of budget held
    #[must_use]
    pub fn kb(&self) -> u32 {
        self.kb
    }
}

impl MemoryGovernor {
    /// Create a governor with `capacity_kb` permits
    #[must_use]
    pub fn new(capacity_kb: u32) -> Self {
        Self {
            semaphore: Semaphore::new(capacity_kb as usize),
            capacity_kb,
        }
    }

    /// Total budget in KiB
    #[must_use]
    pub fn capacity_kb(&self) -> u32 {
        self.capacity_kb
    }

    /// Budget not currently held by any transfer
    #[must_use]
    pub fn available_kb(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Budget currently held by in-flight transfers
    #[must_use]
    pub fn in_flight_kb(&self) -> usize {
        (self.capacity_kb as usize).saturating_sub(self.available_kb())
    }

    /// Reject blobs whose size alone exceeds the ceiling
    ///
    /// Returns the number of permits the blob needs.
    pub fn check(&self, size_bytes: u64, direction: Direction) -> Result<u32> {
        let size_kb = size_bytes.div_ceil(1024);
        if size_kb > u64::from(self.capacity_kb) {
            return Err(Error::SizeLimitExceeded {
                direction,
                size_kb,
                limit_kb: u64::from(self.capacity_kb),
            });
        }
        // Bounded by capacity_kb above, so this always fits.
        Ok(u32::try_from(size_kb).unwrap_or(self.capacity_kb))
    }

    /// Wait until budget for `size_bytes` is free and take it
    ///
    /// Fails fast with [`Error::SizeLimitExceeded`] for oversized blobs. If
    /// `cancel` fires or the governor is closed while waiting, no permits are
    /// taken and [`Error::Cancelled`] is returned.
    pub async fn acquire(
        &self,
        size_bytes: u64,
        cancel: &CancellationToken,
    ) -> Result<MemoryPermit<'_>> {
        let kb = self.check(size_bytes, Direction::Upload)?;
        if kb == 0 {
            return Ok(MemoryPermit {
                _permit: None,
                kb: 0,
            });
        }

        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(Error::cancelled("upload memory acquisition"));
            }
            permit = self.semaphore.acquire_many(kb) => permit
                .map_err(|_| Error::cancelled("upload memory acquisition"))?,
        };

        trace!(kb, available = self.available_kb(), "Acquired upload memory");
        Ok(MemoryPermit {
            _permit: Some(permit),
            kb,
        })
    }

    /// Fail every pending and future acquisition
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_check_rounds_up() {
        let governor = MemoryGovernor::new(4);
        assert_eq!(governor.check(0, Direction::Upload).unwrap(), 0);
        assert_eq!(governor.check(1, Direction::Upload).unwrap(), 1);
        assert_eq!(governor.check(4096, Direction::Upload).unwrap(), 4);
        assert!(matches!(
            governor.check(4097, Direction::Download),
            Err(Error::SizeLimitExceeded {
                direction: Direction::Download,
                size_kb: 5,
                limit_kb: 4
            })
        ));
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let governor = MemoryGovernor::new(8);
        let token = CancellationToken::new();

        let permit = governor.acquire(3 * 1024, &token).await.unwrap();
        assert_eq!(permit.kb(), 3);
        assert_eq!(governor.in_flight_kb(), 3);

        drop(permit);
        assert_eq!(governor.in_flight_kb(), 0);
        assert_eq!(governor.available_kb(), 8);
    }

    #[tokio::test]
    async fn test_oversized_fails_fast() {
        let governor = MemoryGovernor::new(2);
        let token = CancellationToken::new();
        let err = governor.acquire(3 * 1024, &token).await.unwrap_err();
        assert!(matches!(err, Error::SizeLimitExceeded { .. }));
        assert_eq!(governor.available_kb(), 2);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_leaks_nothing() {
        let governor = Arc::new(MemoryGovernor::new(4));
        let token = CancellationToken::new();

        let held = governor.acquire(4 * 1024, &token).await.unwrap();

        let waiter = {
            let governor = Arc::clone(&governor);
            let token = token.clone();
            tokio::spawn(async move { governor.acquire(2 * 1024, &token).await.map(|p| p.kb()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled { .. })));

        drop(held);
        assert_eq!(governor.available_kb(), 4);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let governor = Arc::new(MemoryGovernor::new(1));
        let token = CancellationToken::new();
        let held = governor.acquire(1024, &token).await.unwrap();

        let waiter = {
            let governor = Arc::clone(&governor);
            tokio::spawn(async move {
                let token = CancellationToken::new();
                governor.acquire(1024, &token).await.map(|p| p.kb())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        governor.close();

        assert!(waiter.await.unwrap().unwrap_err().is_cancelled());
        drop(held);
    }

    #[tokio::test]
    async fn test_grants_in_request_order() {
        let governor = Arc::new(MemoryGovernor::new(4));
        let token = CancellationToken::new();
        let held = governor.acquire(4 * 1024, &token).await.unwrap();

        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        // A large request queued first must not be starved by the small one behind it.
        for (label, size) in [("large", 4 * 1024_u64), ("small", 1024)] {
            let governor = Arc::clone(&governor);
            let order = Arc::clone(&order);
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                let permit = governor.acquire(size, &token).await.unwrap();
                order.lock().await.push(label);
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(permit);
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().await, vec!["large", "small"]);
        assert_eq!(governor.available_kb(), 4);
    }
}
