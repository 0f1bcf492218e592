/// Worker Pool - fixed number of execution slots
///
/// `acquire` blocks while every slot is busy; that wait is what slows queue
/// consumption down. Each slot has a stable id so it can own a work
/// directory.
use std::sync::{Arc, Mutex};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

use crate::metrics::BUSY_SLOTS;

#[derive(Clone)]
pub struct WorkerPool {
    size: usize,
    semaphore: Arc<Semaphore>,
    free: Arc<Mutex<Vec<usize>>>,
}

/// A held slot. Dropping it returns the slot to the pool.
pub struct Slot {
    id: usize,
    free: Arc<Mutex<Vec<usize>>>,
    _permit: OwnedSemaphorePermit,
}

impl Slot {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(self.id);
        BUSY_SLOTS.dec();
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            free: Arc::new(Mutex::new((0..size).rev().collect())),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn acquire(&self) -> Result<Slot, AcquireError> {
        let permit = self.semaphore.clone().acquire_owned().await?;
        // A permit guarantees a free id: ids and permits move together
        let id = self
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop()
            .unwrap_or_default();
        BUSY_SLOTS.inc();
        Ok(Slot {
            id,
            free: self.free.clone(),
            _permit: permit,
        })
    }

    /// Wait until every slot is free.
    pub async fn wait_idle(&self) -> Result<(), AcquireError> {
        let _all = self.semaphore.acquire_many(self.size as u32).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_slots_are_distinct_and_returned() {
        let pool = WorkerPool::new(2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.available(), 0);

        let id = a.id();
        drop(a);
        assert_eq!(pool.available(), 1);
        let c = pool.acquire().await.unwrap();
        assert_eq!(c.id(), id);
    }

    #[tokio::test]
    async fn test_acquire_blocks_when_full() {
        let pool = WorkerPool::new(1);
        let held = pool.acquire().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(blocked.is_err());

        drop(held);
        let slot = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(slot.is_ok());
    }

    #[tokio::test]
    async fn test_wait_idle_waits_for_running_slots() {
        let pool = WorkerPool::new(2);
        let slot = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(slot);
        waiter.await.unwrap().unwrap();
    }
}
