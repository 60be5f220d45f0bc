//! Bounded free-list of sandbox box ids.
//!
//! Every in-flight run holds a distinct box id; acquisition blocks when
//! the pool is exhausted and the id returns to the free list when the
//! lease is dropped.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Clone)]
pub struct BoxPool {
    semaphore: Arc<Semaphore>,
    free: Arc<Mutex<Vec<u32>>>,
}

impl BoxPool {
    pub fn new(size: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size as usize)),
            free: Arc::new(Mutex::new((0..size).rev().collect())),
        }
    }

    /// Claim a box id, waiting for one to free up if necessary.
    pub async fn acquire(&self) -> Result<BoxLease> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .context("box pool closed")?;

        let id = {
            let mut free = self
                .free
                .lock()
                .map_err(|_| anyhow::anyhow!("box free-list poisoned"))?;
            // the permit guarantees an id is available
            free.pop().context("box free-list empty with permit held")?
        };

        Ok(BoxLease {
            id,
            free: Arc::clone(&self.free),
            _permit: permit,
        })
    }
}

/// Exclusive claim on one box id for the duration of a run.
pub struct BoxLease {
    id: u32,
    free: Arc<Mutex<Vec<u32>>>,
    _permit: OwnedSemaphorePermit,
}

impl BoxLease {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for BoxLease {
    fn drop(&mut self) {
        if let Ok(mut free) = self.free.lock() {
            free.push(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_ids_are_distinct_while_held() {
        let pool = BoxPool::new(3);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(b.id(), c.id());
        assert_ne!(a.id(), c.id());
    }

    #[tokio::test]
    async fn test_blocks_on_exhaustion_until_release() {
        let pool = BoxPool::new(1);
        let lease = pool.acquire().await.unwrap();

        let blocked = timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(blocked.is_err(), "acquire should block while exhausted");

        drop(lease);
        let reacquired = timeout(Duration::from_millis(50), pool.acquire())
            .await
            .expect("acquire should succeed after release")
            .unwrap();
        assert_eq!(reacquired.id(), 0);
    }
}
