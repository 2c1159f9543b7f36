use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// The worker token pool, bounding the handlers running at the same time across every
/// connection of a server.
///
/// A token is returned by dropping the [OwnedSemaphorePermit].
#[derive(Clone)]
pub struct Throttler {
    sem: Arc<Semaphore>,
    thresholds: usize,
}

impl Throttler {
    pub fn new(thresholds: usize) -> Self {
        assert!(thresholds > 0);
        Throttler { sem: Arc::new(Semaphore::new(thresholds)), thresholds }
    }

    /// Take a token, waiting for one when all of them are held.
    ///
    /// Returns None when the pool is closed.
    #[inline(always)]
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        // Fast path without registering a waiter
        if let Ok(permit) = self.sem.clone().try_acquire_owned() {
            return Some(permit);
        }
        self.sem.clone().acquire_owned().await.ok()
    }

    #[inline(always)]
    pub fn nearly_full(&self) -> bool {
        self.sem.available_permits() == 0
    }

    /// Tokens currently held
    #[inline(always)]
    pub fn busy(&self) -> usize {
        self.thresholds - self.sem.available_permits()
    }

    /// Wake up every waiter with None
    pub fn close(&self) {
        self.sem.close();
    }
}
