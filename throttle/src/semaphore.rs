use std::sync::atomic::{AtomicBool, Ordering};

/// Token bucket on top of a tokio semaphore.
///
/// A bucket that was never set up (or was set up with 0) is disabled and every acquire returns
/// immediately.
pub struct TokenBucket {
    enabled: AtomicBool,
    sem: tokio::sync::Semaphore,
}

impl TokenBucket {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            sem: tokio::sync::Semaphore::const_new(0),
        }
    }

    pub fn setup(&self, capacity: usize) {
        self.enabled.store(capacity > 0, Ordering::Release);
        if capacity == 0 {
            return;
        }
        self.sem.forget_permits(self.sem.available_permits());
        self.sem.add_permits(capacity);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Holds one token until the returned permit is dropped.
    ///
    /// The semaphore is never closed, so a failed acquire can only mean the bucket is unusable;
    /// it is treated the same as a disabled bucket.
    pub async fn acquire(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        if !self.is_enabled() {
            return None;
        }
        self.sem.acquire().await.ok()
    }

    /// Takes `count` tokens for good; they come back only through replenishment.
    pub async fn consume(&self, count: u32) {
        if !self.is_enabled() {
            return;
        }
        if let Ok(permit) = self.sem.acquire_many(count).await {
            permit.forget();
        }
    }

    pub async fn replenish_forever(&self, tokens: usize, interval: std::time::Duration) {
        if !self.is_enabled() {
            return;
        }
        loop {
            tokio::time::sleep(interval).await;
            let available = self.sem.available_permits();
            if available < tokens {
                self.sem.add_permits(tokens - available);
            }
        }
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new()
    }
}
