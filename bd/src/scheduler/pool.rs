//! Worker pool - bounded in-flight capacity plus a sliding-window rate limit
//!
//! One pool per provider, plus one CPU pool. Admission acquires a slot
//! first, then paces against the provider's rate window, so a burst of
//! units queues at the pool edge instead of hammering the provider.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Pool limits
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool name for logging ("llm:anthropic", "ocr:engA", "cpu")
    pub name: String,

    /// Max units executing at once
    pub max_in_flight: usize,

    /// Max admissions per rate window; 0 disables rate limiting
    pub max_requests_per_window: u32,

    pub rate_window_secs: u64,
}

impl PoolConfig {
    /// CPU pool: hardware-parallel, no rate limit
    pub fn cpu(size: usize) -> Self {
        Self {
            name: "cpu".to_string(),
            max_in_flight: size,
            max_requests_per_window: 0,
            rate_window_secs: 0,
        }
    }
}

/// A bounded worker pool
pub struct WorkerPool {
    config: PoolConfig,
    slots: Arc<Semaphore>,
    window: Mutex<VecDeque<Instant>>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let slots = Arc::new(Semaphore::new(config.max_in_flight));
        Arc::new(Self {
            config,
            slots,
            window: Mutex::new(VecDeque::new()),
        })
    }

    /// Wait for a slot and for rate-limit headroom
    ///
    /// The returned permit holds the slot until dropped.
    pub async fn admit(&self) -> OwnedSemaphorePermit {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore closed");

        self.pace().await;
        permit
    }

    /// Sliding-window pacing; sleeps until the oldest admission leaves the
    /// window when the window is full
    async fn pace(&self) {
        if self.config.max_requests_per_window == 0 {
            return;
        }

        let window_len = Duration::from_secs(self.config.rate_window_secs);

        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();

                while window.front().is_some_and(|t| now.duration_since(*t) >= window_len) {
                    window.pop_front();
                }

                if (window.len() as u32) < self.config.max_requests_per_window {
                    window.push_back(now);
                    return;
                }

                let oldest = *window.front().expect("window non-empty");
                window_len - now.duration_since(oldest)
            };

            debug!(pool = %self.config.name, ?wait, "Rate window full, pacing");
            tokio::time::sleep(wait).await;
        }
    }

    /// Units currently holding slots
    pub fn in_flight(&self) -> usize {
        self.config.max_in_flight - self.slots.available_permits()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_in_flight_bounded_by_capacity() {
        let pool = WorkerPool::new(PoolConfig {
            name: "test".to_string(),
            max_in_flight: 2,
            max_requests_per_window: 0,
            rate_window_secs: 0,
        });

        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let peak = peak.clone();
            let current = current.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = pool.admit().await;
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_rate_window_delays_admission() {
        let pool = WorkerPool::new(PoolConfig {
            name: "test".to_string(),
            max_in_flight: 10,
            max_requests_per_window: 2,
            rate_window_secs: 1,
        });

        let start = Instant::now();
        for _ in 0..3 {
            let _permit = pool.admit().await;
        }

        // The third admission must wait for the window to roll
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_cpu_pool_has_no_rate_limit() {
        let pool = WorkerPool::new(PoolConfig::cpu(4));

        let start = Instant::now();
        for _ in 0..20 {
            let _permit = pool.admit().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
