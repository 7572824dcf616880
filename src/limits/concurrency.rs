//! Bounded-parallelism gate for session establishment
//!
//! A thin wrapper over a counting semaphore: `run` executes a future only
//! once one of `max` slots is free, waiting cooperatively (FIFO arrival
//! order) otherwise. The permit is held in an RAII guard, so the slot is
//! released on every exit path — success, error, or panic inside the task.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::trace;

/// Counting semaphore with FIFO fairness over queued waiters
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max: usize,
    running: Arc<AtomicUsize>,
}

/// Decrements the running count even if the task panics
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    /// Create a limiter with `max` simultaneous slots
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run `task` once a slot is available, returning its output.
    ///
    /// Queued callers are admitted in arrival order. The slot is freed when
    /// the task completes, however it completes.
    pub async fn run<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        // The semaphore is owned by this limiter and never closed, so
        // acquisition can only ever succeed.
        let Ok(_permit) = self.semaphore.acquire().await else {
            unreachable!("concurrency semaphore is never closed");
        };

        self.running.fetch_add(1, Ordering::SeqCst);
        let _guard = RunningGuard(Arc::clone(&self.running));
        trace!(running = self.running(), max = self.max, "Slot acquired");

        task.await
    }

    /// Number of tasks currently holding a slot
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of free slots
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Configured ceiling
    pub fn max(&self) -> usize {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// `running` never exceeds `max`, for any number of concurrent tasks
    #[tokio::test]
    async fn test_running_never_exceeds_max() {
        let limiter = Arc::new(ConcurrencyLimiter::new(3));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = Arc::clone(&limiter);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                limiter
                    .run(async {
                        let now = limiter.running();
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(limiter.running(), 0);
        assert_eq!(limiter.available(), 3);
    }

    /// Waiters queued under contention are admitted in arrival order
    #[tokio::test]
    async fn test_fifo_admission_order() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the single slot so every subsequent caller queues
        let gate = Arc::new(tokio::sync::Notify::new());
        let holder = {
            let limiter = Arc::clone(&limiter);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                limiter.run(async { gate.notified().await }).await;
            })
        };
        tokio::task::yield_now().await;

        let mut handles = Vec::new();
        for i in 0..5u32 {
            let limiter = Arc::clone(&limiter);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                limiter
                    .run(async {
                        order.lock().unwrap().push(i);
                    })
                    .await;
            }));
            // Ensure each waiter reaches the queue before the next arrives
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        gate.notify_one();
        holder.await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    /// A task that panics still releases its slot
    #[tokio::test]
    async fn test_panic_releases_slot() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1));

        let crashing = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter.run(async { panic!("task blew up") }).await;
            })
        };
        assert!(crashing.await.is_err());

        // Slot must be free again; running count must be back to zero
        assert_eq!(limiter.running(), 0);
        let ran = limiter.run(async { 42 }).await;
        assert_eq!(ran, 42);
    }

    /// Errors returned by the task propagate and the slot is still freed
    #[tokio::test]
    async fn test_error_propagates_and_releases() {
        let limiter = ConcurrencyLimiter::new(2);

        let result: Result<(), &str> = limiter.run(async { Err("connect refused") }).await;
        assert!(result.is_err());
        assert_eq!(limiter.available(), 2);
    }
}
