use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Duration, Instant};

/// Concurrent in-flight transfers allowed by the admission controller.
pub const TRANSFER_LIMIT: usize = 4;

/// FIFO admission control for transfer tasks. The queue knows nothing about
/// the payload; callers hold the returned permit for the duration of the
/// transfer and release the slot by dropping it.
#[derive(Clone, Debug)]
pub struct TransferQueue {
    semaphore: Arc<Semaphore>,
}

/// An admitted transfer slot. Dropping it hands the slot to the next waiter.
#[derive(Debug)]
pub struct TransferPermit {
    _permit: OwnedSemaphorePermit,
}

impl TransferQueue {
    #[must_use]
    pub fn new() -> Self {
        Self { semaphore: Arc::new(Semaphore::new(TRANSFER_LIMIT)) }
    }

    /// Suspends until a slot is free. Waiters are admitted in arrival order.
    pub async fn enqueue(&self) -> TransferPermit {
        // The semaphore is only closed on process exit.
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("transfer queue semaphore closed"));
        TransferPermit { _permit: permit }
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Token bucket over plaintext bytes with a one-second window. A transfer
/// that would exceed the current window's budget sleeps into the next one.
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_second: u64,
    state: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    used: u64,
}

impl RateLimiter {
    /// `max_mbps` is megabytes per second; callers must not construct a
    /// limiter for an unlimited (zero) setting.
    #[must_use]
    pub fn new(max_mbps: u64) -> Self {
        Self {
            bytes_per_second: max_mbps * 1024 * 1024,
            state: Mutex::new(Window { started: Instant::now(), used: 0 }),
        }
    }

    /// Accounts `bytes` against the current window, sleeping for the rest of
    /// the second whenever the budget is exhausted.
    pub async fn consume(&self, mut bytes: u64) {
        while bytes > 0 {
            let mut window = self.state.lock().await;
            let elapsed = window.started.elapsed();
            if elapsed >= Duration::from_secs(1) {
                window.started = Instant::now();
                window.used = 0;
            }

            let budget = self.bytes_per_second.saturating_sub(window.used);
            if budget == 0 {
                let wait = Duration::from_secs(1).saturating_sub(elapsed);
                drop(window);
                tokio::time::sleep(wait).await;
                continue;
            }

            let spend = bytes.min(budget);
            window.used += spend;
            bytes -= spend;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_admits_up_to_the_limit() {
        let queue = TransferQueue::new();
        let mut permits = Vec::new();
        for _ in 0..TRANSFER_LIMIT {
            permits.push(queue.enqueue().await);
        }
        assert_eq!(queue.available(), 0);

        permits.pop();
        assert_eq!(queue.available(), 1);
        drop(permits);
        assert_eq!(queue.available(), TRANSFER_LIMIT);
    }

    #[tokio::test]
    async fn waiter_is_admitted_when_a_slot_frees() {
        let queue = TransferQueue::new();
        let held: Vec<_> = futures::future::join_all((0..TRANSFER_LIMIT).map(|_| queue.enqueue())).await;

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(held);
        let _permit = waiter.await.expect("waiter admitted");
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_sleeps_once_the_window_budget_is_spent() {
        let limiter = RateLimiter::new(1); // 1 MiB/s
        let start = Instant::now();

        limiter.consume(1024 * 1024).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Next byte belongs to the following window.
        limiter.consume(1).await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}
