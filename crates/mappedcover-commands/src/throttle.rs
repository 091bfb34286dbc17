//! Per-device command spacing.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mappedcover_core::SourceId;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Throttles keyed by device, shareable between dispatchers.
pub type SharedThrottles = Arc<DashMap<SourceId, Arc<Throttle>>>;

/// Spaces slot grants at least `interval` apart.
///
/// Waiters queue on a fair mutex, so slots are granted in arrival order.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last_slot: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_slot: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next slot. Returns false if aborted first.
    pub async fn acquire(&self, abort: &CancellationToken) -> bool {
        self.acquire_after(self.interval, abort).await
    }

    /// Wait until `interval` has passed since the last slot granted to
    /// anyone. Callers sharing a device with a different spacing use this.
    pub async fn acquire_after(&self, interval: Duration, abort: &CancellationToken) -> bool {
        let mut last = tokio::select! {
            biased;
            _ = abort.cancelled() => return false,
            guard = self.last_slot.lock() => guard,
        };

        if let Some(previous) = *last {
            let ready = previous + interval;
            tokio::select! {
                biased;
                _ = abort.cancelled() => return false,
                _ = tokio::time::sleep_until(ready) => {}
            }
        }

        *last = Some(Instant::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_slot_is_immediate() {
        let throttle = Throttle::new(Duration::from_millis(100));
        let start = Instant::now();
        assert!(throttle.acquire(&CancellationToken::new()).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_are_spaced() {
        let throttle = Throttle::new(Duration::from_millis(100));
        let token = CancellationToken::new();
        let mut grants = Vec::new();
        for _ in 0..4 {
            assert!(throttle.acquire(&token).await);
            grants.push(Instant::now());
        }
        for pair in grants.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_granted_in_arrival_order() {
        let throttle = Arc::new(Throttle::new(Duration::from_millis(50)));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let throttle = throttle.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                throttle.acquire(&CancellationToken::new()).await;
                order.lock().push(i);
            }));
            // Let the task queue before spawning the next one
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_while_waiting() {
        let throttle = Arc::new(Throttle::new(Duration::from_secs(10)));
        let token = CancellationToken::new();
        assert!(throttle.acquire(&token).await);

        let waiter = {
            let throttle = throttle.clone();
            let token = token.clone();
            tokio::spawn(async move { throttle.acquire(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert!(!waiter.await.unwrap());
    }
}
