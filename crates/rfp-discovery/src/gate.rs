use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("gate closed")]
    Closed,
}

/// Bounds concurrent outbound calls and spaces their start times.
///
/// A caller holds a [`GatePermit`] for the whole duration of its call. The last start time is
/// read and written under one lock, so two workers can never both start inside the same
/// interval.
#[derive(Clone)]
pub struct RateLimitedGate {
    slots: Arc<Semaphore>,
    last_start: Arc<Mutex<Option<Instant>>>,
    max_concurrent: usize,
    min_interval: Duration,
}

/// Returns its slot when dropped.
#[derive(Debug)]
pub struct GatePermit {
    _slot: OwnedSemaphorePermit,
}

impl GatePermit {
    pub fn release(self) {}
}

impl RateLimitedGate {
    pub fn new(max_concurrent: usize, min_interval: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent)),
            last_start: Arc::new(Mutex::new(None)),
            max_concurrent,
            min_interval,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits for a free slot, then for the pacing interval since the previous start.
    pub async fn acquire(&self) -> Result<GatePermit, GateError> {
        let slot = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GateError::Closed)?;

        let mut last = self.last_start.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
        drop(last);

        Ok(GatePermit { _slot: slot })
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.slots.available_permits()
    }

    /// Wakes every waiter with [`GateError::Closed`]. Permits already handed out stay valid.
    pub fn close(&self) {
        self.slots.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_are_spaced_by_min_interval() {
        let gate = RateLimitedGate::new(10, Duration::from_millis(20));
        let started = Instant::now();
        for _ in 0..4 {
            gate.acquire().await.unwrap().release();
        }
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn blocks_when_all_slots_are_held() {
        let gate = RateLimitedGate::new(2, Duration::ZERO);
        let a = gate.acquire().await.unwrap();
        let _b = gate.acquire().await.unwrap();
        assert_eq!(gate.in_flight(), 2);

        let waiting = tokio::time::timeout(Duration::from_millis(30), gate.acquire()).await;
        assert!(waiting.is_err());

        drop(a);
        let c = tokio::time::timeout(Duration::from_millis(100), gate.acquire()).await;
        assert!(c.is_ok());
    }

    #[tokio::test]
    async fn zero_concurrency_is_treated_as_one() {
        let gate = RateLimitedGate::new(0, Duration::ZERO);
        assert_eq!(gate.max_concurrent(), 1);
        let permit = gate.acquire().await.unwrap();
        assert_eq!(gate.in_flight(), 1);
        permit.release();
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn closed_gate_rejects_waiters() {
        let gate = RateLimitedGate::new(1, Duration::ZERO);
        gate.close();
        assert!(matches!(gate.acquire().await, Err(GateError::Closed)));
    }
}
