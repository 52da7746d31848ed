use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// Diagnostic label for a failure, counted per kind while the breaker runs.
pub trait FailureKind {
    fn kind(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit '{name}' is open, retry in {}ms", retry_in.as_millis())]
    Open { name: String, retry_in: Duration },

    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub failure_kinds: BTreeMap<String, u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    total_failures: u64,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    failure_kinds: HashMap<&'static str, u64>,
}

/// Consecutive-failure circuit breaker shared by every worker calling one backend.
///
/// State, counters and the open timestamp live behind a single mutex and are always updated
/// together. The lock is never held across an await. In half-open exactly one probe is let
/// through; concurrent callers are rejected until the probe resolves.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<Inner>>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: Arc::from(name),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                cooldown: config.cooldown,
            },
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                total_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                failure_kinds: HashMap::new(),
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// False only while open with the cooldown still running.
    pub fn is_accepting(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Open => self.remaining_cooldown(&inner).is_zero(),
            _ => true,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.to_string(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            failure_kinds: inner
                .failure_kinds
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }

    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: FailureKind,
    {
        let mut ticket = self.admit().map_err(|retry_in| BreakerError::Open {
            name: self.name.to_string(),
            retry_in,
        })?;

        let outcome = f().await;
        ticket.settled = true;
        match outcome {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure(err.kind());
                Err(BreakerError::Inner(err))
            }
        }
    }

    fn remaining_cooldown(&self, inner: &Inner) -> Duration {
        inner
            .opened_at
            .map(|at| self.config.cooldown.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    fn admit(&self) -> Result<Ticket<'_>, Duration> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let remaining = self.remaining_cooldown(&inner);
                if !remaining.is_zero() {
                    return Err(remaining);
                }
                info!(breaker = %self.name, "cooldown elapsed, half-open probe");
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(Duration::ZERO);
                }
                inner.probe_in_flight = true;
            }
        }
        Ok(Ticket {
            breaker: self,
            settled: false,
        })
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state == CircuitState::HalfOpen {
            info!(breaker = %self.name, "probe succeeded, circuit closed");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
        }
    }

    fn on_failure(&self, kind: &'static str) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.total_failures += 1;
        *inner.failure_kinds.entry(kind).or_insert(0) += 1;
        inner.probe_in_flight = false;

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                breaker = %self.name,
                consecutive_failures = inner.consecutive_failures,
                kind,
                cooldown_secs = self.config.cooldown.as_secs_f64(),
                "circuit opened"
            );
        }
    }
}

/// Tracks one admitted call. A call abandoned before it resolves (its future was dropped by an
/// outer timeout) counts as a timeout failure; an abandoned probe therefore reopens the circuit.
struct Ticket<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_failure("timeout");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl FailureKind for Boom {
        fn kind(&self) -> &'static str {
            "boom"
        }
    }

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_millis(cooldown_ms),
            },
        )
    }

    async fn fail(b: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), BreakerError<Boom>> {
        b.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Boom)
        })
        .await
    }

    async fn succeed(b: &CircuitBreaker, calls: &AtomicUsize) -> Result<u8, BreakerError<Boom>> {
        b.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Boom>(7)
        })
        .await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_recovers_after_cooldown() {
        let b = breaker(3, 50);
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            assert!(matches!(fail(&b, &calls).await, Err(BreakerError::Inner(_))));
            assert_eq!(b.state(), CircuitState::Closed);
        }
        assert!(fail(&b, &calls).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Rejected without invoking the function.
        assert!(matches!(succeed(&b, &calls).await, Err(BreakerError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!b.is_accepting());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(b.is_accepting());
        assert_eq!(succeed(&b, &calls).await.unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn success_resets_consecutive_count() {
        let b = breaker(3, 1_000);
        let calls = AtomicUsize::new(0);

        fail(&b, &calls).await.ok();
        fail(&b, &calls).await.ok();
        succeed(&b, &calls).await.unwrap();
        fail(&b, &calls).await.ok();
        fail(&b, &calls).await.ok();
        assert_eq!(b.state(), CircuitState::Closed);

        let snap = b.snapshot();
        assert_eq!(snap.consecutive_failures, 2);
        assert_eq!(snap.total_failures, 4);
        assert_eq!(snap.failure_kinds.get("boom"), Some(&4));
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let b = breaker(1, 20);
        let calls = AtomicUsize::new(0);

        fail(&b, &calls).await.ok();
        assert_eq!(b.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(30)).await;

        fail(&b, &calls).await.ok();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(succeed(&b, &calls).await, Err(BreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn half_open_admits_a_single_probe() {
        let b = breaker(1, 10);
        let calls = AtomicUsize::new(0);
        fail(&b, &calls).await.ok();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let probe_breaker = b.clone();
        let probe = tokio::spawn(async move {
            probe_breaker
                .call(|| async {
                    rx.await.ok();
                    Ok::<_, Boom>(1u8)
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(matches!(succeed(&b, &calls).await, Err(BreakerError::Open { .. })));

        tx.send(()).unwrap();
        assert_eq!(probe.await.unwrap().unwrap(), 1);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn abandoned_probe_reopens() {
        let b = breaker(1, 10);
        let calls = AtomicUsize::new(0);
        fail(&b, &calls).await.ok();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let hung = b.call(|| std::future::pending::<Result<(), Boom>>());
        assert!(tokio::time::timeout(Duration::from_millis(10), hung).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.snapshot().failure_kinds.get("timeout"), Some(&1));
    }

    #[tokio::test]
    async fn abandoned_calls_count_toward_threshold() {
        let b = breaker(3, 1_000);
        for i in 0..3 {
            assert_eq!(b.state(), CircuitState::Closed);
            let hung = b.call(|| std::future::pending::<Result<(), Boom>>());
            assert!(tokio::time::timeout(Duration::from_millis(5), hung).await.is_err());
            assert_eq!(b.snapshot().consecutive_failures, i + 1);
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.snapshot().failure_kinds.get("timeout"), Some(&3));
    }
}
