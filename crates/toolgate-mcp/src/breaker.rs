//! Per-server circuit breaker.
//!
//! # States
//! - Closed: calls pass through, consecutive failures are counted
//! - Open: calls fail fast with [`ToolgateError::CircuitOpen`]
//! - Half-Open: one probe call is let through
//!
//! # Transitions
//! ```text
//! Closed    → Open:      failure_threshold consecutive failures
//! Open      → Half-Open: reset_timeout elapsed since opening (checked lazily)
//! Half-Open → Closed:    probe succeeds
//! Half-Open → Open:      probe fails
//! ```
//!
//! While a probe is in flight, other callers are rejected as if the circuit
//! were still open.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use toolgate_core::{ToolgateError, ToolgateResult};
use tracing::{info, warn};

const EVENT_CAPACITY: usize = 64;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Cooldown before an open circuit admits a probe.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// A state change, published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub server: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Point-in-time view for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_opened_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    last_opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

/// Whether an open circuit has cooled down at `now`.
pub fn cooldown_elapsed(opened_at: Instant, now: Instant, reset_timeout: Duration) -> bool {
    now.saturating_duration_since(opened_at) >= reset_timeout
}

/// Failure-tracking state machine guarding one server.
pub struct CircuitBreaker {
    server: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    events: broadcast::Sender<Transition>,
}

impl CircuitBreaker {
    pub fn new(server: impl Into<String>, config: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            server: server.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                last_opened_at: None,
                probe_in_flight: false,
            }),
            events,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state, applying the lazy Open → Half-Open check.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.failures,
            last_opened_at: inner.last_opened_at,
        }
    }

    /// Receive every state transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.events.subscribe()
    }

    /// Run `operation` if the circuit admits it, and record the outcome.
    ///
    /// Rejected calls never invoke `operation`. A [`ToolgateError::CircuitOpen`]
    /// coming out of `operation` is passed through without being recorded.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> ToolgateResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ToolgateResult<T>>,
    {
        let mut permit = self.acquire()?;
        let result = operation().await;
        match &result {
            Ok(_) => permit.succeed(),
            Err(e) if e.counts_as_failure() => permit.fail(),
            Err(_) => {}
        }
        result
    }

    /// Record a success computed outside [`execute`](Self::execute).
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.on_success(&mut inner, true);
    }

    /// Record a failure computed outside [`execute`](Self::execute).
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.on_failure(&mut inner, true);
    }

    /// Force Closed from any state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        self.transition(&mut inner, CircuitState::Closed);
    }

    fn acquire(&self) -> ToolgateResult<Permit<'_>> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                Ok(Permit::new(self, true))
            }
            CircuitState::Open | CircuitState::HalfOpen => Err(ToolgateError::CircuitOpen {
                server: self.server.clone(),
            }),
        }
    }

    fn refresh(&self, inner: &mut Inner, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        let Some(opened_at) = inner.opened_at else {
            return;
        };
        if cooldown_elapsed(opened_at, now, self.config.reset_timeout) {
            inner.probe_in_flight = false;
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn on_success(&self, inner: &mut Inner, probe: bool) {
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen if probe => {
                inner.failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                self.transition(inner, CircuitState::Closed);
            }
            // Stale outcomes of calls admitted before the circuit opened.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut Inner, probe: bool) {
        inner.failures = inner.failures.saturating_add(1);
        match inner.state {
            CircuitState::Closed if inner.failures >= self.config.failure_threshold => {
                self.open(inner);
            }
            CircuitState::HalfOpen if probe => {
                inner.probe_in_flight = false;
                self.open(inner);
            }
            _ => {}
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.opened_at = Some(Instant::now());
        inner.last_opened_at = Some(Utc::now());
        self.transition(inner, CircuitState::Open);
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            CircuitState::Open => warn!(
                server = %self.server,
                failures = inner.failures,
                from = %from,
                "Circuit opened"
            ),
            _ => info!(server = %self.server, from = %from, to = %to, "Circuit state changed"),
        }
        // No subscribers is fine.
        let _ = self.events.send(Transition {
            server: self.server.clone(),
            from,
            to,
        });
    }
}

/// Admission ticket handed out by [`CircuitBreaker::acquire`]. A probe
/// permit that is dropped without an outcome (cancelled future) frees the
/// probe slot without changing state.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    fn succeed(&mut self) {
        self.settled = true;
        let mut inner = self.breaker.inner.lock();
        self.breaker.on_success(&mut inner, self.probe);
    }

    fn fail(&mut self) {
        self.settled = true;
        let mut inner = self.breaker.inner.lock();
        self.breaker.on_failure(&mut inner, self.probe);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.inner.lock().probe_in_flight = false;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_millis(reset_ms),
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> ToolgateResult<()> {
        b.execute(|| async { Err::<(), _>(ToolgateError::transport("test", "boom")) })
            .await
    }

    async fn succeed(b: &CircuitBreaker) -> ToolgateResult<u32> {
        b.execute(|| async { Ok(7) }).await
    }

    #[test]
    fn test_defaults() {
        let config = BreakerConfig::default();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.reset_timeout, Duration::from_secs(30));
        let b = CircuitBreaker::new("s", config);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[test]
    fn test_state_display_and_serialize() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
        assert_eq!(
            serde_json::to_string(&CircuitState::HalfOpen).unwrap(),
            "\"HALF_OPEN\""
        );
    }

    #[test]
    fn test_cooldown_elapsed_is_pure() {
        let opened = Instant::now();
        let reset = Duration::from_secs(30);
        assert!(!cooldown_elapsed(opened, opened + Duration::from_secs(29), reset));
        assert!(cooldown_elapsed(opened, opened + Duration::from_secs(30), reset));
        // A clock reading before opened_at never counts as elapsed.
        assert!(!cooldown_elapsed(opened + Duration::from_secs(5), opened, reset));
    }

    #[tokio::test]
    async fn test_opens_after_exact_threshold() {
        let b = breaker(3, 60_000);
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.consecutive_failures(), 2);
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let b = breaker(3, 60_000);
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(succeed(&b).await.unwrap(), 7);
        assert_eq!(b.consecutive_failures(), 0);
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_rejects_without_invoking() {
        let b = breaker(1, 60_000);
        fail(&b).await.unwrap_err();
        let calls = AtomicUsize::new(0);
        for _ in 0..5 {
            let err = b
                .execute(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap_err();
            assert!(err.is_circuit_open());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // Rejections are not counted as failures.
        assert_eq!(b.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_half_open_after_reset_timeout() {
        let b = breaker(1, 30);
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let b = breaker(2, 30);
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(succeed(&b).await.unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_immediately() {
        let b = breaker(3, 30);
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);
        // Cooldown restarted: still open right away.
        assert!(succeed(&b).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn test_only_one_concurrent_probe() {
        let b = Arc::new(breaker(1, 20));
        fail(&b).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let b = b.clone();
            tokio::spawn(async move {
                b.execute(|| async move {
                    rx.await.ok();
                    Ok(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(succeed(&b).await.unwrap_err().is_circuit_open());
        tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_probe_frees_slot() {
        let b = Arc::new(breaker(1, 20));
        fail(&b).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let probe = {
            let b = b.clone();
            tokio::spawn(async move {
                b.execute(std::future::pending::<ToolgateResult<()>>).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        probe.abort();
        assert!(probe.await.unwrap_err().is_cancelled());

        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&b).await.unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_open_from_operation_not_recorded() {
        let b = breaker(1, 60_000);
        let err = b
            .execute(|| async {
                Err::<(), _>(ToolgateError::CircuitOpen {
                    server: "nested".into(),
                })
            })
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[test]
    fn test_direct_recording() {
        let b = breaker(2, 60_000);
        b.record_failure();
        b.record_success();
        assert_eq!(b.consecutive_failures(), 0);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        let snap = b.snapshot();
        assert_eq!(snap.state, CircuitState::Open);
        assert!(snap.last_opened_at.is_some());
    }

    #[test]
    fn test_reset_from_open() {
        let b = breaker(1, 60_000);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[test]
    fn test_transitions_are_published() {
        let b = breaker(1, 60_000);
        let mut rx = b.subscribe();
        b.record_failure();
        b.reset();
        assert_eq!(
            rx.try_recv().unwrap(),
            Transition {
                server: "test".into(),
                from: CircuitState::Closed,
                to: CircuitState::Open,
            }
        );
        assert_eq!(rx.try_recv().unwrap().to, CircuitState::Closed);
        assert!(rx.try_recv().is_err());
    }
}
