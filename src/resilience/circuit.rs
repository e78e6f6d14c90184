//! Per-model circuit breakers.
//!
//! Breaker state is process-local and shared by every request this
//! orchestrator instance sends to a model. The lock is held only for state
//! transitions, never across an await.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{HyphaeError, Result, telemetry};

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures before the circuit opens.
    pub threshold: u32,
    /// How long the circuit stays open before allowing a trial call.
    pub timeout_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            timeout_ms: 60_000,
        }
    }
}

impl CircuitConfig {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failures: u32,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    /// Set while the single half-open trial call is in flight.
    trial_started: Option<Instant>,
}

/// Closed / open / half-open breaker for one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                trial_started: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` through the breaker.
    ///
    /// Rejected calls return [`HyphaeError::CircuitOpen`] without invoking
    /// `operation`. Only transient errors count as failures; any other
    /// outcome shows the dependency is reachable.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_acquire()?;
        let result = operation().await;
        match &result {
            Err(e) if e.is_transient() => self.record_failure(),
            _ => self.record_success(),
        }
        result
    }

    /// Admit or reject a call, moving open → half-open once the timeout
    /// has elapsed.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.lock();
        let now = Instant::now();
        let timeout = self.config.timeout();

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map_or(timeout, |at| now.duration_since(at));
                if elapsed >= timeout {
                    info!(circuit = %self.name, "circuit half-open, allowing trial call");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started = Some(now);
                    Ok(())
                } else {
                    Err(self.rejection(timeout - elapsed))
                }
            }
            CircuitState::HalfOpen => match inner.trial_started {
                // A trial abandoned for a whole timeout (caller dropped it)
                // frees the slot.
                Some(started) if now.duration_since(started) < timeout => {
                    Err(self.rejection(timeout - now.duration_since(started)))
                }
                _ => {
                    inner.trial_started = Some(now);
                    Ok(())
                }
            },
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(circuit = %self.name, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.trial_started = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::HalfOpen => {
                warn!(circuit = %self.name, "trial call failed, circuit re-opened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trial_started = None;
            }
            CircuitState::Closed | CircuitState::Open => {
                inner.failures = inner.failures.saturating_add(1);
                if inner.state == CircuitState::Closed && inner.failures >= self.config.threshold {
                    warn!(circuit = %self.name, failures = inner.failures, "circuit opened");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                }
            }
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            failures: inner.failures,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.snapshot().state
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.trial_started = None;
    }

    fn rejection(&self, retry_after: Duration) -> HyphaeError {
        metrics::counter!(telemetry::CIRCUIT_REJECTIONS_TOTAL, "model" => self.name.clone())
            .increment(1);
        HyphaeError::CircuitOpen {
            model: self.name.clone(),
            retry_after,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One breaker per model, created on first use.
pub struct CircuitRegistry {
    config: CircuitConfig,
    breakers: moka::sync::Cache<String, Arc<CircuitBreaker>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: moka::sync::Cache::new(10_000),
        }
    }

    pub fn breaker(&self, model: &str) -> Arc<CircuitBreaker> {
        self.breakers.get_with_by_ref(model, || {
            Arc::new(CircuitBreaker::new(model, self.config.clone()))
        })
    }

    /// Snapshot of every breaker created so far.
    pub fn snapshots(&self) -> Vec<(String, CircuitSnapshot)> {
        let mut out: Vec<_> = self
            .breakers
            .iter()
            .map(|(model, breaker)| (model.as_ref().clone(), breaker.snapshot()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "openai/gpt-4o",
            CircuitConfig {
                threshold: 3,
                timeout_ms: 1_000,
            },
        )
    }

    fn unavailable() -> HyphaeError {
        HyphaeError::Api {
            status: 503,
            message: "unavailable".into(),
        }
    }

    async fn fail(cb: &CircuitBreaker, calls: &AtomicU32) -> Result<()> {
        cb.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(unavailable())
        })
        .await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_rejects_without_calling() {
        let cb = breaker();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&cb, &calls).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let err = fail(&cb, &calls).await.unwrap_err();
        assert!(matches!(err, HyphaeError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.snapshot(), CircuitSnapshot { state: CircuitState::Closed, failures: 1 });
    }

    #[tokio::test]
    async fn fatal_errors_do_not_trip() {
        let cb = breaker();
        for _ in 0..5 {
            let _: Result<()> = cb.execute(|| async { Err(HyphaeError::AuthenticationFailed) }).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_allows_exactly_one_trial() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(cb.try_acquire().is_err());

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Trial in flight: everyone else is rejected.
        assert!(cb.try_acquire().is_err());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens() {
        let cb = breaker();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&cb, &calls).await;
        }

        tokio::time::advance(Duration::from_millis(1_001)).await;
        let _ = fail(&cb, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn successful_trial_closes() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_millis(1_001)).await;
        let value = cb.execute(|| async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn registry_reuses_breakers() {
        let registry = CircuitRegistry::new(CircuitConfig::default());
        let a = registry.breaker("m");
        a.record_failure();
        let b = registry.breaker("m");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.snapshots()[0].1.failures, 1);
    }
}
