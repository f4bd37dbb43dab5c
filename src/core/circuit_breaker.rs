//! Per-service circuit breaker.
//!
//! Three-state machine (closed / open / half-open) guarding every proxy
//! dispatch. A monotonic generation counter invalidates the accounting of
//! calls that were in flight across a state transition or interval rollover:
//! their outcome is discarded instead of corrupting the new generation's
//! counts.

use std::{
    collections::HashMap,
    panic::{resume_unwind, AssertUnwindSafe},
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::core::error::{GatewayError, GatewayResult};

/// Decides whether the breaker should trip to open after a failure.
pub type ReadyToTrip = Arc<dyn Fn(Counts) -> bool + Send + Sync>;

/// Classifies a call outcome; `None` means the call returned Ok.
pub type IsSuccessful = Arc<dyn Fn(Option<&GatewayError>) -> bool + Send + Sync>;

/// Hook fired on every state transition, outside the breaker lock.
pub type OnStateChange = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests pass and counts accumulate.
    Closed,
    /// Requests are rejected without running the target.
    Open,
    /// Limited probe requests are allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Request statistics for the current generation.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.total_failures as f64 / self.requests as f64
    }

    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.total_successes as f64 / self.requests as f64
    }
}

/// Circuit breaker configuration.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Probe requests allowed concurrently in half-open.
    pub max_requests: u32,
    /// Statistical window in closed; counts reset when it elapses.
    pub interval: Duration,
    /// How long open stays open before the next request probes half-open.
    pub timeout: Duration,
    pub ready_to_trip: ReadyToTrip,
    pub is_successful: IsSuccessful,
    pub on_state_change: Option<OnStateChange>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: 5,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            ready_to_trip: Arc::new(default_ready_to_trip),
            is_successful: Arc::new(default_is_successful),
            on_state_change: None,
        }
    }
}

impl std::fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("max_requests", &self.max_requests)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Default trip condition: more than 5 consecutive failures, or more than 10
/// requests with an error rate above 50%.
fn default_ready_to_trip(counts: Counts) -> bool {
    counts.consecutive_failures > 5 || (counts.requests > 10 && counts.error_rate() > 0.5)
}

/// Default outcome classification: failures are network errors only, so a
/// routing miss does not trip the breaker.
fn default_is_successful(err: Option<&GatewayError>) -> bool {
    match err {
        None => true,
        Some(e) => !e.is_network_error(),
    }
}

struct Shared {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// Circuit breaker implementation.
pub struct CircuitBreaker {
    name: String,
    max_requests: u32,
    interval: Duration,
    timeout: Duration,
    ready_to_trip: ReadyToTrip,
    is_successful: IsSuccessful,
    on_state_change: Option<OnStateChange>,
    shared: Mutex<Shared>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let cb = Self {
            name: name.into(),
            max_requests: config.max_requests.max(1),
            interval: config.interval,
            timeout: config.timeout,
            ready_to_trip: config.ready_to_trip,
            is_successful: config.is_successful,
            on_state_change: config.on_state_change,
            shared: Mutex::new(Shared {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: None,
            }),
        };
        {
            let mut shared = cb.shared.lock();
            cb.new_generation(&mut shared, Instant::now());
        }
        cb
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` if the breaker allows it.
    ///
    /// The breaker lock is never held across the call itself; the generation
    /// snapshot taken before the call detects transitions that happened while
    /// it ran. A panic inside `f` is recorded as a failure before the panic
    /// is repropagated.
    pub async fn execute<T, F, Fut>(&self, f: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = GatewayResult<T>>,
    {
        let generation = self.before_request()?;

        match AssertUnwindSafe(f()).catch_unwind().await {
            Ok(result) => {
                let success = (self.is_successful)(result.as_ref().err());
                self.after_request(generation, success);
                result
            }
            Err(payload) => {
                self.after_request(generation, false);
                resume_unwind(payload);
            }
        }
    }

    /// Current state, applying time-driven transitions.
    pub fn state(&self) -> CircuitState {
        self.locked(|cb, s, now, tr| cb.current_state(s, now, tr).0)
    }

    /// Counts for the current generation.
    pub fn counts(&self) -> Counts {
        self.locked(|cb, s, now, tr| {
            cb.current_state(s, now, tr);
            s.counts
        })
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let (state, counts) = self.locked(|cb, s, now, tr| {
            let (state, _) = cb.current_state(s, now, tr);
            (state, s.counts)
        });
        CircuitBreakerStats {
            name: self.name.clone(),
            state,
            counts,
            error_rate: counts.error_rate(),
            success_rate: counts.success_rate(),
            max_requests: self.max_requests,
            interval_ms: self.interval.as_millis() as u64,
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    fn before_request(&self) -> GatewayResult<u64> {
        self.locked(|cb, s, now, tr| {
            let (state, generation) = cb.current_state(s, now, tr);

            match state {
                CircuitState::Open => Err(GatewayError::CircuitOpen(cb.name.clone())),
                CircuitState::HalfOpen if s.counts.requests >= cb.max_requests => {
                    Err(GatewayError::TooManyRequests(cb.name.clone()))
                }
                _ => {
                    s.counts.requests += 1;
                    Ok(generation)
                }
            }
        })
    }

    fn after_request(&self, before: u64, success: bool) {
        self.locked(|cb, s, now, tr| {
            let (state, generation) = cb.current_state(s, now, tr);
            if generation != before {
                // Call spanned a transition; its outcome belongs to a dead
                // generation.
                return;
            }
            if success {
                cb.on_success(s, state, now, tr);
            } else {
                cb.on_failure(s, state, now, tr);
            }
        })
    }

    fn on_success(
        &self,
        s: &mut Shared,
        state: CircuitState,
        now: Instant,
        tr: &mut Vec<(CircuitState, CircuitState)>,
    ) {
        s.counts.total_successes += 1;
        s.counts.consecutive_successes += 1;
        s.counts.consecutive_failures = 0;

        if state == CircuitState::HalfOpen {
            self.set_state(s, CircuitState::Closed, now, tr);
        }
    }

    fn on_failure(
        &self,
        s: &mut Shared,
        state: CircuitState,
        now: Instant,
        tr: &mut Vec<(CircuitState, CircuitState)>,
    ) {
        s.counts.total_failures += 1;
        s.counts.consecutive_failures += 1;
        s.counts.consecutive_successes = 0;

        match state {
            CircuitState::Closed => {
                if (self.ready_to_trip)(s.counts) {
                    self.set_state(s, CircuitState::Open, now, tr);
                }
            }
            CircuitState::HalfOpen => self.set_state(s, CircuitState::Open, now, tr),
            CircuitState::Open => {}
        }
    }

    fn current_state(
        &self,
        s: &mut Shared,
        now: Instant,
        tr: &mut Vec<(CircuitState, CircuitState)>,
    ) -> (CircuitState, u64) {
        match s.state {
            CircuitState::Closed => {
                if s.expiry.is_some_and(|e| e <= now) {
                    self.new_generation(s, now);
                }
            }
            CircuitState::Open => {
                if s.expiry.is_some_and(|e| e <= now) {
                    self.set_state(s, CircuitState::HalfOpen, now, tr);
                }
            }
            CircuitState::HalfOpen => {}
        }
        (s.state, s.generation)
    }

    fn set_state(
        &self,
        s: &mut Shared,
        to: CircuitState,
        now: Instant,
        tr: &mut Vec<(CircuitState, CircuitState)>,
    ) {
        if s.state == to {
            return;
        }
        let from = s.state;
        s.state = to;
        self.new_generation(s, now);
        tr.push((from, to));
    }

    fn new_generation(&self, s: &mut Shared, now: Instant) {
        s.generation += 1;
        s.counts = Counts::default();
        s.expiry = match s.state {
            CircuitState::Closed => {
                (self.interval > Duration::ZERO).then(|| now + self.interval)
            }
            CircuitState::Open => Some(now + self.timeout),
            CircuitState::HalfOpen => None,
        };
    }

    /// Run `f` under the breaker lock, then fire transition hooks with the
    /// lock released.
    fn locked<R>(
        &self,
        f: impl FnOnce(&Self, &mut Shared, Instant, &mut Vec<(CircuitState, CircuitState)>) -> R,
    ) -> R {
        let mut transitions = Vec::new();
        let out = {
            let mut shared = self.shared.lock();
            f(self, &mut shared, Instant::now(), &mut transitions)
        };
        for (from, to) in transitions {
            info!(
                service = %self.name,
                from = %from,
                to = %to,
                "circuit breaker state transition"
            );
            if let Some(hook) = &self.on_state_change {
                hook(&self.name, from, to);
            }
        }
        out
    }
}

/// Snapshot of a breaker for admin endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub counts: Counts,
    pub error_rate: f64,
    pub success_rate: f64,
    pub max_requests: u32,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

/// Name-keyed registry of circuit breakers.
///
/// Breakers are created lazily on first use of a service name and live until
/// process exit: a route deletion never destroys the breaker, so a same-name
/// re-creation reuses the accumulated state.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(cb) = self.breakers.read().unwrap().get(name) {
            return Arc::clone(cb);
        }

        let mut breakers = self.breakers.write().unwrap();
        // Double-check after acquiring the write lock.
        if let Some(cb) = breakers.get(name) {
            return Arc::clone(cb);
        }
        let cb = Arc::new(CircuitBreaker::new(name, self.config.clone()));
        breakers.insert(name.to_string(), Arc::clone(&cb));
        cb
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().unwrap().get(name).cloned()
    }

    pub fn all_stats(&self) -> HashMap<String, CircuitBreakerStats> {
        self.breakers
            .read()
            .unwrap()
            .iter()
            .map(|(name, cb)| (name.clone(), cb.stats()))
            .collect()
    }

    pub fn open_circuits(&self) -> usize {
        self.breakers
            .read()
            .unwrap()
            .values()
            .filter(|cb| cb.state() == CircuitState::Open)
            .count()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::sync::oneshot;

    use super::*;

    fn transport_error() -> GatewayError {
        GatewayError::ProxyTransport {
            service: "test".into(),
            message: "connection refused".into(),
        }
    }

    async fn fail(cb: &CircuitBreaker) -> GatewayResult<()> {
        cb.execute(|| async { Err(transport_error()) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> GatewayResult<()> {
        cb.execute(|| async { Ok(()) }).await
    }

    fn quick_config(timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            max_requests: 1,
            interval: Duration::from_secs(60),
            timeout,
            ready_to_trip: Arc::new(|c: Counts| c.consecutive_failures >= 1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_initial_state_closed() {
        let cb = CircuitBreaker::with_defaults("test");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.counts().total_successes, 1);
    }

    #[tokio::test]
    async fn test_trips_after_consecutive_failures() {
        let cb = CircuitBreaker::with_defaults("test");

        // Default trip condition is consecutive_failures > 5.
        for _ in 0..5 {
            assert!(fail(&cb).await.is_err());
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        // While open, calls are rejected without running the target.
        let ran = AtomicU32::new(0);
        let result = cb
            .execute(|| async {
                ran.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(GatewayError::CircuitOpen(_))));
        assert_eq!(ran.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_trips_on_error_rate() {
        let cb = CircuitBreaker::with_defaults("test");

        // One success per two failures keeps consecutive failures at 2, but
        // once requests exceed 10 the error rate above 50% trips the breaker.
        for _ in 0..4 {
            let _ = succeed(&cb).await;
            let _ = fail(&cb).await;
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_non_network_errors_do_not_trip() {
        let cb = CircuitBreaker::new("test", quick_config(Duration::from_secs(30)));

        let result: GatewayResult<()> = cb
            .execute(|| async { Err(GatewayError::NoHealthyEndpoint("test".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counts().total_successes, 1);
    }

    #[tokio::test]
    async fn test_open_to_half_open_after_timeout() {
        let cb = CircuitBreaker::new("test", quick_config(Duration::from_millis(50)));

        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_success_in_half_open_closes() {
        let cb = CircuitBreaker::new("test", quick_config(Duration::from_millis(50)));

        assert!(fail(&cb).await.is_err());
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failure_in_half_open_reopens() {
        let cb = CircuitBreaker::new("test", quick_config(Duration::from_millis(50)));

        assert!(fail(&cb).await.is_err());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_probe_limit() {
        let cb = Arc::new(CircuitBreaker::new(
            "test",
            quick_config(Duration::from_millis(50)),
        ));

        assert!(fail(&cb).await.is_err());
        tokio::time::sleep(Duration::from_millis(80)).await;

        // First probe occupies the single half-open slot.
        let (tx, rx) = oneshot::channel::<()>();
        let probe = {
            let cb = Arc::clone(&cb);
            tokio::spawn(async move {
                cb.execute(|| async {
                    let _ = rx.await;
                    Ok(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Additional probes are rejected.
        let extra = succeed(&cb).await;
        assert!(matches!(extra, Err(GatewayError::TooManyRequests(_))));

        let _ = tx.send(());
        assert!(probe.await.unwrap().is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_generation_safety_across_transition() {
        let cb = Arc::new(CircuitBreaker::new(
            "test",
            quick_config(Duration::from_secs(30)),
        ));

        // Start a call that stays in flight while the breaker trips.
        let (tx, rx) = oneshot::channel::<()>();
        let slow = {
            let cb = Arc::clone(&cb);
            tokio::spawn(async move {
                cb.execute(|| async {
                    let _ = rx.await;
                    Ok(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        // The slow call completes in a dead generation; the open state's
        // counts must remain untouched.
        let _ = tx.send(());
        assert!(slow.await.unwrap().is_ok());

        let counts = cb.counts();
        assert_eq!(counts.requests, 0);
        assert_eq!(counts.total_successes, 0);
        assert_eq!(counts.total_failures, 0);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_interval_rollover_resets_counts() {
        let config = CircuitBreakerConfig {
            interval: Duration::from_millis(50),
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        let _ = succeed(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.counts().requests, 2);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let counts = cb.counts();
        assert_eq!(counts.requests, 0);
        assert_eq!(counts.total_failures, 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_panic_counts_as_failure() {
        let cb = Arc::new(CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                ready_to_trip: Arc::new(|c: Counts| c.consecutive_failures >= 1),
                ..Default::default()
            },
        ));

        let cb2 = Arc::clone(&cb);
        let result = tokio::spawn(async move {
            cb2.execute(|| async {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .await
        })
        .await;
        // The panic is repropagated, so the task itself dies.
        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_state_change_hook_fires() {
        let transitions = Arc::new(std::sync::Mutex::new(Vec::new()));
        let hook_log = Arc::clone(&transitions);
        let config = CircuitBreakerConfig {
            ready_to_trip: Arc::new(|c: Counts| c.consecutive_failures >= 1),
            on_state_change: Some(Arc::new(move |name: &str, from, to| {
                hook_log.lock().unwrap().push((name.to_string(), from, to));
            })),
            ..Default::default()
        };
        let cb = CircuitBreaker::new("orders", config);

        assert!(fail(&cb).await.is_err());

        let seen = transitions.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[("orders".to_string(), CircuitState::Closed, CircuitState::Open)]
        );
    }

    #[tokio::test]
    async fn test_registry_get_or_create() {
        let registry = CircuitBreakerRegistry::default();

        let a = registry.get_or_create("svc-a");
        let b = registry.get_or_create("svc-a");
        let c = registry.get_or_create("svc-b");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.all_stats().len(), 2);
        assert_eq!(registry.open_circuits(), 0);
    }
}
