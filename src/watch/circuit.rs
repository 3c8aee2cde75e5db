//! Circuit breaker gating reconnect attempts.
//!
//! ```text
//! Closed ──threshold consecutive failures──▶ Open
//! Open ──cooldown elapsed──▶ HalfOpen (one trial granted)
//! HalfOpen ──success──▶ Closed
//! HalfOpen ──failure──▶ Open (fresh cooldown)
//! ```
//!
//! Breakers are shared between sessions according to a [`BreakerScope`], so
//! all methods take `&self` and serialize on an internal mutex.

use crate::config::BreakerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Set while the single half-open trial is outstanding
    trial_started_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_started_at: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a connection attempt may proceed now.
    ///
    /// In `HalfOpen` only one caller gets `true` until the trial is resolved by
    /// `record_success` or `record_failure`. A trial nobody resolves (its session
    /// was cancelled) expires after one cooldown so the breaker cannot wedge.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|opened| now.duration_since(opened) >= self.cooldown);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started_at = Some(now);
                    info!(breaker = %self.name, "circuit half-open, granting trial connection");
                }
                cooled
            }
            CircuitState::HalfOpen => {
                let trial_free = inner
                    .trial_started_at
                    .is_none_or(|started| now.duration_since(started) >= self.cooldown);
                if trial_free {
                    inner.trial_started_at = Some(now);
                }
                trial_free
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, "circuit closed after successful trial");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_started_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            CircuitState::Closed if inner.consecutive_failures >= self.threshold => {
                warn!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    cooldown_secs = self.cooldown.as_secs(),
                    "circuit opened"
                );
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "trial connection failed, circuit reopened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_started_at = None;
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// How widely a breaker is shared between sessions of one manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BreakerScope {
    /// Every session gets its own breaker
    Session,
    /// Sessions watching the same resource kind share one
    Kind,
    /// Sessions watching the same kind in the same namespace share one
    #[default]
    KindNamespace,
    /// One breaker for the whole manager
    Manager,
}

/// Hands out breakers according to the configured scope
#[derive(Debug)]
pub struct BreakerRegistry {
    scope: BreakerScope,
    threshold: u32,
    cooldown: Duration,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            scope: config.scope,
            threshold: config.threshold,
            cooldown: config.cooldown(),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker for a session watching `target` in `namespace` (`None` = all namespaces)
    pub fn breaker_for(&self, target: &str, namespace: Option<&str>) -> Arc<CircuitBreaker> {
        let key = match self.scope {
            BreakerScope::Session => {
                return Arc::new(CircuitBreaker::new(target, self.threshold, self.cooldown));
            }
            BreakerScope::Kind => target.to_string(),
            BreakerScope::KindNamespace => format!("{target}@{}", namespace.unwrap_or("*")),
            BreakerScope::Manager => "*".to_string(),
        };
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.threshold, self.cooldown)))
            .clone()
    }

    /// Current state of every shared breaker, keyed by scope key
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, CircuitState> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .iter()
            .map(|(key, breaker)| (key.clone(), breaker.state()))
            .collect()
    }
}
