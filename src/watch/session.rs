/**
 * Watch session
 *
 * One task owning one remote connection for one (resource, namespace,
 * subscription) tuple. The connection itself is supplied by a `SessionDriver`;
 * the session only owns the lifecycle around it:
 *
 * Starting -> Listing -> Watching -> Reconnecting -> Starting ... -> Terminated
 */
use crate::config::Config;
use crate::error::Result;
use crate::watch::backoff::Backoff;
use crate::watch::circuit::CircuitBreaker;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The part of a session that differs per manager: how to connect and what to do with each item
#[async_trait]
pub trait SessionDriver: Send + 'static {
    type Item: Send + 'static;

    /// Establish the stream. For list+watch drivers this lists, applies the
    /// snapshot, then opens the watch from the listed resource version.
    async fn connect(&mut self) -> Result<BoxStream<'static, Result<Self::Item>>>;

    /// Apply one item from the established stream
    fn handle(&mut self, item: Self::Item);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Starting,
    Listing,
    Watching,
    Reconnecting,
    Terminated,
}

impl SessionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Listing,
            2 => Self::Watching,
            3 => Self::Reconnecting,
            _ => Self::Terminated,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Listing => write!(f, "listing"),
            Self::Watching => write!(f, "watching"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Point-in-time view of a session's progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub session: String,
    pub target: String,
    pub state: SessionState,
    pub connect_attempts: u64,
    pub backoff_sleeps: u64,
    pub breaker_rejections: u64,
    pub watch_starts: u64,
    pub events_received: u64,
}

/// Live counters shared between a running session and whoever inspects it
#[derive(Debug)]
pub struct SessionCounters {
    session: String,
    target: String,
    state: AtomicU8,
    connect_attempts: AtomicU64,
    backoff_sleeps: AtomicU64,
    breaker_rejections: AtomicU64,
    watch_starts: AtomicU64,
    events_received: AtomicU64,
}

impl SessionCounters {
    fn new(session: &str, target: &str) -> Self {
        Self {
            session: session.to_string(),
            target: target.to_string(),
            state: AtomicU8::new(SessionState::Starting as u8),
            connect_attempts: AtomicU64::new(0),
            backoff_sleeps: AtomicU64::new(0),
            breaker_rejections: AtomicU64::new(0),
            watch_starts: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            session: self.session.clone(),
            target: self.target.clone(),
            state: self.state(),
            connect_attempts: self.connect_attempts.load(Ordering::SeqCst),
            backoff_sleeps: self.backoff_sleeps.load(Ordering::SeqCst),
            breaker_rejections: self.breaker_rejections.load(Ordering::SeqCst),
            watch_starts: self.watch_starts.load(Ordering::SeqCst),
            events_received: self.events_received.load(Ordering::SeqCst),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// Sleep for `delay`. Returns `false` if `token` was cancelled first.
async fn pause(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

/// How an established stream ended
enum StreamEnd {
    Cancelled,
    Closed,
    Failed(crate::error::Error),
}

pub struct WatchSession<D: SessionDriver> {
    id: String,
    target: String,
    driver: D,
    token: CancellationToken,
    backoff: Backoff,
    breaker: Arc<CircuitBreaker>,
    poll_interval: Duration,
    counters: Arc<SessionCounters>,
}

impl<D: SessionDriver> WatchSession<D> {
    /// `token` must be a child of the owning subscription's token
    #[must_use]
    pub fn new(
        target: impl Into<String>,
        driver: D,
        token: CancellationToken,
        breaker: Arc<CircuitBreaker>,
        config: &Config,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let target = target.into();
        let counters = Arc::new(SessionCounters::new(&id, &target));
        Self {
            id,
            target,
            driver,
            token,
            backoff: Backoff::from_config(&config.backoff),
            breaker,
            poll_interval: config.breaker.poll_interval(),
            counters,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    #[must_use]
    pub fn counters(&self) -> Arc<SessionCounters> {
        self.counters.clone()
    }

    /// Drive the session until its token is cancelled
    pub async fn run(mut self) {
        debug!(session = %self.id, target = %self.target, "watch session starting");

        loop {
            if self.token.is_cancelled() {
                break;
            }
            self.counters.set_state(SessionState::Starting);

            if !self.breaker.allow() {
                bump(&self.counters.breaker_rejections);
                debug!(
                    session = %self.id,
                    breaker = %self.breaker.name(),
                    "circuit open, waiting"
                );
                if pause(&self.token, self.poll_interval).await {
                    continue;
                }
                break;
            }

            self.counters.set_state(SessionState::Listing);
            bump(&self.counters.connect_attempts);
            let connected = tokio::select! {
                () = self.token.cancelled() => break,
                result = self.driver.connect() => result,
            };

            let stream = match connected {
                Ok(stream) => stream,
                Err(e) => {
                    self.breaker.record_failure();
                    self.log_failure("connect failed", &e);
                    if self.reconnect_pause().await {
                        continue;
                    }
                    break;
                }
            };

            self.breaker.record_success();
            self.backoff.reset();
            self.counters.set_state(SessionState::Watching);
            bump(&self.counters.watch_starts);
            info!(session = %self.id, target = %self.target, "🔍 watching");

            match self.pump(stream).await {
                StreamEnd::Cancelled => break,
                StreamEnd::Closed => {
                    debug!(session = %self.id, target = %self.target, "stream closed, reconnecting");
                }
                StreamEnd::Failed(e) => {
                    self.breaker.record_failure();
                    self.log_failure("stream failed", &e);
                }
            }

            if !self.reconnect_pause().await {
                break;
            }
        }

        self.counters.set_state(SessionState::Terminated);
        debug!(session = %self.id, target = %self.target, "watch session terminated");
    }

    async fn pump(&mut self, mut stream: BoxStream<'static, Result<D::Item>>) -> StreamEnd {
        loop {
            let next = tokio::select! {
                () = self.token.cancelled() => return StreamEnd::Cancelled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(item)) => {
                    bump(&self.counters.events_received);
                    self.driver.handle(item);
                }
                Some(Err(e)) => return StreamEnd::Failed(e),
                None => return StreamEnd::Closed,
            }
        }
    }

    /// Sleep one backoff step. Returns `false` if cancelled meanwhile.
    async fn reconnect_pause(&mut self) -> bool {
        self.counters.set_state(SessionState::Reconnecting);
        let delay = self.backoff.next_delay();
        bump(&self.counters.backoff_sleeps);
        debug!(
            session = %self.id,
            target = %self.target,
            attempt = self.backoff.attempt(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "backing off"
        );
        pause(&self.token, delay).await
    }

    fn log_failure(&self, what: &str, e: &crate::error::Error) {
        let class = e.class();
        if class.is_expected() {
            warn!(session = %self.id, target = %self.target, ?class, "{what}: {e}");
        } else {
            error!(session = %self.id, target = %self.target, "❌ {what}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Driver replaying a fixed list of connect outcomes, then pending forever
    struct Scripted {
        outcomes: VecDeque<std::result::Result<Vec<u32>, ()>>,
        seen: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl SessionDriver for Scripted {
        type Item = u32;

        async fn connect(&mut self) -> Result<BoxStream<'static, Result<u32>>> {
            match self.outcomes.pop_front() {
                Some(Ok(items)) => Ok(futures::stream::iter(items.into_iter().map(Ok)).boxed()),
                Some(Err(())) => Err(Error::ConnectionClosed("scripted".into())),
                None => Ok(futures::stream::pending().boxed()),
            }
        }

        fn handle(&mut self, item: u32) {
            self.seen.lock().unwrap().push(item);
        }
    }

    fn session(
        outcomes: Vec<std::result::Result<Vec<u32>, ()>>,
        breaker: Arc<CircuitBreaker>,
    ) -> (WatchSession<Scripted>, Arc<Mutex<Vec<u32>>>, CancellationToken) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();
        let driver = Scripted {
            outcomes: outcomes.into(),
            seen: seen.clone(),
        };
        let s = WatchSession::new("test", driver, token.clone(), breaker, &Config::default());
        (s, seen, token)
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("test", 5, Duration::from_secs(30)))
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_stream_reconnects_without_breaker_failure() {
        let cb = breaker();
        let (s, seen, token) = session(vec![Ok(vec![1, 2]), Ok(vec![3])], cb.clone());
        let counters = s.counters();
        let handle = tokio::spawn(s.run());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        let stats = counters.snapshot();
        assert_eq!(stats.watch_starts, 3);
        assert_eq!(stats.backoff_sleeps, 2);
        assert_eq!(stats.state, SessionState::Watching);
        assert_eq!(cb.consecutive_failures(), 0);

        token.cancel();
        handle.await.unwrap();
        assert_eq!(counters.state(), SessionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_does_not_consume_backoff() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        let (s, _seen, token) = session(vec![], cb.clone());
        let counters = s.counters();
        let handle = tokio::spawn(s.run());

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        let stats = counters.snapshot();
        assert_eq!(stats.connect_attempts, 0);
        assert_eq!(stats.backoff_sleeps, 0);
        assert!(stats.breaker_rejections >= 10);

        tokio::time::sleep(Duration::from_secs(21)).await;
        settle().await;
        assert_eq!(counters.state(), SessionState::Watching);
        assert_eq!(counters.snapshot().backoff_sleeps, 0);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff_sleep() {
        let (s, _seen, token) = session(vec![Err(()); 3], breaker());
        let counters = s.counters();
        let handle = tokio::spawn(s.run());
        settle().await;
        assert_eq!(counters.state(), SessionState::Reconnecting);

        token.cancel();
        handle.await.unwrap();
        assert_eq!(counters.state(), SessionState::Terminated);
        assert_eq!(counters.snapshot().connect_attempts, 1);
    }

    /// `Send` but not `Sync`
    struct Unshared(std::cell::Cell<u32>);

    #[async_trait]
    impl SessionDriver for Unshared {
        type Item = u32;

        async fn connect(&mut self) -> Result<BoxStream<'static, Result<u32>>> {
            Ok(futures::stream::iter([7]).map(Ok).chain(futures::stream::pending()).boxed())
        }

        fn handle(&mut self, item: u32) {
            self.0.set(item);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unshared_driver_runs_on_spawned_task() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        let token = CancellationToken::new();
        let driver = Unshared(std::cell::Cell::new(0));
        let s = WatchSession::new("unshared", driver, token.clone(), cb, &Config::default());
        let counters = s.counters();
        let handle = tokio::spawn(s.run());

        tokio::time::sleep(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(counters.state(), SessionState::Watching);
        assert_eq!(counters.snapshot().events_received, 1);

        token.cancel();
        handle.await.unwrap();
    }
}
