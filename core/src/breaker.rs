//! Circuit breaker.
//!
//! `closed` lets calls through and counts outcomes; once the trip predicate
//! holds the breaker goes `open` and rejects everything until `timeout`
//! elapses. The first call after that runs `half-open`: a success closes the
//! breaker, a failure re-trips it. Every transition bumps the generation and
//! clears the counts, and an outcome is only credited when the generation
//! it started under is still current.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    /// Normal operation.
    Closed,
    /// Probing with a limited number of calls.
    HalfOpen,
    /// Rejecting calls.
    Open,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Closed => "closed",
            State::HalfOpen => "half-open",
            State::Open => "open",
        })
    }
}

/// Request and outcome counts for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    /// Calls admitted.
    pub requests: u32,
    /// Successful outcomes.
    pub total_successes: u32,
    /// Failed outcomes.
    pub total_failures: u32,
    /// Successes since the last failure.
    pub consecutive_successes: u32,
    /// Failures since the last success.
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

/// Decides, from the current counts, whether to trip.
pub type TripFn = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;
/// Observer for transitions: `(breaker name, from, to)`.
pub type StateChangeFn = Arc<dyn Fn(&str, State, State) + Send + Sync>;

/// Breaker configuration.
#[derive(Clone)]
pub struct Settings {
    /// Name used in logs and callbacks.
    pub name: String,
    /// Concurrent probe calls admitted while half-open (0 is treated as 1).
    pub max_requests: u32,
    /// Rolling window in `closed`; zero disables periodic resets.
    pub interval: Duration,
    /// How long `open` lasts before probing.
    pub timeout: Duration,
    /// Trip predicate.
    pub ready_to_trip: TripFn,
    /// Optional transition observer; runs after the breaker's lock is released.
    pub on_state_change: Option<StateChangeFn>,
}

impl Settings {
    /// Settings tripping after more than `n` consecutive failures.
    pub fn trip_after(name: impl Into<String>, n: u32) -> Self {
        Self {
            name: name.into(),
            ready_to_trip: Arc::new(move |c: &Counts| c.consecutive_failures > n),
            ..Self::default()
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            name: "circuit-breaker".to_string(),
            max_requests: 1,
            interval: Duration::ZERO,
            timeout: Duration::from_secs(60),
            ready_to_trip: Arc::new(|c: &Counts| c.consecutive_failures > 5),
            on_state_change: None,
        }
    }
}

/// Why a call did not produce its own result.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// Rejected: the breaker is open.
    #[error("circuit breaker is open")]
    Open,
    /// Rejected: half-open probe slots are taken.
    #[error("too many requests")]
    TooManyRequests,
    /// The wrapped call ran and failed.
    #[error("{0}")]
    Failed(E),
}

impl<E> BreakerError<E> {
    /// `true` when the call was never attempted.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, BreakerError::Failed(_))
    }
}

enum Rejected {
    Open,
    TooManyRequests,
}

impl<E> From<Rejected> for BreakerError<E> {
    fn from(r: Rejected) -> Self {
        match r {
            Rejected::Open => BreakerError::Open,
            Rejected::TooManyRequests => BreakerError::TooManyRequests,
        }
    }
}

struct Inner {
    state: State,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
    transitions: Vec<(State, State)>,
}

/// A call-wrapping failure isolator. Share it behind an `Arc`.
pub struct CircuitBreaker {
    settings: Settings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Build a closed breaker.
    pub fn new(mut settings: Settings) -> Self {
        if settings.max_requests == 0 {
            settings.max_requests = 1;
        }
        let mut inner = Inner {
            state: State::Closed,
            generation: 0,
            counts: Counts::default(),
            expiry: None,
            transitions: Vec::new(),
        };
        inner.new_generation(&settings, Instant::now());
        Self { settings, inner: Mutex::new(inner) }
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Current state, applying any due time-based transition.
    pub fn state(&self) -> State {
        let (state, _) = self.locked(|inner, s| inner.current(s, Instant::now()));
        state
    }

    /// Counts for the current generation.
    pub fn counts(&self) -> Counts {
        self.locked(|inner, s| {
            inner.current(s, Instant::now());
            inner.counts
        })
    }

    /// Run a synchronous call through the breaker. A panic inside `f` is
    /// credited as a failure and then resumed.
    pub fn execute<T, E, F>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let generation = self.before_request()?;
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(res) => {
                self.after_request(generation, res.is_ok());
                res.map_err(BreakerError::Failed)
            }
            Err(payload) => {
                self.after_request(generation, false);
                panic::resume_unwind(payload)
            }
        }
    }

    /// Async counterpart of [`execute`](Self::execute).
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let generation = self.before_request()?;
        match AssertUnwindSafe(f()).catch_unwind().await {
            Ok(res) => {
                self.after_request(generation, res.is_ok());
                res.map_err(BreakerError::Failed)
            }
            Err(payload) => {
                self.after_request(generation, false);
                panic::resume_unwind(payload)
            }
        }
    }

    fn before_request(&self) -> Result<u64, Rejected> {
        self.locked(|inner, s| {
            let (state, generation) = inner.current(s, Instant::now());
            match state {
                State::Open => Err(Rejected::Open),
                State::HalfOpen if inner.counts.requests >= s.max_requests => {
                    Err(Rejected::TooManyRequests)
                }
                _ => {
                    inner.counts.on_request();
                    Ok(generation)
                }
            }
        })
    }

    fn after_request(&self, before: u64, success: bool) {
        self.locked(|inner, s| {
            let now = Instant::now();
            let (_, generation) = inner.current(s, now);
            if generation != before {
                return;
            }
            if success {
                inner.on_success(s, now);
            } else {
                inner.on_failure(s, now);
            }
        })
    }

    /// Run `f` under the lock, then report transitions with the lock released.
    fn locked<R>(&self, f: impl FnOnce(&mut Inner, &Settings) -> R) -> R {
        let (out, transitions) = {
            let mut inner = self.inner.lock();
            let out = f(&mut inner, &self.settings);
            (out, std::mem::take(&mut inner.transitions))
        };
        for (from, to) in transitions {
            info!("breaker {} {} -> {}", self.settings.name, from, to);
            if let Some(cb) = &self.settings.on_state_change {
                cb(&self.settings.name, from, to);
            }
        }
        out
    }
}

impl Inner {
    fn current(&mut self, s: &Settings, now: Instant) -> (State, u64) {
        match self.state {
            State::Closed => {
                if self.expiry.is_some_and(|e| e <= now) {
                    self.new_generation(s, now);
                }
            }
            State::Open => {
                if self.expiry.is_some_and(|e| e <= now) {
                    self.set_state(s, State::HalfOpen, now);
                }
            }
            State::HalfOpen => {}
        }
        (self.state, self.generation)
    }

    fn on_success(&mut self, s: &Settings, now: Instant) {
        self.counts.on_success();
        if self.state == State::HalfOpen {
            self.set_state(s, State::Closed, now);
        }
    }

    fn on_failure(&mut self, s: &Settings, now: Instant) {
        self.counts.on_failure();
        match self.state {
            State::Closed if (s.ready_to_trip)(&self.counts) => self.set_state(s, State::Open, now),
            State::HalfOpen => self.set_state(s, State::Open, now),
            _ => {}
        }
    }

    fn set_state(&mut self, s: &Settings, to: State, now: Instant) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        self.new_generation(s, now);
        self.transitions.push((from, to));
    }

    fn new_generation(&mut self, s: &Settings, now: Instant) {
        self.generation += 1;
        self.counts = Counts::default();
        self.expiry = match self.state {
            State::Closed if s.interval.is_zero() => None,
            State::Closed => Some(now + s.interval),
            State::Open => Some(now + s.timeout),
            State::HalfOpen => None,
        };
    }
}
