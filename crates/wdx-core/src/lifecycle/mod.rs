//! Session lifecycle manager.
//!
//! Owns the reconnect state machine for the single outbound transport session:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                     |             |
//!                     v             v
//!                 Reconnecting <----+
//!                     |
//!                     v
//!                 Exhausted
//! ```
//!
//! Recovery is an explicit loop bounded by `max_retries`. Attempts are
//! serialized behind a gate, so at most one establish call is ever in flight.

pub mod backoff;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    errors::{Error, TransportError},
    ports::{SessionEstablisher, SessionHandle},
    Result,
};

pub use backoff::{random_jitter, LifecycleConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Exhausted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalKind {
    Auth,
    Exhausted,
}

/// The one fatal error surfaced to the process owner.
#[derive(Clone, Debug, Serialize)]
pub struct FatalReport {
    pub kind: FatalKind,
    pub message: String,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// A new session was established by this call.
    Recovered { attempts: u32 },
    /// Another caller already recovered the session this failure was about.
    AlreadyRecovered,
    /// `shutdown()` interrupted the recovery.
    ShutDown,
}

/// Read-only snapshot for monitoring.
#[derive(Clone, Debug, Serialize)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub attempt_count: u32,
    pub max_retries: u32,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success_at: DateTime<Utc>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub circuit_open: bool,
    pub circuit_opened_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub next_retry_in: Option<Duration>,
    pub total_successful_recoveries: u64,
    pub average_recovery_time: Duration,
    pub fatal_reports: u32,
}

#[derive(Debug)]
struct SessionState {
    phase: SessionPhase,
    attempt_count: u32,
    consecutive_failures: u32,
    last_error: Option<String>,
    last_success_at: Instant,
    last_disconnected_at: Option<Instant>,
    circuit_opened_at: Option<Instant>,
    next_retry_at: Option<Instant>,
    total_successful_recoveries: u64,
    total_recovery_time: Duration,
    fatal_reports: u32,
    fatal_kind: Option<FatalKind>,
    generation: u64,
    shut_down: bool,
}

impl SessionState {
    fn new(now: Instant) -> Self {
        Self {
            phase: SessionPhase::Disconnected,
            attempt_count: 0,
            consecutive_failures: 0,
            last_error: None,
            last_success_at: now,
            last_disconnected_at: None,
            circuit_opened_at: None,
            next_retry_at: None,
            total_successful_recoveries: 0,
            total_recovery_time: Duration::ZERO,
            fatal_reports: 0,
            fatal_kind: None,
            generation: 0,
            shut_down: false,
        }
    }

    fn mark_disconnected(&mut self, now: Instant) {
        if self.last_disconnected_at.is_none() {
            self.last_disconnected_at = Some(now);
        }
    }
}

/// Object-safe view of the lifecycle manager, for owners that do not care
/// about the concrete session type (the dispatcher, status commands).
#[async_trait]
pub trait TransportSupervisor: Send + Sync {
    async fn notify_failure(&self, reason: TransportError) -> Result<RecoveryOutcome>;
    async fn status(&self) -> SessionStatus;
}

pub struct SessionLifecycle<E: SessionEstablisher> {
    cfg: LifecycleConfig,
    establisher: E,
    state: Mutex<SessionState>,
    /// Held for the whole duration of a connect/recovery cycle.
    gate: Mutex<()>,
    session: Mutex<Option<Arc<E::Session>>>,
    timers: Mutex<CancellationToken>,
    fatal_tx: watch::Sender<Option<FatalReport>>,
    jitter: fn() -> f64,
}

impl<E: SessionEstablisher> SessionLifecycle<E> {
    pub fn new(cfg: LifecycleConfig, establisher: E) -> Self {
        let (fatal_tx, _) = watch::channel(None);
        Self {
            cfg,
            establisher,
            state: Mutex::new(SessionState::new(Instant::now())),
            gate: Mutex::new(()),
            session: Mutex::new(None),
            timers: Mutex::new(CancellationToken::new()),
            fatal_tx,
            jitter: random_jitter,
        }
    }

    /// Replace the jitter source (deterministic delays in tests).
    pub fn with_jitter(mut self, jitter: fn() -> f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.cfg
    }

    pub fn establisher(&self) -> &E {
        &self.establisher
    }

    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase
    }

    /// The live session, if one is established.
    pub async fn current(&self) -> Option<Arc<E::Session>> {
        self.session.lock().await.clone()
    }

    /// Observe the fatal report. It is sent at most once per process.
    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<FatalReport>> {
        self.fatal_tx.subscribe()
    }

    /// Initial connection. Falls through to the recovery loop on failure.
    pub async fn start(&self) -> Result<Arc<E::Session>> {
        let _gate = self.gate.lock().await;

        {
            let mut st = self.state.lock().await;
            if st.phase == SessionPhase::Exhausted {
                return Err(self.fatal_error(&st));
            }
            st.phase = SessionPhase::Connecting;
        }
        tracing::info!("establishing transport session");

        match self.attempt().await {
            Ok(()) => self.on_success().await,
            Err(e) if e.is_terminal() => return Err(self.fail_fatal(e.message).await),
            Err(e) => {
                tracing::warn!(error = %e, "initial connection failed");
                {
                    let mut st = self.state.lock().await;
                    st.phase = SessionPhase::Reconnecting;
                    st.last_error = Some(e.message);
                    st.mark_disconnected(Instant::now());
                }
                if self.recover().await? == RecoveryOutcome::ShutDown {
                    return Err(Error::External("session lifecycle shut down".to_string()));
                }
            }
        }

        self.current()
            .await
            .ok_or_else(|| Error::External("session not available after connect".to_string()))
    }

    /// Report a transport failure and drive recovery to completion.
    ///
    /// Transient failures are retried with backoff; `Ok` means a session is
    /// live again. `Err` is always fatal (`FatalAuth` or `ExhaustedRetries`).
    pub async fn notify_failure(&self, reason: TransportError) -> Result<RecoveryOutcome> {
        let observed_generation = {
            let mut st = self.state.lock().await;
            if st.shut_down {
                return Ok(RecoveryOutcome::ShutDown);
            }
            if st.phase == SessionPhase::Exhausted {
                return Err(self.fatal_error(&st));
            }
            tracing::warn!(
                reason = %reason,
                terminal = reason.is_terminal(),
                phase = ?st.phase,
                "transport failure reported"
            );
            if st.phase == SessionPhase::Connected {
                st.phase = SessionPhase::Reconnecting;
            }
            st.mark_disconnected(Instant::now());
            st.last_error = Some(reason.message.clone());
            st.generation
        };

        if reason.is_terminal() {
            return Err(self.fail_fatal(reason.message).await);
        }

        let _gate = self.gate.lock().await;
        {
            let st = self.state.lock().await;
            if st.generation != observed_generation {
                tracing::debug!("failure already recovered by a concurrent caller");
                return Ok(RecoveryOutcome::AlreadyRecovered);
            }
            if st.phase == SessionPhase::Exhausted {
                return Err(self.fatal_error(&st));
            }
        }

        self.recover().await
    }

    /// Retry loop. Callers must hold `gate`.
    async fn recover(&self) -> Result<RecoveryOutcome> {
        let token = self.timers.lock().await.clone();

        loop {
            if let Some(wait) = self.circuit_wait().await {
                tracing::warn!(
                    wait_secs = wait.as_secs(),
                    "circuit breaker open; cooling down before next attempt"
                );
                if !self.wait(wait, &token).await {
                    return Ok(RecoveryOutcome::ShutDown);
                }
            }

            let attempt = {
                let mut st = self.state.lock().await;
                if st.shut_down {
                    return Ok(RecoveryOutcome::ShutDown);
                }
                if st.attempt_count >= self.cfg.max_retries {
                    drop(st);
                    return Err(self.on_exhausted().await);
                }
                st.attempt_count += 1;
                st.consecutive_failures += 1;
                st.phase = SessionPhase::Reconnecting;
                st.attempt_count
            };

            let delay = self.cfg.backoff_delay(attempt, (self.jitter)());
            tracing::info!(
                attempt,
                max_retries = self.cfg.max_retries,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnection attempt"
            );
            if !self.wait(delay, &token).await {
                return Ok(RecoveryOutcome::ShutDown);
            }

            match self.attempt().await {
                Ok(()) => {
                    self.on_success().await;
                    return Ok(RecoveryOutcome::Recovered { attempts: attempt });
                }
                Err(e) if e.is_terminal() => return Err(self.fail_fatal(e.message).await),
                Err(e) => {
                    let remaining = self.cfg.max_retries.saturating_sub(attempt);
                    tracing::warn!(attempt, remaining, error = %e, "reconnection attempt failed");
                    self.state.lock().await.last_error = Some(e.message);
                }
            }
        }
    }

    /// Remaining cooldown, counted from the last success and capped at
    /// `max_circuit_wait`, if the breaker is open.
    async fn circuit_wait(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut st = self.state.lock().await;
        let since_success = now.saturating_duration_since(st.last_success_at);
        if !self.cfg.circuit_open(st.consecutive_failures, since_success) {
            return None;
        }

        if st.circuit_opened_at.is_none() {
            st.circuit_opened_at = Some(now);
            tracing::warn!(
                consecutive_failures = st.consecutive_failures,
                since_success_secs = since_success.as_secs(),
                "circuit breaker opened"
            );
        }
        let wait = self
            .cfg
            .circuit_cooldown
            .saturating_sub(since_success)
            .min(self.cfg.max_circuit_wait);
        (!wait.is_zero()).then_some(wait)
    }

    /// Sleep unless cancelled. Returns false when cancelled.
    async fn wait(&self, delay: Duration, token: &CancellationToken) -> bool {
        self.state.lock().await.next_retry_at = Some(Instant::now() + delay);

        let completed = tokio::select! {
            _ = sleep(delay) => true,
            _ = token.cancelled() => false,
        };

        self.state.lock().await.next_retry_at = None;
        completed
    }

    /// One establish call: tear down the previous session, then connect under
    /// the attempt timeout.
    async fn attempt(&self) -> std::result::Result<(), TransportError> {
        self.teardown_current().await;

        match timeout(self.cfg.establish_timeout, self.establisher.establish()).await {
            Ok(Ok(session)) => {
                *self.session.lock().await = Some(Arc::new(session));
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::transient(format!(
                "establish timed out after {}s",
                self.cfg.establish_timeout.as_secs()
            ))),
        }
    }

    async fn teardown_current(&self) {
        let previous = self.session.lock().await.take();
        if let Some(previous) = previous {
            if let Err(e) = previous.teardown().await {
                tracing::warn!(error = %e, "teardown of previous session failed; continuing");
            }
        }
    }

    async fn cancel_timers(&self) {
        let mut token = self.timers.lock().await;
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Confirmed establishment: reset counters and record statistics.
    pub async fn on_success(&self) {
        let now = Instant::now();
        {
            let mut st = self.state.lock().await;
            let attempts = st.attempt_count;
            let recovery_time = st
                .last_disconnected_at
                .take()
                .map(|at| now.saturating_duration_since(at));

            if let Some(t) = recovery_time {
                st.total_successful_recoveries += 1;
                st.total_recovery_time += t;
            }

            st.phase = SessionPhase::Connected;
            st.attempt_count = 0;
            st.consecutive_failures = 0;
            st.last_error = None;
            st.last_success_at = now;
            st.circuit_opened_at = None;
            st.next_retry_at = None;
            st.generation += 1;

            let average = average(st.total_recovery_time, st.total_successful_recoveries);
            tracing::info!(
                attempts,
                recovery_ms = recovery_time.map(|t| t.as_millis() as u64),
                total_recoveries = st.total_successful_recoveries,
                average_recovery_ms = average.as_millis() as u64,
                "transport session established"
            );
        }
        self.cancel_timers().await;
    }

    /// Out of retries: terminal phase plus the single fatal report.
    pub async fn on_exhausted(&self) -> Error {
        let err = {
            let mut st = self.state.lock().await;
            st.phase = SessionPhase::Exhausted;
            st.next_retry_at = None;
            let err = self.fatal_error(&st);
            self.report_fatal(&mut st, FatalKind::Exhausted, err.to_string());
            err
        };
        self.cancel_timers().await;
        err
    }

    async fn fail_fatal(&self, message: String) -> Error {
        {
            let mut st = self.state.lock().await;
            st.phase = SessionPhase::Exhausted;
            st.next_retry_at = None;
            st.last_error = Some(message.clone());
            self.report_fatal(&mut st, FatalKind::Auth, message.clone());
        }
        self.cancel_timers().await;
        Error::FatalAuth(message)
    }

    fn report_fatal(&self, st: &mut SessionState, kind: FatalKind, message: String) {
        if st.fatal_reports > 0 {
            return;
        }
        st.fatal_reports = 1;
        st.fatal_kind = Some(kind);
        tracing::error!(
            kind = ?kind,
            attempts = st.attempt_count,
            message = %message,
            "transport session lost; manual intervention required"
        );
        self.fatal_tx.send_replace(Some(FatalReport {
            kind,
            message,
            attempts: st.attempt_count,
            at: Utc::now(),
        }));
    }

    /// The error every call returns once the session is terminal.
    fn fatal_error(&self, st: &SessionState) -> Error {
        let last_error = st
            .last_error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        match st.fatal_kind {
            Some(FatalKind::Auth) => Error::FatalAuth(last_error),
            _ => Error::ExhaustedRetries {
                attempts: st.attempt_count,
                last_error,
            },
        }
    }

    /// Cancel pending waits and tear the current session down. Idempotent.
    pub async fn shutdown(&self) {
        self.state.lock().await.shut_down = true;
        self.cancel_timers().await;
        self.teardown_current().await;
        let mut st = self.state.lock().await;
        if st.phase != SessionPhase::Exhausted {
            st.phase = SessionPhase::Disconnected;
        }
        tracing::info!("session lifecycle shut down");
    }

    pub async fn status(&self) -> SessionStatus {
        let now = Instant::now();
        let wall_now = Utc::now();
        let st = self.state.lock().await;

        let since_success = now.saturating_duration_since(st.last_success_at);
        SessionStatus {
            phase: st.phase,
            attempt_count: st.attempt_count,
            max_retries: self.cfg.max_retries,
            consecutive_failures: st.consecutive_failures,
            last_error: st.last_error.clone(),
            last_success_at: to_wall(st.last_success_at, now, wall_now),
            last_disconnected_at: st.last_disconnected_at.map(|t| to_wall(t, now, wall_now)),
            circuit_open: self.cfg.circuit_open(st.consecutive_failures, since_success),
            circuit_opened_at: st.circuit_opened_at.map(|t| to_wall(t, now, wall_now)),
            next_retry_at: st.next_retry_at.map(|t| to_wall(t, now, wall_now)),
            next_retry_in: st.next_retry_at.map(|t| t.saturating_duration_since(now)),
            total_successful_recoveries: st.total_successful_recoveries,
            average_recovery_time: average(st.total_recovery_time, st.total_successful_recoveries),
            fatal_reports: st.fatal_reports,
        }
    }
}

#[async_trait]
impl<E: SessionEstablisher> TransportSupervisor for SessionLifecycle<E> {
    async fn notify_failure(&self, reason: TransportError) -> Result<RecoveryOutcome> {
        SessionLifecycle::notify_failure(self, reason).await
    }

    async fn status(&self) -> SessionStatus {
        SessionLifecycle::status(self).await
    }
}

fn average(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    total / u32::try_from(count).unwrap_or(u32::MAX)
}

/// Map a monotonic instant onto the wall clock for display.
fn to_wall(at: Instant, now: Instant, wall_now: DateTime<Utc>) -> DateTime<Utc> {
    let delta = |d: Duration| chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero());
    if at <= now {
        wall_now - delta(now - at)
    } else {
        wall_now + delta(at - now)
    }
}
