//! Core rate limiter implementation.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backoff::BackoffTimer;
use super::policy::LimiterPolicy;

/// Mutable bookkeeping guarded by the limiter's lock.
#[derive(Debug)]
struct LimiterState {
    /// Requests admitted since the window last reset
    request_count: u32,
    /// When the window last reset or a request was last admitted
    last_request_time: Instant,
    /// Backoff debt accumulated within the current window
    waiting_time: Duration,
    /// Identities currently between admission and release
    pending: HashSet<String>,
    /// The most recently scheduled backoff timer per identity
    active_backoffs: HashMap<String, AbortHandle>,
}

impl LimiterState {
    fn new(now: Instant) -> Self {
        Self {
            request_count: 0,
            last_request_time: now,
            waiting_time: Duration::ZERO,
            pending: HashSet::new(),
            active_backoffs: HashMap::new(),
        }
    }

    /// Reset the window if it has expired. Returns the time since the last request.
    fn maybe_reset_window(&mut self, now: Instant, window: Duration) -> Duration {
        let elapsed = now.saturating_duration_since(self.last_request_time);
        if elapsed > window {
            trace!(
                request_count = self.request_count,
                waiting_ms = self.waiting_time.as_millis() as u64,
                "Rate limit window expired, resetting"
            );
            self.request_count = 0;
            self.waiting_time = Duration::ZERO;
            self.last_request_time = now;
            return Duration::ZERO;
        }
        elapsed
    }
}

/// Point-in-time view of the limiter's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterSnapshot {
    pub request_count: u32,
    pub waiting_time: Duration,
    pub pending: usize,
}

/// Tracks the rolling request budget and decides how long callers must wait.
///
/// The limiter holds no network code. Its bookkeeping sits behind a lock that
/// is never held across an `.await`. Callers that share one instance through an
/// `Arc` take an [`admission_turn`](Self::admission_turn) around admission and
/// the network call, so the budget and call spacing hold across all of them.
#[derive(Debug)]
pub struct RateLimiter {
    policy: LimiterPolicy,
    state: Mutex<LimiterState>,
    turn: AsyncMutex<()>,
}

impl RateLimiter {
    /// Create a new rate limiter with the default policy.
    pub fn new() -> Self {
        Self::with_policy(LimiterPolicy::default())
    }

    /// Create a new rate limiter with a custom policy.
    pub fn with_policy(policy: LimiterPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(LimiterState::new(Instant::now())),
            turn: AsyncMutex::new(()),
        }
    }

    /// The policy this limiter enforces.
    pub fn policy(&self) -> &LimiterPolicy {
        &self.policy
    }

    /// Wait for exclusive use of the budget.
    ///
    /// Hold the guard from [`admission_delay`](Self::admission_delay) until the
    /// network call returns, and drop it before any backoff wait. Turns are
    /// granted in FIFO order.
    pub async fn admission_turn(&self) -> AsyncMutexGuard<'_, ()> {
        self.turn.lock().await
    }

    /// Compute how long the caller must wait before issuing the request.
    ///
    /// Marks `request_id` pending; the caller must pair this with
    /// [`release_pending`](Self::release_pending). If the identity is already
    /// pending, this polls until it is released before computing anything.
    pub async fn admission_delay(&self, request_id: &str, retry_count: u32) -> Duration {
        loop {
            if let Some(delay) = self.try_admit(request_id, retry_count) {
                return delay;
            }
            trace!(
                request_id = %request_id,
                poll_ms = self.policy.pending_poll_interval.as_millis() as u64,
                "Identity already pending, polling"
            );
            tokio::time::sleep(self.policy.pending_poll_interval).await;
        }
    }

    fn try_admit(&self, request_id: &str, retry_count: u32) -> Option<Duration> {
        let mut state = self.state.lock();
        if state.pending.contains(request_id) {
            return None;
        }
        state.pending.insert(request_id.to_string());

        let now = Instant::now();
        let elapsed = state.maybe_reset_window(now, self.policy.window);

        let required = if state.request_count >= self.policy.max_requests {
            let window_remaining = self.policy.window.saturating_sub(elapsed) + state.waiting_time;
            window_remaining.max(self.policy.backoff_for(retry_count))
        } else {
            Duration::ZERO
        };
        let delay = required.max(self.policy.min_request_interval);

        debug!(
            request_id = %request_id,
            retry = retry_count,
            request_count = state.request_count,
            delay_ms = delay.as_millis() as u64,
            "Computed admission delay"
        );
        Some(delay)
    }

    /// Record that a request is about to reach the transport.
    pub fn note_admitted(&self) {
        let mut state = self.state.lock();
        state.request_count += 1;
        state.last_request_time = Instant::now();
    }

    /// Clear the pending marker for an identity.
    pub fn release_pending(&self, request_id: &str) {
        let mut state = self.state.lock();
        if !state.pending.remove(request_id) {
            trace!(request_id = %request_id, "Released identity that was not pending");
        }
    }

    /// Schedule a backoff timer for a throttled request.
    ///
    /// The delay is added to the window's backoff debt. An earlier timer for the
    /// same identity that has not fired yet is cancelled; timers for other
    /// identities are left alone. Must be called from a tokio runtime.
    pub fn backoff_delay(&self, request_id: &str, retry_count: u32) -> BackoffTimer {
        let delay = self.policy.backoff_for(retry_count);
        let timer = BackoffTimer::start(delay);

        let mut state = self.state.lock();
        state.waiting_time += delay;
        state.active_backoffs.retain(|_, handle| !handle.is_finished());
        if let Some(previous) = state
            .active_backoffs
            .insert(request_id.to_string(), timer.abort_handle())
        {
            debug!(request_id = %request_id, "Cancelling superseded backoff timer");
            previous.abort();
        }

        debug!(
            request_id = %request_id,
            retry = retry_count,
            delay_ms = delay.as_millis() as u64,
            waiting_ms = state.waiting_time.as_millis() as u64,
            "Scheduled backoff"
        );
        timer
    }

    /// Cancel every live backoff timer.
    pub fn cancel_backoff(&self) {
        for (_, handle) in self.state.lock().active_backoffs.drain() {
            handle.abort();
        }
    }

    /// The configured retry ceiling.
    pub fn max_retries(&self) -> u32 {
        self.policy.max_retries
    }

    /// Current bookkeeping, after applying any due window reset.
    pub fn snapshot(&self) -> LimiterSnapshot {
        let mut state = self.state.lock();
        state.maybe_reset_window(Instant::now(), self.policy.window);
        LimiterSnapshot {
            request_count: state.request_count,
            waiting_time: state.waiting_time,
            pending: state.pending.len(),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
