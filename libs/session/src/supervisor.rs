//! Recovery of cloud-to-device delivery after a transport disconnect.
//!
//! One disconnect opens an episode. Each decision point consults the retry
//! policy and the episode budget; the episode ends when delivery is restored,
//! when nobody needs it any more, or by escalating to a terminal
//! [`Disconnected`]. Disconnects arriving mid-episode are absorbed.

use std::sync::Arc;
use std::time::Duration;

use hdc_core::{Disconnected, RetryPolicy, TransportError};
use metrics::counter;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Retrying,
    /// Last episode restored delivery.
    Recovered,
    /// Last episode gave up.
    Escalated,
}

/// Bookkeeping for the episode in progress.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub last_error: TransportError,
    pub attempts: u32,
    pub started_at: Instant,
    pub budget: Duration,
}

impl RetryContext {
    fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }
}

#[derive(Debug)]
pub enum SupervisorAction {
    /// Wait this long, then attempt re-activation.
    ScheduleAttempt(Duration),
    Recovered,
    Escalate(Disconnected),
    Nothing,
}

pub struct ReconnectSupervisor {
    policy: Arc<dyn RetryPolicy>,
    max_operation_timeout: Duration,
    state: SupervisorState,
    context: Option<RetryContext>,
}

impl ReconnectSupervisor {
    pub fn new(policy: Arc<dyn RetryPolicy>, max_operation_timeout: Duration) -> Self {
        Self {
            policy,
            max_operation_timeout,
            state: SupervisorState::Idle,
            context: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn context(&self) -> Option<&RetryContext> {
        self.context.as_ref()
    }

    pub fn is_retrying(&self) -> bool {
        self.state == SupervisorState::Retrying
    }

    /// Replaces the policy; the next decision point uses it.
    pub fn set_policy(&mut self, policy: Arc<dyn RetryPolicy>) {
        self.policy = policy;
    }

    pub fn on_disconnect(
        &mut self,
        error: TransportError,
        delivery_expected: bool,
        now: Instant,
    ) -> SupervisorAction {
        if self.is_retrying() {
            debug!(error = %error, "disconnect during recovery episode ignored");
            return SupervisorAction::Nothing;
        }
        if !delivery_expected {
            debug!(error = %error, "disconnect with no subscribers, nothing to recover");
            return SupervisorAction::Nothing;
        }
        info!(error = %error, "c2d delivery lost, starting recovery");
        self.state = SupervisorState::Retrying;
        self.context = Some(RetryContext {
            last_error: error,
            attempts: 0,
            started_at: now,
            budget: self.max_operation_timeout,
        });
        self.decide(now)
    }

    /// Feeds the outcome of a re-activation attempt.
    pub fn on_attempt_result(
        &mut self,
        result: Result<(), TransportError>,
        now: Instant,
    ) -> SupervisorAction {
        if !self.is_retrying() {
            return SupervisorAction::Nothing;
        }
        match result {
            Ok(()) => {
                let attempts = self.context.as_ref().map_or(0, |ctx| ctx.attempts);
                info!(attempts, "c2d delivery restored");
                counter!("c2d_reconnect_episodes_total", "outcome" => "recovered").increment(1);
                self.state = SupervisorState::Recovered;
                self.context = None;
                SupervisorAction::Recovered
            }
            Err(err) => {
                if let Some(ctx) = self.context.as_mut() {
                    warn!(attempt = ctx.attempts, error = %err, "re-activation attempt failed");
                    ctx.last_error = err;
                }
                self.decide(now)
            }
        }
    }

    /// Ends the episode without a verdict, e.g. once nothing subscribes.
    pub fn abandon(&mut self, reason: &'static str) {
        if self.is_retrying() {
            info!(reason, "recovery abandoned");
            counter!("c2d_reconnect_episodes_total", "outcome" => "abandoned").increment(1);
            self.state = SupervisorState::Idle;
            self.context = None;
        }
    }

    fn decide(&mut self, now: Instant) -> SupervisorAction {
        let Some(ctx) = self.context.as_mut() else {
            return SupervisorAction::Nothing;
        };
        let elapsed = ctx.elapsed(now);
        if !self.policy.should_retry(&ctx.last_error) {
            return self.escalate("retry policy declined", elapsed);
        }
        if elapsed >= ctx.budget {
            return self.escalate("operation timeout exceeded", elapsed);
        }
        let delay = self
            .policy
            .next_retry_timeout(ctx.attempts, ctx.last_error.is_throttling());
        ctx.attempts += 1;
        debug!(
            attempt = ctx.attempts,
            delay_ms = delay.as_millis() as u64,
            elapsed_ms = elapsed.as_millis() as u64,
            "scheduling re-activation"
        );
        SupervisorAction::ScheduleAttempt(delay)
    }

    fn escalate(&mut self, reason: &str, elapsed: Duration) -> SupervisorAction {
        self.state = SupervisorState::Escalated;
        let Some(ctx) = self.context.take() else {
            return SupervisorAction::Nothing;
        };
        warn!(
            reason,
            attempts = ctx.attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            error = %ctx.last_error,
            "escalating to terminal disconnect"
        );
        counter!("c2d_reconnect_episodes_total", "outcome" => "escalated").increment(1);
        SupervisorAction::Escalate(Disconnected::new(reason, ctx.last_error))
    }
}
