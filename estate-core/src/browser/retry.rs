use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::RetrySection;
use tokio_util::sync::CancellationToken;

use super::error::{AutomationError, AutomationResult};
use super::error_handler::{
    map_category, telemetry_failure, AttemptScope, AutomationTelemetry, ErrorCategory,
    FailureClass, RemediationAction,
};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter: Duration,
}

impl RetryPolicy {
    pub fn new(config: RetrySection) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier.max(1.0),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier: multiplier.max(1.0),
            max_delay: Duration::MAX,
            jitter: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(attempt as i32 - 1);
        let millis = self.base_delay.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            self.max_delay
        } else {
            Duration::from_millis(millis.round() as u64)
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        delay + Duration::from_millis(extra)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetrySection::default())
    }
}

/// Per-invocation bookkeeping: attempt index, the next backoff and the last classification.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempt: u32,
    pub next_delay: Option<Duration>,
    pub last_class: Option<FailureClass>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub label: String,
    pub attempt: u32,
    pub succeeded: bool,
    pub category: Option<ErrorCategory>,
    pub class: Option<FailureClass>,
    pub error: Option<String>,
    pub backoff_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: u32,
    pub history: Vec<AttemptRecord>,
}

#[derive(Debug, Error)]
#[error("{label} failed after {attempts} attempt(s): {error}")]
pub struct RetryFailure {
    pub label: String,
    pub error: AutomationError,
    pub attempts: u32,
    pub class: FailureClass,
    pub cancelled: bool,
    pub history: Vec<AttemptRecord>,
}

#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    telemetry: Option<Arc<AutomationTelemetry>>,
    scope: AttemptScope,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            telemetry: None,
            scope: AttemptScope::default(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Option<Arc<AutomationTelemetry>>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_scope(mut self, city: &str, session_id: &str) -> Self {
        self.scope = AttemptScope {
            city: city.to_string(),
            session_id: session_id.to_string(),
        };
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn guard<F, Fut, T>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<RetryOutcome<T>, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AutomationResult<T>>,
    {
        let mut state = RetryState::default();
        let mut history = Vec::new();
        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled(label, state.attempt, history));
            }
            state.attempt += 1;
            let attempt = state.attempt;
            debug!(label, attempt, city = %self.scope.city, "running guarded operation");

            let error = match operation(attempt).await {
                Ok(result) => {
                    history.push(AttemptRecord {
                        label: label.to_string(),
                        attempt,
                        succeeded: true,
                        category: None,
                        class: None,
                        error: None,
                        backoff_ms: None,
                    });
                    return Ok(RetryOutcome {
                        result,
                        attempts: attempt,
                        history,
                    });
                }
                Err(error) => error,
            };

            let category = map_category(&error);
            let class = category.class();
            state.last_class = Some(class);
            let exhausted = attempt >= self.policy.max_attempts;
            state.next_delay = match class {
                FailureClass::Retryable if !exhausted => Some(
                    self.policy
                        .jittered(self.policy.delay_for_attempt(attempt)),
                ),
                _ => None,
            };
            let action = match (class, state.next_delay) {
                (FailureClass::Fatal, _) => RemediationAction::ShortCircuit,
                (FailureClass::Retryable, Some(delay)) => RemediationAction::RetryScheduled {
                    delay_ms: delay.as_millis() as u64,
                },
                (FailureClass::Retryable, None) => RemediationAction::Exhausted,
            };
            history.push(AttemptRecord {
                label: label.to_string(),
                attempt,
                succeeded: false,
                category: Some(category),
                class: Some(class),
                error: Some(error.to_string()),
                backoff_ms: state.next_delay.map(|d| d.as_millis() as u64),
            });
            self.record(label, &error, attempt, action);

            let Some(delay) = state.next_delay else {
                warn!(
                    label,
                    attempt,
                    city = %self.scope.city,
                    category = category.as_str(),
                    error = %error,
                    "guarded operation failed permanently"
                );
                return Err(RetryFailure {
                    label: label.to_string(),
                    cancelled: matches!(error, AutomationError::Cancelled),
                    error,
                    attempts: attempt,
                    class,
                    history,
                });
            };

            info!(
                label,
                attempt,
                city = %self.scope.city,
                category = category.as_str(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after backoff"
            );
            if !delay.is_zero() {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(self.cancelled(label, attempt, history));
                    }
                }
            }
        }
    }

    fn cancelled(&self, label: &str, attempts: u32, history: Vec<AttemptRecord>) -> RetryFailure {
        let error = AutomationError::Cancelled;
        self.record(label, &error, attempts, RemediationAction::Cancelled);
        warn!(label, attempts, city = %self.scope.city, "guarded operation cancelled");
        RetryFailure {
            label: label.to_string(),
            error,
            attempts,
            class: FailureClass::Fatal,
            cancelled: true,
            history,
        }
    }

    fn record(&self, label: &str, error: &AutomationError, attempt: u32, action: RemediationAction) {
        if let Some(telemetry) = &self.telemetry {
            if let Err(err) = telemetry_failure(telemetry, &self.scope, label, error, attempt, action)
            {
                warn!(error = %err, label, "failed to record attempt telemetry");
            }
        }
    }
}
