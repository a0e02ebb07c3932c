use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

use crate::retry::{RetryDelayConfiguration, RetryStrategy, RetryStrategyAction};

/// Connection-layer failures subject to reconnect classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The peripheral identifier is not known to the platform
    #[error("peripheral identifier unknown")]
    IdentifierUnknown,
    /// No route to a connection could be resolved
    #[error("connection could not be resolved")]
    ConnectionUnresolvable,
    /// The radio is powered off
    #[error("radio powered off")]
    PoweredOff,
    /// The radio stack is resetting
    #[error("radio resetting")]
    Resetting,
    /// The radio stack is in an unknown state
    #[error("radio in unknown state")]
    UnknownState,
    /// The platform's concurrent-connection limit was reached
    #[error("connection limit reached")]
    ConnectionLimitReached,
    /// The peer is half-bonded and cannot be connected to
    #[error("peer half-bonded")]
    HalfBonded,
    /// The connection attempt failed
    #[error("connection failed")]
    ConnectionFailed,
    /// The peer disconnected
    #[error("peer disconnected")]
    Disconnected,
    /// The connection attempt timed out
    #[error("connection timed out")]
    Timeout,
    /// The peer's service list changed, requiring a fresh connection
    #[error("service list changed")]
    ServicesChanged,
}

/// How far back the circuit breaker looks
const OBSERVATION_INTERVAL: Duration = Duration::from_secs(2 * 60);
/// Retry-classified errors within the window before escalating
const OBSERVATION_LIMIT: usize = 5;

/// Classifies connection-layer failures into stop, suspend-until-resume or
/// retry-with-delay decisions.
///
/// Unrecoverable errors (unknown identifier, unresolvable connection) stop
/// immediately; radio-state errors and half-bonded peers suspend until the
/// configured resume trigger fires; transient errors retry with the
/// configured delay. A sliding-window circuit breaker escalates to suspend
/// once [`OBSERVATION_LIMIT`] otherwise-retryable errors accumulate within
/// [`OBSERVATION_INTERVAL`], preventing rapid retry storms.
#[derive(Debug)]
pub struct ConnectivityRetryStrategy {
    configuration: RetryDelayConfiguration,
    observations: Mutex<Vec<Instant>>,
}

impl ConnectivityRetryStrategy {
    /// Creates a strategy; the configuration's resume trigger also gates the
    /// suspend decisions.
    pub fn new(configuration: RetryDelayConfiguration) -> Self {
        Self {
            configuration,
            observations: Mutex::new(Vec::new()),
        }
    }

    /// Suspends until the resume trigger, or stops if none is configured
    fn suspend_if_supported(&self) -> RetryStrategyAction {
        match &self.configuration.resume {
            Some(trigger) => RetryStrategyAction::SuspendUntil(trigger.clone()),
            None => RetryStrategyAction::Fail,
        }
    }

    /// Makes a decision based on what has been observed in the past
    fn action_from_past(&self) -> Option<RetryStrategyAction> {
        let now = Instant::now();
        let cutoff = now.checked_sub(OBSERVATION_INTERVAL);

        let mut observations = self.observations.lock().unwrap();
        // sliding window: keep fresh observations, append the new one
        if let Some(cutoff) = cutoff {
            observations.retain(|at| *at >= cutoff);
        }
        observations.push(now);

        if observations.len() < OBSERVATION_LIMIT {
            return None;
        }
        warn!(
            count = observations.len(),
            window = ?OBSERVATION_INTERVAL,
            "connectivity error storm, suspending retries"
        );

        // forget everything, so that once connectivity resumes we allow
        // retries again
        observations.clear();
        Some(self.suspend_if_supported())
    }

    fn action_from_current(&self, error: &LinkError) -> RetryStrategyAction {
        match error {
            LinkError::ConnectionLimitReached | LinkError::HalfBonded => self.suspend_if_supported(),
            LinkError::ConnectionFailed
            | LinkError::Disconnected
            | LinkError::Timeout
            | LinkError::ServicesChanged => {
                RetryStrategyAction::Delay(self.configuration.clone())
            }
            other => {
                warn!(error = %other, "unexpected error in the connectivity retry strategy");
                RetryStrategyAction::Delay(self.configuration.clone())
            }
        }
    }
}

impl RetryStrategy<LinkError> for ConnectivityRetryStrategy {
    fn action(&self, error: &LinkError) -> RetryStrategyAction {
        match error {
            LinkError::IdentifierUnknown | LinkError::ConnectionUnresolvable => {
                self.observations.lock().unwrap().clear();
                RetryStrategyAction::Fail
            }
            LinkError::PoweredOff | LinkError::UnknownState | LinkError::Resetting => {
                self.observations.lock().unwrap().clear();
                self.suspend_if_supported()
            }
            _ => self
                .action_from_past()
                .unwrap_or_else(|| self.action_from_current(error)),
        }
    }

    fn reset_failure_history(&self) {
        self.observations.lock().unwrap().clear();
    }
}
