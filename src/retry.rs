use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

/// Fires whenever suspended or delayed retry attempts should resume.
///
/// Handed out by a [`ResumeHandle`]; each wait observes the next firing.
#[derive(Debug, Clone)]
pub struct ResumeTrigger {
    rx: watch::Receiver<()>,
}

impl ResumeTrigger {
    /// Resolves on the next firing after the wait begins; earlier firings
    /// are not replayed.
    ///
    /// If the handle is gone the trigger can never fire again and this waits
    /// forever.
    pub async fn fired(&mut self) {
        self.rx.borrow_and_update();
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Fires [`ResumeTrigger`]s, e.g. when the user foregrounds the app or the
/// radio powers back on.
#[derive(Debug, Clone)]
pub struct ResumeHandle {
    tx: Arc<watch::Sender<()>>,
}

impl ResumeHandle {
    /// Creates a handle with no listeners yet
    pub fn new() -> Self {
        let (tx, _) = watch::channel(());
        Self { tx: Arc::new(tx) }
    }

    /// A trigger observing this handle's future firings
    pub fn trigger(&self) -> ResumeTrigger {
        ResumeTrigger {
            rx: self.tx.subscribe(),
        }
    }

    /// Wakes every current and future waiter once
    pub fn fire(&self) {
        let _ = self.tx.send(());
    }
}

impl Default for ResumeHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for [`RetryStrategyAction::Delay`]
#[derive(Debug, Clone)]
pub struct RetryDelayConfiguration {
    /// Delay before retrying; `None` retries without waiting
    pub interval: Option<Duration>,
    /// Maximum number of retries; 0 for none
    pub max_retries: u32,
    /// Growth applied to the delay on each attempt, as
    /// `interval * (1 + multiplier)^attempt`. Must not be negative.
    pub multiplier: f64,
    /// Retry immediately, without further waiting, when this fires
    pub resume: Option<ResumeTrigger>,
}

impl RetryDelayConfiguration {
    /// Creates a configuration with no growth and no resume trigger
    pub fn new(interval: Option<Duration>, max_retries: u32) -> Self {
        Self {
            interval,
            max_retries,
            multiplier: 0.0,
            resume: None,
        }
    }

    /// Sets the delay growth multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the resume trigger
    pub fn with_resume(mut self, resume: ResumeTrigger) -> Self {
        self.resume = Some(resume);
        self
    }
}

/// What to do about a failed attempt
#[derive(Debug, Clone)]
pub enum RetryStrategyAction {
    /// Stop retrying and forward the original error
    Fail,
    /// Retry according to the configuration
    Delay(RetryDelayConfiguration),
    /// Stop retrying until the trigger fires
    SuspendUntil(ResumeTrigger),
}

/// Decides, per failure, whether and when to retry an operation
pub trait RetryStrategy<E>: Send + Sync {
    /// Called when an error terminated the operation
    fn action(&self, error: &E) -> RetryStrategyAction;

    /// Forgets any accumulated failure observations, typically called after
    /// the operation eventually succeeded.
    fn reset_failure_history(&self) {}
}

/// A strategy that retries with the same delay configuration regardless of
/// the error.
#[derive(Debug, Clone)]
pub struct DefaultRetryStrategy {
    configuration: RetryDelayConfiguration,
}

impl DefaultRetryStrategy {
    /// Creates a strategy from a delay configuration
    pub fn new(configuration: RetryDelayConfiguration) -> Self {
        Self { configuration }
    }
}

impl<E> RetryStrategy<E> for DefaultRetryStrategy {
    fn action(&self, _error: &E) -> RetryStrategyAction {
        RetryStrategyAction::Delay(self.configuration.clone())
    }
}

/// Runs `operation` repeatedly until it succeeds or the strategy gives up.
///
/// Attempts are strictly sequential. Delays grow geometrically with the
/// attempt index and are cut short when the configured resume trigger fires,
/// whichever happens first. Once the attempt index reaches `max_retries` the
/// operation either suspends until the resume trigger fires or fails with
/// the original error.
pub async fn retry_with<T, E, S, F, Fut>(strategy: &S, mut operation: F) -> Result<T, E>
where
    S: RetryStrategy<E> + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        match strategy.action(&error) {
            RetryStrategyAction::Fail => return Err(error),
            RetryStrategyAction::SuspendUntil(mut trigger) => {
                debug!(attempt, "retries suspended until resume trigger fires");
                trigger.fired().await;
            }
            RetryStrategyAction::Delay(configuration) => {
                if configuration.multiplier < 0.0 {
                    debug_assert!(
                        false,
                        "negative retry multiplier {}",
                        configuration.multiplier
                    );
                    return Err(error);
                }

                if attempt >= configuration.max_retries {
                    match configuration.resume {
                        Some(mut trigger) => {
                            debug!(attempt, "retries exhausted, waiting for resume trigger");
                            trigger.fired().await;
                        }
                        None => return Err(error),
                    }
                } else if let Some(interval) = configuration.interval {
                    let delay =
                        interval.mul_f64((1.0 + configuration.multiplier).powi(attempt as i32));
                    debug!(attempt, ?delay, "retrying after delay");
                    match configuration.resume {
                        Some(mut trigger) => {
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = trigger.fired() => {
                                    debug!(attempt, "resume trigger cut the retry delay short");
                                }
                            }
                        }
                        None => tokio::time::sleep(delay).await,
                    }
                }
                // no interval: retry immediately
            }
        }
        attempt += 1;
    }
}
