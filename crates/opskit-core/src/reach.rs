//! Bounded polling until a readiness probe succeeds

use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use opskit_exec::ExecError;
use thiserror::Error;
use tokio::time::{Instant, sleep, timeout};

use crate::error::CoreError;
use crate::log::Logger;

/// Consecutive repair failures after which they are logged as errors
pub const REPAIR_ESCALATION_THRESHOLD: u32 = 3;

/// Time allowed for a wait, and the pause between probe attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    timeout: Duration,
    poll_interval: Duration,
    deadline: Option<Instant>,
}

impl RetryBudget {
    /// Create a budget
    ///
    /// # Errors
    /// Returns `CoreError::InvalidBudget` if either duration is zero
    pub fn new(timeout: Duration, poll_interval: Duration) -> Result<Self, CoreError> {
        if timeout.is_zero() {
            return Err(CoreError::InvalidBudget("timeout must be positive".into()));
        }
        if poll_interval.is_zero() {
            return Err(CoreError::InvalidBudget(
                "poll interval must be positive".into(),
            ));
        }

        Ok(Self {
            timeout,
            poll_interval,
            deadline: None,
        })
    }

    /// Also stop at an external deadline; whichever comes first wins
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn remaining(&self, started: Instant) -> Duration {
        let by_timeout = self.timeout.saturating_sub(started.elapsed());
        match self.deadline {
            Some(deadline) => by_timeout.min(deadline.saturating_duration_since(Instant::now())),
            None => by_timeout,
        }
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            deadline: None,
        }
    }
}

/// Why a probe attempt did not produce an answer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// Not ready yet; keep polling
    #[error("{0}")]
    Retryable(String),
    /// Retrying cannot help; stop waiting
    #[error("{0}")]
    Fatal(String),
}

impl From<ExecError> for ProbeError {
    fn from(e: ExecError) -> Self {
        if e.is_retryable() {
            ProbeError::Retryable(e.to_string())
        } else {
            ProbeError::Fatal(e.to_string())
        }
    }
}

/// Outcome of a successful wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitReport {
    /// Probe invocations, including the successful one
    pub attempts: u32,
    /// Time from the first probe until readiness
    pub elapsed: Duration,
}

/// Poll `probe` until it reports ready or the budget runs out
///
/// A probe still running when the budget ends is dropped, so the wait never
/// outlasts the timeout or the deadline by more than scheduling delay.
///
/// # Errors
/// `CoreError::Timeout` when the budget is exhausted, `CoreError::ProbeFailed`
/// as soon as the probe returns [`ProbeError::Fatal`]
pub async fn wait_until_ready<P, Fut>(
    target: &str,
    budget: &RetryBudget,
    logger: &Logger,
    probe: P,
) -> Result<WaitReport, CoreError>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, ProbeError>>,
{
    wait_until_ready_with_repair(target, budget, logger, probe, || async {
        Ok::<(), Infallible>(())
    })
    .await
}

/// Like [`wait_until_ready`], running `repair` before every probe attempt
///
/// Repair failures are logged and otherwise ignored; the wait itself is
/// already bounded. After [`REPAIR_ESCALATION_THRESHOLD`] failures in a
/// row they are logged as errors instead of warnings.
///
/// # Errors
/// Same as [`wait_until_ready`]
pub async fn wait_until_ready_with_repair<P, Fut, R, RFut, E>(
    target: &str,
    budget: &RetryBudget,
    logger: &Logger,
    mut probe: P,
    mut repair: R,
) -> Result<WaitReport, CoreError>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, ProbeError>>,
    R: FnMut() -> RFut,
    RFut: Future<Output = Result<(), E>>,
    E: Display,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;
    let mut repair_failures: u32 = 0;

    logger.debug(format!(
        "waiting up to {:?} for {target} (poll every {:?})",
        budget.timeout, budget.poll_interval
    ));

    loop {
        // repair and probe both count against the budget
        let Ok(repaired) = timeout(budget.remaining(started), repair()).await else {
            return Err(give_up(target, started, attempts, logger));
        };
        match repaired {
            Ok(()) => repair_failures = 0,
            Err(e) => {
                repair_failures += 1;
                let message =
                    format!("repair for {target} failed ({repair_failures} in a row): {e}");
                if repair_failures >= REPAIR_ESCALATION_THRESHOLD {
                    logger.error(message);
                } else {
                    logger.warn(message);
                }
            }
        }

        attempts += 1;
        let Ok(outcome) = timeout(budget.remaining(started), probe()).await else {
            return Err(give_up(target, started, attempts, logger));
        };
        match outcome {
            Ok(true) => {
                let elapsed = started.elapsed();
                logger.info(format!(
                    "{target} ready after {attempts} attempt(s) in {elapsed:?}"
                ));
                return Ok(WaitReport { attempts, elapsed });
            }
            Ok(false) => {
                logger.debug(format!("{target} not ready (attempt {attempts})"));
            }
            Err(ProbeError::Retryable(reason)) => {
                logger.debug(format!(
                    "probe for {target} failed (attempt {attempts}), retrying: {reason}"
                ));
            }
            Err(ProbeError::Fatal(reason)) => {
                logger.error(format!("probe for {target} failed: {reason}"));
                return Err(CoreError::ProbeFailed {
                    target: target.to_string(),
                    reason,
                });
            }
        }

        let remaining = budget.remaining(started);
        if remaining.is_zero() {
            return Err(give_up(target, started, attempts, logger));
        }

        sleep(budget.poll_interval.min(remaining)).await;
    }
}

fn give_up(target: &str, started: Instant, attempts: u32, logger: &Logger) -> CoreError {
    let elapsed = started.elapsed();
    logger.warn(format!(
        "gave up on {target} after {attempts} attempt(s) in {elapsed:?}"
    ));
    CoreError::Timeout {
        target: target.to_string(),
        elapsed,
        attempts,
    }
}
