//! Readiness poller
//!
//! The single bounded-retry primitive behind every "wait until X" in the
//! pipeline: SSH port open, cluster API reachable, rollout converged.
//!
//! Semantics:
//! - Each probe is bounded by the policy's per-attempt timeout; a probe that
//!   overruns counts as a failed attempt
//! - The poller sleeps `interval` after every failed attempt
//! - The first success resolves the wait (no debounce)
//! - After `max_attempts` failures the wait resolves to [`Timeout`]

use std::future::Future;
use tokio::time;
use tracing::{info, warn};
use tugboat_core::domain::policy::RetryPolicy;
use tugboat_core::error::Timeout;

/// Result of one readiness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check<E> {
    Ready,
    Pending,
    /// The condition can no longer become true; stop polling
    Abort(E),
}

/// Why a poll ended without the condition becoming ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollError<E> {
    Timeout(Timeout),
    Aborted { attempts: u32, error: E },
}

/// Polls `check` until it reports ready, aborts, or the policy is exhausted
///
/// Returns the number of attempts it took to observe readiness.
pub async fn poll_until<E, F, Fut>(
    what: &str,
    policy: &RetryPolicy,
    mut check: F,
) -> Result<u32, PollError<E>>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Check<E>>,
{
    let max_attempts = policy.max_attempts();
    info!(
        "Waiting for {} (up to {} attempt(s), every {:?})",
        what,
        max_attempts,
        policy.interval()
    );

    for attempt in 1..=max_attempts {
        let outcome = match time::timeout(policy.per_attempt_timeout(), check()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    "Probe for {} exceeded {:?} (attempt {}/{})",
                    what,
                    policy.per_attempt_timeout(),
                    attempt,
                    max_attempts
                );
                Check::Pending
            }
        };

        match outcome {
            Check::Ready => {
                info!("{} ready after {} attempt(s)", what, attempt);
                return Ok(attempt);
            }
            Check::Abort(error) => {
                warn!("Giving up on {} at attempt {}: {}", what, attempt, error);
                return Err(PollError::Aborted {
                    attempts: attempt,
                    error,
                });
            }
            Check::Pending => {
                warn!(
                    "{} not ready (attempt {}/{}), retrying in {:?}",
                    what,
                    attempt,
                    max_attempts,
                    policy.interval()
                );
                time::sleep(policy.interval()).await;
            }
        }
    }

    warn!("{} not ready after {} attempt(s)", what, max_attempts);
    Err(PollError::Timeout(Timeout {
        what: what.to_string(),
        attempts: max_attempts,
    }))
}

/// Polls a boolean probe until it returns `true` or the policy is exhausted
pub async fn poll_until_ready<F, Fut>(
    what: &str,
    policy: &RetryPolicy,
    mut check: F,
) -> Result<u32, Timeout>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = poll_until::<std::convert::Infallible, _, _>(what, policy, || {
        let probe = check();
        async move {
            if probe.await {
                Check::Ready
            } else {
                Check::Pending
            }
        }
    })
    .await;

    match result {
        Ok(attempts) => Ok(attempts),
        Err(PollError::Timeout(timeout)) => Err(timeout),
        Err(PollError::Aborted { error, .. }) => match error {},
    }
}
