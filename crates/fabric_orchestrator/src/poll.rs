//! Bounded polling and retrying of remote calls.
//!
//! Every wait in the orchestrators (orderer readiness, join confirmation,
//! install confirmation, approval and commit acceptance, anchor confirmation)
//! goes through [`poll_until`]. Single remote calls go through [`query`] and
//! [`submit`], which bound each attempt with the caller's [`CallPolicy`].

use crate::error::{CallContext, GatewayError, GatewayResult, OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff with a cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// First delay
    pub initial: Duration,
    /// Delays never exceed this
    pub max: Duration,
    /// Each delay is the previous one times this
    pub multiplier: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(5),
            multiplier: 2,
        }
    }
}

impl Backoff {
    /// Construct a backoff
    pub const fn new(initial: Duration, max: Duration, multiplier: u32) -> Self {
        Self {
            initial,
            max,
            multiplier,
        }
    }

    /// The endless sequence of delays
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let max = self.max;
        let multiplier = self.multiplier.max(1);
        std::iter::successors(Some(self.initial.min(max)), move |d| {
            Some(d.saturating_mul(multiplier).min(max))
        })
    }
}

/// What one poll check saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation<T> {
    /// The condition holds
    Ready(T),
    /// Not yet, with a reason for the logs
    Pending(String),
}

/// Errors that may go away by themselves.
pub trait Transient {
    /// Should the poll keep going after this error
    fn is_transient(&self) -> bool;
}

impl Transient for GatewayError {
    fn is_transient(&self) -> bool {
        GatewayError::is_transient(self)
    }
}

impl Transient for OrchestratorError {
    fn is_transient(&self) -> bool {
        matches!(self.kind(), crate::error::ErrorKind::Transient)
    }
}

/// Why a poll gave up.
#[derive(Debug, thiserror::Error)]
pub enum PollError<E: std::fmt::Debug + Display> {
    /// The condition never held within the timeout
    #[error("timed out after {attempts} attempt(s) over {elapsed:?}; last: {}", last.as_deref().unwrap_or("nothing observed"))]
    TimedOut {
        /// Checks made
        attempts: u32,
        /// Time spent
        elapsed: Duration,
        /// Last pending reason or transient error
        last: Option<String>,
    },
    /// The check failed in a way that will not go away
    #[error("{0}")]
    Fatal(E),
}

/// Call `check` until it reports [`Observation::Ready`], a fatal error, or `timeout`
/// elapses. Transient errors count as "not yet".
///
/// Each check is itself bounded by the time left, and the sleep between checks
/// follows `backoff`, cut short at the deadline.
pub async fn poll_until<T, E, F, Fut>(
    what: &str,
    timeout: Duration,
    backoff: &Backoff,
    mut check: F,
) -> Result<T, PollError<E>>
where
    E: Transient + std::fmt::Debug + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Observation<T>, E>>,
{
    let started = Instant::now();
    let deadline = started + timeout;
    let mut delays = backoff.delays();
    let mut attempts = 0;
    let mut last = None;
    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, check()).await {
            Ok(Ok(Observation::Ready(value))) => {
                tracing::debug!(what, attempts, elapsed = ?started.elapsed(), "condition met");
                return Ok(value);
            }
            Ok(Ok(Observation::Pending(reason))) => last = Some(reason),
            Ok(Err(e)) if e.is_transient() => last = Some(e.to_string()),
            Ok(Err(e)) => return Err(PollError::Fatal(e)),
            Err(_) => last = Some("check did not answer in time".to_string()),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::TimedOut {
                attempts,
                elapsed: now - started,
                last,
            });
        }
        let delay = delays
            .next()
            .unwrap_or(backoff.max)
            .min(deadline - now);
        tracing::trace!(what, attempts, ?delay, last = ?last, "not yet");
        tokio::time::sleep(delay).await;
    }
}

/// Bounds on remote calls: per-call timeout, retry budget and backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPolicy {
    /// Each remote call must answer within this
    pub call_timeout: Duration,
    /// Extra attempts after a transient failure
    pub retries: u32,
    /// Delay between attempts and polls
    pub backoff: Backoff,
    /// How long to wait for a submitted transaction to become visible
    pub confirm_timeout: Duration,
    /// How long to wait for the orderer to come up
    pub ready_timeout: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            retries: 3,
            backoff: Backoff::default(),
            confirm_timeout: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(120),
        }
    }
}

/// Serialized form of [`CallPolicy`] used in the topology file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallPolicyConfig {
    /// Per-call timeout
    pub call_timeout_ms: u64,
    /// Retry budget
    pub retries: u32,
    /// First backoff delay
    pub initial_backoff_ms: u64,
    /// Backoff cap
    pub max_backoff_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: u32,
    /// Confirmation timeout after a submission
    pub confirm_timeout_ms: u64,
    /// Orderer readiness timeout
    pub ready_timeout_ms: u64,
}

impl Default for CallPolicyConfig {
    fn default() -> Self {
        CallPolicy::default().into()
    }
}

impl From<CallPolicy> for CallPolicyConfig {
    fn from(p: CallPolicy) -> Self {
        Self {
            call_timeout_ms: p.call_timeout.as_millis() as u64,
            retries: p.retries,
            initial_backoff_ms: p.backoff.initial.as_millis() as u64,
            max_backoff_ms: p.backoff.max.as_millis() as u64,
            backoff_multiplier: p.backoff.multiplier,
            confirm_timeout_ms: p.confirm_timeout.as_millis() as u64,
            ready_timeout_ms: p.ready_timeout.as_millis() as u64,
        }
    }
}

impl From<&CallPolicyConfig> for CallPolicy {
    fn from(c: &CallPolicyConfig) -> Self {
        Self {
            call_timeout: Duration::from_millis(c.call_timeout_ms),
            retries: c.retries,
            backoff: Backoff::new(
                Duration::from_millis(c.initial_backoff_ms),
                Duration::from_millis(c.max_backoff_ms),
                c.backoff_multiplier,
            ),
            confirm_timeout: Duration::from_millis(c.confirm_timeout_ms),
            ready_timeout: Duration::from_millis(c.ready_timeout_ms),
        }
    }
}

/// Run a read-only remote call, retrying transient failures and timeouts
/// within the policy's budget.
pub async fn query<T, F, Fut>(
    policy: &CallPolicy,
    context: &CallContext,
    op: F,
) -> OrchestratorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    call(policy, context, op, true).await
}

/// Submit a transaction.
///
/// Only failures to reach the endpoint are retried. A submission that timed
/// out may still have been ordered, so it is reported as unavailable and the
/// next run finds out from the ledger whether it landed.
pub async fn submit<T, F, Fut>(
    policy: &CallPolicy,
    context: &CallContext,
    op: F,
) -> OrchestratorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    call(policy, context, op, false).await
}

async fn call<T, F, Fut>(
    policy: &CallPolicy,
    context: &CallContext,
    mut op: F,
    retry_timeouts: bool,
) -> OrchestratorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let started = Instant::now();
    let mut delays = policy.backoff.delays();
    let mut attempts = 0;
    loop {
        attempts += 1;
        let last = match tokio::time::timeout(policy.call_timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if e.is_transient() => e.to_string(),
            Ok(Err(e)) => {
                tracing::warn!(%context, error = %e, "call failed");
                return Err(OrchestratorError::from_gateway(context.clone(), e));
            }
            Err(_) => {
                let last = format!("no answer within {:?}", policy.call_timeout);
                if !retry_timeouts {
                    return Err(OrchestratorError::TransientUnavailable {
                        context: context.clone(),
                        attempts,
                        elapsed: started.elapsed(),
                        last,
                    });
                }
                last
            }
        };
        if attempts > policy.retries {
            tracing::warn!(%context, attempts, %last, "retry budget exhausted");
            return Err(OrchestratorError::TransientUnavailable {
                context: context.clone(),
                attempts,
                elapsed: started.elapsed(),
                last,
            });
        }
        let delay = delays.next().unwrap_or(policy.backoff.max);
        tracing::debug!(%context, attempts, ?delay, %last, "retrying");
        tokio::time::sleep(delay).await;
    }
}

/// Turn a failed confirmation poll into an orchestrator error for `context`.
pub(crate) fn confirm_error(context: &CallContext, e: PollError<OrchestratorError>) -> OrchestratorError {
    match e {
        PollError::Fatal(e) => e,
        PollError::TimedOut {
            attempts,
            elapsed,
            last,
        } => OrchestratorError::TransientUnavailable {
            context: context.clone(),
            attempts,
            elapsed,
            last: last.unwrap_or_else(|| "not confirmed".to_string()),
        },
    }
}
