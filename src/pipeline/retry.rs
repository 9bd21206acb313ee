//! Retry with exponential backoff, and the phase execution wrapper.

use std::future::Future;
use std::time::Duration;

use crate::agent::AgentOutcome;
use crate::config::RetryConfig;
use crate::errors::StateError;
use crate::pipeline::state::PhaseRecord;

/// How many times a failed agent call is re-attempted, and how long to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Wait before retry number `attempt + 1`: `base_delay * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Run `op` until it completes, faults, or exhausts the policy.
///
/// A fault (`Err`) propagates at once. A failure outcome is retried after
/// `policy.delay_for(attempt)`; once retries are exhausted the last failure
/// is returned.
pub async fn run_with_retry<F, Fut>(
    policy: &RetryPolicy,
    agent: &str,
    mut op: F,
) -> anyhow::Result<AgentOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<AgentOutcome>>,
{
    let mut attempt = 0u32;
    loop {
        let error = match op().await? {
            outcome @ AgentOutcome::Completed { .. } => return Ok(outcome),
            AgentOutcome::Failed { error } => error,
        };

        if attempt >= policy.max_retries {
            tracing::error!(
                agent,
                attempts = attempt + 1,
                error = %error,
                "agent retries exhausted"
            );
            return Ok(AgentOutcome::Failed { error });
        }

        let delay = policy.delay_for(attempt);
        tracing::warn!(
            agent,
            attempt = attempt + 1,
            max_retries = policy.max_retries,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "agent failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Run one phase attempt against its record.
///
/// The record moves to Running, then to Completed or Failed according to
/// the outcome. A fault is recorded as `"Unexpected error: <fault>"` and
/// returned as `Err` so callers can tell a crash from a graceful failure.
/// `Err` is also returned when the record cannot legally start.
pub async fn execute_phase<F, Fut>(
    record: &mut PhaseRecord,
    policy: Option<&RetryPolicy>,
    mut op: F,
) -> anyhow::Result<AgentOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<AgentOutcome>>,
{
    record.mark_running()?;
    let agent = record.phase.agent_name();
    tracing::info!(phase = %record.phase, agent, "phase started");

    let result = match policy {
        Some(policy) => run_with_retry(policy, agent, &mut op).await,
        None => op().await,
    };

    match result {
        Ok(outcome) => {
            apply_outcome(record, &outcome)?;
            match &outcome {
                AgentOutcome::Completed { usage, .. } => tracing::info!(
                    phase = %record.phase,
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "phase completed"
                ),
                AgentOutcome::Failed { error } => {
                    tracing::warn!(phase = %record.phase, %error, "phase failed")
                }
            }
            Ok(outcome)
        }
        Err(fault) => {
            record.mark_failed(format!("Unexpected error: {}", fault))?;
            tracing::error!(phase = %record.phase, error = %fault, "phase faulted");
            Err(fault)
        }
    }
}

fn apply_outcome(record: &mut PhaseRecord, outcome: &AgentOutcome) -> Result<(), StateError> {
    match outcome {
        AgentOutcome::Completed { content, usage } => {
            record.mark_completed(content.clone(), *usage)
        }
        AgentOutcome::Failed { error } => record.mark_failed(error.clone()),
    }
}
