//! Typed error hierarchy for the clinical bridge.
//!
//! Two top-level enums cover the two stateful subsystems:
//! - `StateError`: illegal phase status transitions on a record
//! - `SessionError`: human-in-the-loop run/edit/approve failures
//!
//! Agent faults and store I/O travel as `anyhow::Error`. Agent-reported
//! failures are ordinary values (`AgentOutcome::Failed`), not errors.

use thiserror::Error;

use crate::pipeline::phase::PhaseId;
use crate::pipeline::state::PhaseStatus;

/// Errors raised by the phase state machine.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Phase {phase} cannot move from {from} to {to}")]
    InvalidTransition {
        phase: PhaseId,
        from: PhaseStatus,
        to: PhaseStatus,
    },
}

/// Errors from the human-in-the-loop session layer.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Workflow {id} not found")]
    WorkflowNotFound { id: String },

    #[error("Phase {phase} not found for workflow {id}")]
    PhaseNotFound { id: String, phase: PhaseId },

    #[error("Invalid phase: {0}")]
    UnknownPhase(String),

    #[error("Current phase is '{current}', not '{requested}'")]
    NotCurrentPhase { current: String, requested: PhaseId },

    #[error("Phase {0} is already running")]
    PhaseAlreadyRunning(PhaseId),

    #[error("Phase {0} is already completed")]
    PhaseAlreadyCompleted(PhaseId),

    #[error("Phase {0} is already queued")]
    PhaseAlreadyQueued(PhaseId),

    #[error("Phase {phase} was not started: {reason}")]
    PhaseNotStarted { phase: PhaseId, reason: String },

    #[error("Workflow {id} has a phase in progress")]
    WorkflowBusy { id: String },

    #[error("Phase {phase} must be completed before {action}")]
    PhaseNotCompleted { phase: PhaseId, action: &'static str },

    #[error("Workflow {0} has no phase awaiting execution")]
    WorkflowFinished(String),

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    State(#[from] StateError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_error_carries_both_statuses() {
        let err = StateError::InvalidTransition {
            phase: PhaseId::Coding,
            from: PhaseStatus::Completed,
            to: PhaseStatus::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains("coding"));
        assert!(msg.contains("completed"));
        assert!(msg.contains("running"));
    }

    #[test]
    fn not_current_phase_message_names_both_phases() {
        let err = SessionError::NotCurrentPhase {
            current: "documentation".to_string(),
            requested: PhaseId::Compliance,
        };
        assert_eq!(
            err.to_string(),
            "Current phase is 'documentation', not 'compliance'"
        );
    }

    #[test]
    fn session_error_converts_from_state_error() {
        let inner = StateError::InvalidTransition {
            phase: PhaseId::PriorAuth,
            from: PhaseStatus::Pending,
            to: PhaseStatus::Completed,
        };
        let err: SessionError = inner.into();
        assert!(matches!(
            err,
            SessionError::State(StateError::InvalidTransition {
                phase: PhaseId::PriorAuth,
                ..
            })
        ));
    }

    #[test]
    fn busy_workflow_message_names_workflow() {
        let err = SessionError::WorkflowBusy { id: "wf-1".into() };
        assert_eq!(err.to_string(), "Workflow wf-1 has a phase in progress");
    }

    #[test]
    fn store_error_keeps_source_message() {
        let err = SessionError::Store(anyhow::anyhow!("disk full"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&SessionError::UnknownPhase("x".into()));
        assert_std_error(&StateError::InvalidTransition {
            phase: PhaseId::Documentation,
            from: PhaseStatus::Skipped,
            to: PhaseStatus::Running,
        });
    }
}
