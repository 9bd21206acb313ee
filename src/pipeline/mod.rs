//! Clinical note pipeline: phase graph, records, retry, and coordination.

pub mod coordinator;
pub mod phase;
pub mod retry;
pub mod state;

pub use coordinator::{PipelineCoordinator, ProcessRequest, StepOutcome, StepRequest};
pub use phase::{PHASE_ORDER, PhaseId, PhasePolicy, next_phase, next_phase_name};
pub use retry::{RetryPolicy, execute_phase, run_with_retry};
pub use state::{
    PhaseRecord, PhaseStatus, TokenUsage, WorkflowInput, WorkflowRecord, WorkflowStatus,
    WorkflowSummary,
};
