//! Pipeline coordinator.
//!
//! Two entry points share one agent and one retry policy:
//! - `process` runs every phase of a new workflow in order (full mode)
//! - `run_single_phase` runs one phase statelessly for the review session (step mode)

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::{AgentOutcome, PhaseAgent, PhaseInputs, PhaseRequest};
use crate::pipeline::phase::{PHASE_ORDER, PhaseId, PhasePolicy, is_present, prior_auth_applies};
use crate::pipeline::retry::{RetryPolicy, execute_phase};
use crate::pipeline::state::{TokenUsage, WorkflowInput, WorkflowRecord};

/// Full-mode request.
#[derive(Debug, Clone, Default)]
pub struct ProcessRequest {
    pub input: WorkflowInput,
    /// Caller context; `patient_id` and `payer` are layered on top
    pub context: BTreeMap<String, String>,
}

impl ProcessRequest {
    pub fn new(input: WorkflowInput) -> Self {
        Self {
            input,
            context: BTreeMap::new(),
        }
    }
}

/// Step-mode request for a single phase.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub phase: PhaseId,
    pub raw_input: String,
    /// Content of completed phases, human edits already applied
    pub prior_outputs: BTreeMap<PhaseId, String>,
    pub patient_id: Option<String>,
    pub payer: Option<String>,
    pub procedure: Option<String>,
    pub context: BTreeMap<String, String>,
}

impl StepRequest {
    /// Step request for `phase` of an existing workflow.
    pub fn for_workflow(workflow: &WorkflowRecord, phase: PhaseId) -> Self {
        Self {
            phase,
            raw_input: workflow.input.raw_input.clone(),
            prior_outputs: workflow.prior_outputs(),
            patient_id: workflow.input.patient_id.clone(),
            payer: workflow.input.payer.clone(),
            procedure: workflow.input.procedure.clone(),
            context: BTreeMap::new(),
        }
    }

    fn output(&self, phase: PhaseId) -> Option<&str> {
        self.prior_outputs
            .get(&phase)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Result of a step-mode run that did not fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed {
        content: String,
        usage: TokenUsage,
        duration: Duration,
    },
    Failed {
        error: String,
        agent: &'static str,
        duration: Duration,
    },
}

impl StepOutcome {
    pub fn duration(&self) -> Duration {
        match self {
            Self::Completed { duration, .. } | Self::Failed { duration, .. } => *duration,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Context handed to every phase: caller extras with non-empty
/// `patient_id` and `payer` layered on top.
pub fn build_context(
    patient_id: Option<&str>,
    payer: Option<&str>,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut context = extra.clone();
    if let Some(id) = patient_id.filter(|v| !v.is_empty()) {
        context.insert("patient_id".to_string(), id.to_string());
    }
    if let Some(payer) = payer.filter(|v| !v.is_empty()) {
        context.insert("payer".to_string(), payer.to_string());
    }
    context
}

pub struct PipelineCoordinator {
    agent: Arc<dyn PhaseAgent>,
    retry: RetryPolicy,
}

impl PipelineCoordinator {
    pub fn new(agent: Arc<dyn PhaseAgent>, retry: RetryPolicy) -> Self {
        Self { agent, retry }
    }

    /// Run a new workflow through every phase.
    ///
    /// Never returns an error: faults and fatal failures are recorded on the
    /// returned workflow, with the phases after the stopping point left Pending.
    pub async fn process(&self, request: ProcessRequest) -> WorkflowRecord {
        let ProcessRequest { input, context } = request;
        let mut workflow = WorkflowRecord::new(input);
        workflow.start();

        let workflow_id = workflow.workflow_id.clone();
        let context = build_context(
            workflow.input.patient_id.as_deref(),
            workflow.input.payer.as_deref(),
            &context,
        );
        tracing::info!(
            %workflow_id,
            note_length = workflow.input.raw_input.len(),
            "workflow started"
        );

        let mut degraded = false;
        for phase in PHASE_ORDER {
            if phase == PhaseId::PriorAuth
                && !prior_auth_applies(
                    workflow.input.skip_prior_auth,
                    workflow.input.payer.as_deref(),
                    workflow.input.procedure.as_deref(),
                )
            {
                if let Err(e) = workflow.phase_mut(phase).mark_skipped() {
                    tracing::error!(%workflow_id, %phase, error = %e, "could not skip phase");
                }
                tracing::info!(%workflow_id, %phase, "phase skipped");
                continue;
            }

            let request = PhaseRequest::new(full_mode_inputs(&workflow, phase), context.clone());
            let agent = &self.agent;
            let result = execute_phase(workflow.phase_mut(phase), Some(&self.retry), || {
                agent.generate(&request)
            })
            .await;

            match result {
                Ok(AgentOutcome::Completed { .. }) => {}
                Ok(AgentOutcome::Failed { error }) => match phase.policy() {
                    PhasePolicy::Fatal => {
                        tracing::error!(%workflow_id, %phase, %error, "fatal phase failed");
                        workflow.fail();
                        return workflow;
                    }
                    PhasePolicy::NonFatal | PhasePolicy::ConditionalSkip => {
                        tracing::warn!(%workflow_id, %phase, %error, "non-fatal phase failed");
                    }
                    PhasePolicy::Degrade => {
                        tracing::warn!(%workflow_id, %phase, %error, "output needs review");
                        degraded = true;
                    }
                },
                Err(fault) => {
                    tracing::error!(%workflow_id, %phase, error = %fault, "workflow faulted");
                    workflow.fail();
                    return workflow;
                }
            }
        }

        if degraded {
            workflow.flag_for_review();
        } else {
            workflow.complete();
        }

        let usage = workflow.total_usage();
        tracing::info!(
            %workflow_id,
            status = %workflow.status,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "workflow finished"
        );
        workflow
    }

    /// Run one phase from caller-supplied prior outputs.
    ///
    /// Missing prerequisites fail fast without an agent call. The agent is
    /// called once, without retry. Only agent faults are returned as `Err`.
    pub async fn run_single_phase(&self, request: &StepRequest) -> anyhow::Result<StepOutcome> {
        let phase = request.phase;
        let agent = phase.agent_name();

        let inputs = match step_inputs(request) {
            Ok(inputs) => inputs,
            Err(error) => {
                tracing::warn!(%phase, error, "phase prerequisites missing");
                return Ok(StepOutcome::Failed {
                    error: error.to_string(),
                    agent,
                    duration: Duration::ZERO,
                });
            }
        };

        let context = build_context(
            request.patient_id.as_deref(),
            request.payer.as_deref(),
            &request.context,
        );
        tracing::info!(
            %phase,
            available = request.prior_outputs.len(),
            "single phase started"
        );

        let started = tokio::time::Instant::now();
        let result = self.agent.generate(&PhaseRequest::new(inputs, context)).await;
        let duration = started.elapsed();

        match result {
            Ok(AgentOutcome::Completed { content, usage }) => {
                tracing::info!(
                    %phase,
                    duration_ms = duration.as_millis() as u64,
                    "single phase completed"
                );
                Ok(StepOutcome::Completed {
                    content,
                    usage,
                    duration,
                })
            }
            Ok(AgentOutcome::Failed { error }) => {
                tracing::warn!(%phase, %error, "single phase failed");
                Ok(StepOutcome::Failed {
                    error,
                    agent,
                    duration,
                })
            }
            Err(fault) => {
                tracing::error!(%phase, error = %fault, "single phase faulted");
                Err(fault)
            }
        }
    }
}

/// Inputs for `phase` from the outputs already on the workflow.
fn full_mode_inputs(workflow: &WorkflowRecord, phase: PhaseId) -> PhaseInputs {
    let content = |p: PhaseId| workflow.phase(p).effective_content().to_string();
    let input = &workflow.input;
    match phase {
        PhaseId::Documentation => PhaseInputs::Documentation {
            raw_note: input.raw_input.clone(),
        },
        PhaseId::Coding => PhaseInputs::Coding {
            documentation: content(PhaseId::Documentation),
        },
        PhaseId::Compliance => PhaseInputs::Compliance {
            documentation: content(PhaseId::Documentation),
            coding: content(PhaseId::Coding),
        },
        PhaseId::PriorAuth => PhaseInputs::PriorAuth {
            procedure: input.procedure.clone().unwrap_or_default(),
            payer: input.payer.clone().unwrap_or_default(),
            documentation: content(PhaseId::Documentation),
        },
        PhaseId::QualityAssurance => PhaseInputs::QualityAssurance {
            raw_note: input.raw_input.clone(),
            documentation: content(PhaseId::Documentation),
            coding: content(PhaseId::Coding),
            compliance: content(PhaseId::Compliance),
        },
    }
}

/// Inputs for a step-mode run, or the precondition message.
fn step_inputs(request: &StepRequest) -> Result<PhaseInputs, &'static str> {
    let documentation = request.output(PhaseId::Documentation);
    let coding = request.output(PhaseId::Coding);

    match request.phase {
        PhaseId::Documentation => Ok(PhaseInputs::Documentation {
            raw_note: request.raw_input.clone(),
        }),
        PhaseId::Coding => match documentation {
            Some(doc) => Ok(PhaseInputs::Coding {
                documentation: doc.to_string(),
            }),
            None => Err("Documentation phase must be completed first"),
        },
        PhaseId::Compliance => match (documentation, coding) {
            (Some(doc), Some(codes)) => Ok(PhaseInputs::Compliance {
                documentation: doc.to_string(),
                coding: codes.to_string(),
            }),
            _ => Err("Documentation and Coding phases must be completed first"),
        },
        PhaseId::PriorAuth => match (documentation, &request.payer, &request.procedure) {
            (Some(doc), Some(payer), Some(procedure))
                if is_present(Some(payer.as_str())) && is_present(Some(procedure.as_str())) =>
            {
                Ok(PhaseInputs::PriorAuth {
                    procedure: procedure.clone(),
                    payer: payer.clone(),
                    documentation: doc.to_string(),
                })
            }
            _ => Err("Documentation, payer, and procedure are required"),
        },
        PhaseId::QualityAssurance => match (documentation, coding) {
            (Some(doc), Some(codes)) => Ok(PhaseInputs::QualityAssurance {
                raw_note: request.raw_input.clone(),
                documentation: doc.to_string(),
                coding: codes.to_string(),
                compliance: request
                    .output(PhaseId::Compliance)
                    .unwrap_or_default()
                    .to_string(),
            }),
            _ => Err("Prior phases must be completed first"),
        },
    }
}
