//! Workflow and phase records.
//!
//! A `WorkflowRecord` exclusively owns one `PhaseRecord` per graph phase.
//! Phase status changes go through the `mark_*` methods, which reject
//! transitions the state machine does not allow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::StateError;
use crate::pipeline::phase::{PHASE_ORDER, PhaseId};

/// Status of a single pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Allowed moves: Pending→Running, Pending→Skipped, Running→{Completed, Failed, Skipped},
    /// and Failed→Running when a human resubmits the phase.
    pub fn can_transition_to(self, next: PhaseStatus) -> bool {
        use PhaseStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Failed, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Skipped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

/// Status of a whole workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    NeedsReview,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::NeedsReview => "needs_review",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "needs_review" => Ok(Self::NeedsReview),
            _ => Err(format!("Invalid workflow status: {}", s)),
        }
    }
}

/// Token counts reported by the text-generation provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage::new(
            self.input_tokens + rhs.input_tokens,
            self.output_tokens + rhs.output_tokens,
        )
    }
}

impl std::iter::Sum for TokenUsage {
    fn sum<I: Iterator<Item = TokenUsage>>(iter: I) -> Self {
        iter.fold(TokenUsage::default(), |acc, u| acc + u)
    }
}

/// Execution state of one phase within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: PhaseId,
    pub status: PhaseStatus,
    /// Original agent output
    #[serde(default)]
    pub content: String,
    /// Human-edited replacement for `content`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
}

impl PhaseRecord {
    pub fn new(phase: PhaseId) -> Self {
        Self {
            phase,
            status: PhaseStatus::Pending,
            content: String::new(),
            edited_content: None,
            error: None,
            usage: TokenUsage::default(),
            started_at: None,
            completed_at: None,
            reviewed_at: None,
            reviewed_by: None,
        }
    }

    fn transition(&mut self, to: PhaseStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                phase: self.phase,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Start an execution attempt. Clears the outcome of any previous attempt.
    pub fn mark_running(&mut self) -> Result<(), StateError> {
        self.transition(PhaseStatus::Running)?;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.error = None;
        Ok(())
    }

    pub fn mark_completed(&mut self, content: String, usage: TokenUsage) -> Result<(), StateError> {
        self.transition(PhaseStatus::Completed)?;
        self.content = content;
        self.usage = usage;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), StateError> {
        self.transition(PhaseStatus::Failed)?;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_skipped(&mut self) -> Result<(), StateError> {
        self.transition(PhaseStatus::Skipped)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Content handed to later phases: the human edit when present.
    pub fn effective_content(&self) -> &str {
        self.edited_content.as_deref().unwrap_or(&self.content)
    }

    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.completed_at?);
        (end - start).to_std().ok()
    }
}

/// Caller-supplied inputs shared by both execution modes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub raw_input: String,
    pub patient_id: Option<String>,
    pub payer: Option<String>,
    pub procedure: Option<String>,
    #[serde(default)]
    pub skip_prior_auth: bool,
}

impl WorkflowInput {
    pub fn new(raw_input: impl Into<String>) -> Self {
        Self {
            raw_input: raw_input.into(),
            ..Default::default()
        }
    }

    pub fn with_patient_id(mut self, patient_id: impl Into<String>) -> Self {
        self.patient_id = Some(patient_id.into());
        self
    }

    pub fn with_payer(mut self, payer: impl Into<String>) -> Self {
        self.payer = Some(payer.into());
        self
    }

    pub fn with_procedure(mut self, procedure: impl Into<String>) -> Self {
        self.procedure = Some(procedure.into());
        self
    }

    pub fn skipping_prior_auth(mut self) -> Self {
        self.skip_prior_auth = true;
        self
    }
}

/// One clinical note moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    #[serde(flatten)]
    pub input: WorkflowInput,
    /// Phase awaiting execution or approval (step mode only)
    pub current_phase: Option<PhaseId>,
    pub phases: [PhaseRecord; 5],
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRecord {
    /// Fresh workflow with every phase pending.
    pub fn new(input: WorkflowInput) -> Self {
        Self {
            workflow_id: uuid::Uuid::new_v4().to_string(),
            status: WorkflowStatus::Pending,
            input,
            current_phase: None,
            phases: PHASE_ORDER.map(PhaseRecord::new),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Fresh step-mode workflow pointing at the first phase.
    pub fn new_step_mode(input: WorkflowInput) -> Self {
        Self {
            current_phase: Some(PhaseId::first()),
            ..Self::new(input)
        }
    }

    pub fn phase(&self, phase: PhaseId) -> &PhaseRecord {
        &self.phases[phase.index()]
    }

    pub fn phase_mut(&mut self, phase: PhaseId) -> &mut PhaseRecord {
        &mut self.phases[phase.index()]
    }

    pub fn start(&mut self) {
        self.status = WorkflowStatus::InProgress;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn complete(&mut self) {
        self.status = WorkflowStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self) {
        self.status = WorkflowStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    /// Output exists but has not been verified.
    pub fn flag_for_review(&mut self) {
        self.status = WorkflowStatus::NeedsReview;
        self.completed_at = Some(Utc::now());
    }

    pub fn total_usage(&self) -> TokenUsage {
        self.phases.iter().map(|p| p.usage).sum()
    }

    pub fn total_duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.completed_at?);
        (end - start).to_std().ok()
    }

    pub fn completed_phases(&self) -> impl Iterator<Item = &PhaseRecord> {
        self.phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Completed)
    }

    /// First error in phase order, verbatim.
    pub fn first_error(&self) -> Option<&str> {
        self.phases.iter().find_map(|p| p.error.as_deref())
    }

    /// Outputs of all completed phases, preferring human edits.
    pub fn prior_outputs(&self) -> BTreeMap<PhaseId, String> {
        self.completed_phases()
            .map(|p| (p.phase, p.effective_content().to_string()))
            .collect()
    }

    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            total_duration_ms: self.total_duration().map(|d| d.as_millis() as u64),
            total_tokens: self.total_usage(),
            phases: self
                .phases
                .iter()
                .map(|p| {
                    (
                        p.phase,
                        PhaseSummary {
                            status: p.status,
                            duration_ms: p.duration().map(|d| d.as_millis() as u64),
                            has_error: p.error.is_some(),
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Serializable digest of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub total_duration_ms: Option<u64>,
    pub total_tokens: TokenUsage,
    pub phases: BTreeMap<PhaseId, PhaseSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub status: PhaseStatus,
    pub duration_ms: Option<u64>,
    pub has_error: bool,
}
