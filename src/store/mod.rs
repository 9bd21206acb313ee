//! Persistence for step-mode workflows.

pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pipeline::phase::PhaseId;
use crate::pipeline::state::{PhaseRecord, TokenUsage, WorkflowRecord, WorkflowStatus};

pub use sqlite::{BridgeDb, SqliteStore};

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 100;

/// Which workflows `list_workflows` returns, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub offset: usize,
    /// Clamped to `1..=MAX_LIST_LIMIT`
    pub limit: usize,
}

impl Default for WorkflowFilter {
    fn default() -> Self {
        Self {
            status: None,
            offset: 0,
            limit: DEFAULT_LIST_LIMIT,
        }
    }
}

impl WorkflowFilter {
    pub fn with_status(mut self, status: WorkflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_LIST_LIMIT)
    }
}

/// One row of a workflow listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowListing {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub patient_id: Option<String>,
    pub current_phase: Option<PhaseId>,
    pub total_tokens: TokenUsage,
    pub created_at: DateTime<Utc>,
}

/// Point reads and writes over workflows and their phase records.
///
/// `update_workflow` writes workflow-level fields only (status, current
/// phase, timestamps, token totals). Phase records are written with
/// `update_phase`, or with the guarded `try_start_phase`, `edit_phase`
/// and `approve_phase`, which only touch the row while it is in the
/// expected state and report whether they did.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persist a new workflow together with all of its phase records.
    async fn insert_workflow(&self, workflow: &WorkflowRecord) -> Result<()>;

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>>;

    async fn update_workflow(&self, workflow: &WorkflowRecord) -> Result<()>;

    async fn list_workflows(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowListing>>;

    /// Remove a workflow and its phase records. False when it did not exist.
    async fn delete_workflow(&self, workflow_id: &str) -> Result<bool>;

    async fn get_phase(&self, workflow_id: &str, phase: PhaseId) -> Result<Option<PhaseRecord>>;

    async fn update_phase(&self, workflow_id: &str, record: &PhaseRecord) -> Result<()>;

    /// Move `record.phase` to Running with `record.started_at`, but only if it
    /// is the workflow's current phase and is Pending or Failed. False when
    /// another caller already claimed it.
    async fn try_start_phase(&self, workflow_id: &str, record: &PhaseRecord) -> Result<bool>;

    /// Store reviewer-edited content on a Completed phase. False when the
    /// phase is not Completed.
    async fn edit_phase(
        &self,
        workflow_id: &str,
        phase: PhaseId,
        content: &str,
        reviewer: Option<&str>,
        reviewed_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Stamp the review on a Completed phase and write `workflow`'s
    /// status, pointer and completion time, in one transaction. Only
    /// applies while `phase` is Completed and still the stored current
    /// phase. A missing `reviewer` keeps the stored one.
    async fn approve_phase(
        &self,
        workflow: &WorkflowRecord,
        phase: PhaseId,
        reviewer: Option<&str>,
        reviewed_at: DateTime<Utc>,
    ) -> Result<bool>;
}
