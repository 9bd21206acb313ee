//! Human-in-the-loop review session.
//!
//! A reviewer runs one phase at a time, may edit its output, and approves it
//! to advance the workflow. Phase runs are queued on a single background
//! worker per workflow; callers poll the store or subscribe to
//! `SessionEvent`s to learn the outcome.
//!
//! Several sessions (one per CLI invocation) may share a store file. A
//! worker only executes a phase after claiming it in the store with
//! `try_start_phase`; a job whose claim fails ends with `PhaseDropped`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, mpsc};

use crate::errors::SessionError;
use crate::pipeline::coordinator::{PipelineCoordinator, StepOutcome, StepRequest};
use crate::pipeline::phase::{PhaseId, next_phase};
use crate::pipeline::state::{
    PhaseRecord, PhaseStatus, TokenUsage, WorkflowInput, WorkflowRecord, WorkflowStatus,
};
use crate::store::{WorkflowFilter, WorkflowListing, WorkflowStore};

const EVENT_CAPACITY: usize = 256;

/// Progress notifications for subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionEvent {
    PhaseQueued {
        workflow_id: String,
        phase: PhaseId,
    },
    PhaseStarted {
        workflow_id: String,
        phase: PhaseId,
    },
    PhaseCompleted {
        workflow_id: String,
        phase: PhaseId,
        usage: TokenUsage,
    },
    PhaseFailed {
        workflow_id: String,
        phase: PhaseId,
        error: String,
    },
    /// The job ended without executing, leaving the phase untouched.
    PhaseDropped {
        workflow_id: String,
        phase: PhaseId,
        reason: String,
    },
    PhaseEdited {
        workflow_id: String,
        phase: PhaseId,
    },
    PhaseApproved {
        workflow_id: String,
        phase: PhaseId,
        next_phase: Option<PhaseId>,
    },
}

impl SessionEvent {
    fn concerns(&self, id: &str, target: PhaseId) -> bool {
        match self {
            Self::PhaseQueued { workflow_id, phase }
            | Self::PhaseStarted { workflow_id, phase }
            | Self::PhaseCompleted {
                workflow_id, phase, ..
            }
            | Self::PhaseFailed {
                workflow_id, phase, ..
            }
            | Self::PhaseDropped {
                workflow_id, phase, ..
            }
            | Self::PhaseEdited { workflow_id, phase }
            | Self::PhaseApproved {
                workflow_id, phase, ..
            } => workflow_id == id && *phase == target,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PhaseCompleted { .. } | Self::PhaseFailed { .. } | Self::PhaseDropped { .. }
        )
    }
}

/// How a waited-on job ended, as far as the waiter could observe.
enum JobEnd {
    Executed,
    Dropped(String),
    Unobserved,
}

/// Outcome of trying to claim a queued phase.
enum Claim {
    Started(WorkflowRecord),
    Dropped(String),
}

/// Acknowledgement returned when a phase run is queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunAck {
    pub workflow_id: String,
    pub phase: PhaseId,
    pub message: String,
}

/// Result of approving a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Approval {
    pub phase: PhaseId,
    pub next_phase: Option<PhaseId>,
    pub workflow_status: WorkflowStatus,
}

/// Per-workflow queue state. `pending` holds phases that are queued or executing.
struct WorkerSlot {
    tx: mpsc::UnboundedSender<PhaseId>,
    pending: HashSet<PhaseId>,
}

#[derive(Clone)]
pub struct ReviewSession {
    store: Arc<dyn WorkflowStore>,
    coordinator: Arc<PipelineCoordinator>,
    workers: Arc<Mutex<HashMap<String, WorkerSlot>>>,
    events: broadcast::Sender<SessionEvent>,
}

/// Parse a phase name supplied by a caller.
pub fn parse_phase(name: &str) -> Result<PhaseId, SessionError> {
    name.parse::<PhaseId>()
        .map_err(|_| SessionError::UnknownPhase(name.to_string()))
}

impl ReviewSession {
    pub fn new(store: Arc<dyn WorkflowStore>, coordinator: Arc<PipelineCoordinator>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            coordinator,
            workers: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event); // no receivers is fine
    }

    /// Persist a new step-mode workflow waiting on its first phase.
    pub async fn create_workflow(
        &self,
        input: WorkflowInput,
    ) -> Result<WorkflowRecord, SessionError> {
        let workflow = WorkflowRecord::new_step_mode(input);
        self.store
            .insert_workflow(&workflow)
            .await
            .map_err(SessionError::Store)?;
        tracing::info!(workflow_id = %workflow.workflow_id, "workflow created");
        Ok(workflow)
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowRecord, SessionError> {
        self.store
            .get_workflow(workflow_id)
            .await
            .map_err(SessionError::Store)?
            .ok_or_else(|| SessionError::WorkflowNotFound {
                id: workflow_id.to_string(),
            })
    }

    pub async fn get_phase(
        &self,
        workflow_id: &str,
        phase: PhaseId,
    ) -> Result<PhaseRecord, SessionError> {
        self.store
            .get_phase(workflow_id, phase)
            .await
            .map_err(SessionError::Store)?
            .ok_or_else(|| SessionError::PhaseNotFound {
                id: workflow_id.to_string(),
                phase,
            })
    }

    pub async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowListing>, SessionError> {
        self.store
            .list_workflows(filter)
            .await
            .map_err(SessionError::Store)
    }

    /// Remove a workflow and its phase records.
    ///
    /// Refused while this session has a job queued for it, or while a phase
    /// is stored as Running unless `force` is set.
    pub async fn delete_workflow(
        &self,
        workflow_id: &str,
        force: bool,
    ) -> Result<(), SessionError> {
        let workers = self.workers.lock().await;
        if workers
            .get(workflow_id)
            .is_some_and(|slot| !slot.pending.is_empty())
        {
            return Err(SessionError::WorkflowBusy {
                id: workflow_id.to_string(),
            });
        }

        let workflow = self.get_workflow(workflow_id).await?;
        let running = workflow
            .phases
            .iter()
            .any(|p| p.status == PhaseStatus::Running);
        if running && !force {
            return Err(SessionError::WorkflowBusy {
                id: workflow_id.to_string(),
            });
        }

        let deleted = self
            .store
            .delete_workflow(workflow_id)
            .await
            .map_err(SessionError::Store)?;
        drop(workers);
        if !deleted {
            return Err(SessionError::WorkflowNotFound {
                id: workflow_id.to_string(),
            });
        }

        tracing::info!(%workflow_id, force, "workflow deleted");
        Ok(())
    }

    /// Validate and queue a run of `phase`. Returns once the job is queued.
    pub async fn run_phase(
        &self,
        workflow_id: &str,
        phase: PhaseId,
    ) -> Result<RunAck, SessionError> {
        let mut workers = self.workers.lock().await;

        let workflow = self.get_workflow(workflow_id).await?;
        let current = workflow
            .current_phase
            .ok_or_else(|| SessionError::WorkflowFinished(workflow_id.to_string()))?;
        if current != phase {
            return Err(SessionError::NotCurrentPhase {
                current: current.to_string(),
                requested: phase,
            });
        }
        match workflow.phase(phase).status {
            PhaseStatus::Running => return Err(SessionError::PhaseAlreadyRunning(phase)),
            PhaseStatus::Completed => return Err(SessionError::PhaseAlreadyCompleted(phase)),
            _ => {}
        }

        let slot = workers.entry(workflow_id.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(self.clone().worker(workflow_id.to_string(), rx));
            WorkerSlot {
                tx,
                pending: HashSet::new(),
            }
        });
        if slot.pending.contains(&phase) {
            return Err(SessionError::PhaseAlreadyQueued(phase));
        }
        slot.tx.send(phase).map_err(|_| {
            SessionError::Store(anyhow::anyhow!("worker for {} is gone", workflow_id))
        })?;
        slot.pending.insert(phase);
        tracing::info!(%workflow_id, %phase, "phase queued");
        self.emit(SessionEvent::PhaseQueued {
            workflow_id: workflow_id.to_string(),
            phase,
        });
        drop(workers);

        Ok(RunAck {
            workflow_id: workflow_id.to_string(),
            phase,
            message: format!("Phase '{}' started", phase),
        })
    }

    /// Queue `phase` and wait for the worker to finish it.
    ///
    /// Returns the phase record this run produced. A job that was dropped
    /// (claimed by another session, or overtaken before it started) is an
    /// error, never a record written by someone else.
    pub async fn run_phase_and_wait(
        &self,
        workflow_id: &str,
        phase: PhaseId,
    ) -> Result<PhaseRecord, SessionError> {
        let mut events = self.subscribe();
        self.run_phase(workflow_id, phase).await?;

        let end = loop {
            match events.recv().await {
                Ok(event) if event.concerns(workflow_id, phase) && event.is_terminal() => {
                    break match event {
                        SessionEvent::PhaseDropped { reason, .. } => JobEnd::Dropped(reason),
                        _ => JobEnd::Executed,
                    };
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event receiver lagged");
                    if !self.is_pending(workflow_id, phase).await {
                        break JobEnd::Unobserved;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break JobEnd::Unobserved,
            }
        };

        let record = self.get_phase(workflow_id, phase).await?;
        let reason = match end {
            JobEnd::Executed => return Ok(record),
            JobEnd::Unobserved if record.status.is_terminal() => return Ok(record),
            JobEnd::Dropped(reason) => reason,
            JobEnd::Unobserved => "the job ended without an outcome".to_string(),
        };
        Err(match record.status {
            PhaseStatus::Running => SessionError::PhaseAlreadyRunning(phase),
            PhaseStatus::Completed => SessionError::PhaseAlreadyCompleted(phase),
            _ => SessionError::PhaseNotStarted { phase, reason },
        })
    }

    async fn is_pending(&self, workflow_id: &str, phase: PhaseId) -> bool {
        self.workers
            .lock()
            .await
            .get(workflow_id)
            .is_some_and(|slot| slot.pending.contains(&phase))
    }

    /// Drain the workflow's queue, then retire. Exit is decided under the
    /// dispatcher lock so a concurrent submission is never stranded.
    async fn worker(self, workflow_id: String, mut rx: mpsc::UnboundedReceiver<PhaseId>) {
        loop {
            let phase = {
                let mut workers = self.workers.lock().await;
                match rx.try_recv() {
                    Ok(phase) => phase,
                    Err(_) => {
                        workers.remove(&workflow_id);
                        break;
                    }
                }
            };

            let event = self.execute(&workflow_id, phase).await;

            if let Some(slot) = self.workers.lock().await.get_mut(&workflow_id) {
                slot.pending.remove(&phase);
            }
            self.emit(event);
        }
        tracing::debug!(%workflow_id, "worker retired");
    }

    /// Run one queued job and return the event describing how it ended.
    async fn execute(&self, workflow_id: &str, phase: PhaseId) -> SessionEvent {
        let workflow = match self.claim(workflow_id, phase).await {
            Ok(Claim::Started(workflow)) => workflow,
            Ok(Claim::Dropped(reason)) => {
                tracing::info!(%workflow_id, %phase, %reason, "dropping phase job");
                return SessionEvent::PhaseDropped {
                    workflow_id: workflow_id.to_string(),
                    phase,
                    reason,
                };
            }
            Err(fault) => {
                tracing::error!(%workflow_id, %phase, error = %fault, "could not start phase");
                return SessionEvent::PhaseDropped {
                    workflow_id: workflow_id.to_string(),
                    phase,
                    reason: format!("Unexpected error: {}", fault),
                };
            }
        };

        match self.run_claimed(workflow, phase).await {
            Ok(event) => event,
            Err(fault) => {
                tracing::error!(%workflow_id, %phase, error = %fault, "background phase faulted");
                let message = format!("Unexpected error: {}", fault);
                self.record_fault(workflow_id, phase, &message).await;
                SessionEvent::PhaseFailed {
                    workflow_id: workflow_id.to_string(),
                    phase,
                    error: message,
                }
            }
        }
    }

    /// Re-check the job against the store and move the phase to Running.
    /// Only one caller across all sessions sharing the store gets `Started`;
    /// an error here means nothing was written.
    async fn claim(&self, workflow_id: &str, phase: PhaseId) -> anyhow::Result<Claim> {
        let Some(mut workflow) = self.store.get_workflow(workflow_id).await? else {
            return Ok(Claim::Dropped(format!("Workflow {} not found", workflow_id)));
        };

        let status = workflow.phase(phase).status;
        if matches!(status, PhaseStatus::Running | PhaseStatus::Completed)
            || workflow.current_phase != Some(phase)
        {
            return Ok(Claim::Dropped(format!("Phase {} is {}", phase, status)));
        }

        workflow.phase_mut(phase).mark_running()?;
        if !self
            .store
            .try_start_phase(workflow_id, workflow.phase(phase))
            .await?
        {
            return Ok(Claim::Dropped(format!(
                "Phase {} was started by another session",
                phase
            )));
        }

        Ok(Claim::Started(workflow))
    }

    async fn run_claimed(
        &self,
        mut workflow: WorkflowRecord,
        phase: PhaseId,
    ) -> anyhow::Result<SessionEvent> {
        let workflow_id = workflow.workflow_id.clone();
        workflow.start();
        self.store.update_workflow(&workflow).await?;
        self.emit(SessionEvent::PhaseStarted {
            workflow_id: workflow_id.clone(),
            phase,
        });

        let request = StepRequest::for_workflow(&workflow, phase);
        let outcome = self.coordinator.run_single_phase(&request).await?;
        tracing::info!(
            %workflow_id,
            %phase,
            completed = outcome.is_completed(),
            duration_ms = outcome.duration().as_millis() as u64,
            "phase call finished"
        );

        let event = match outcome {
            StepOutcome::Completed { content, usage, .. } => {
                workflow.phase_mut(phase).mark_completed(content, usage)?;
                self.store
                    .update_phase(&workflow_id, workflow.phase(phase))
                    .await?;
                workflow.status = WorkflowStatus::NeedsReview;
                self.store.update_workflow(&workflow).await?;

                tracing::info!(%workflow_id, %phase, "phase ready for review");
                SessionEvent::PhaseCompleted {
                    workflow_id,
                    phase,
                    usage,
                }
            }
            StepOutcome::Failed { error, .. } => {
                workflow.phase_mut(phase).mark_failed(error.clone())?;
                self.store
                    .update_phase(&workflow_id, workflow.phase(phase))
                    .await?;
                self.store.update_workflow(&workflow).await?;

                tracing::warn!(%workflow_id, %phase, %error, "phase failed");
                SessionEvent::PhaseFailed {
                    workflow_id,
                    phase,
                    error,
                }
            }
        };
        Ok(event)
    }

    /// Best-effort write of a Failed record after a fault.
    async fn record_fault(&self, workflow_id: &str, phase: PhaseId, message: &str) {
        let mut record = match self.store.get_phase(workflow_id, phase).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(
                    %workflow_id,
                    %phase,
                    error = %e,
                    "could not load phase after fault"
                );
                return;
            }
        };
        if record.status != PhaseStatus::Running && record.mark_running().is_err() {
            return;
        }
        if record.mark_failed(message).is_err() {
            return;
        }
        if let Err(e) = self.store.update_phase(workflow_id, &record).await {
            tracing::error!(%workflow_id, %phase, error = %e, "could not record phase fault");
        }
    }

    /// Replace a completed phase's output with reviewer-edited content.
    /// A missing `reviewer` keeps the one already recorded.
    pub async fn edit_phase(
        &self,
        workflow_id: &str,
        phase: PhaseId,
        content: String,
        reviewer: Option<String>,
    ) -> Result<PhaseRecord, SessionError> {
        let applied = self
            .store
            .edit_phase(workflow_id, phase, &content, reviewer.as_deref(), Utc::now())
            .await
            .map_err(SessionError::Store)?;
        let record = self.get_phase(workflow_id, phase).await?;
        if !applied {
            return Err(SessionError::PhaseNotCompleted {
                phase,
                action: "editing",
            });
        }

        tracing::info!(%workflow_id, %phase, "phase edited");
        self.emit(SessionEvent::PhaseEdited {
            workflow_id: workflow_id.to_string(),
            phase,
        });
        Ok(record)
    }

    /// Approve the current phase and advance the workflow pointer.
    ///
    /// The review stamp and the pointer move are one guarded store write, so
    /// a concurrent edit is kept and a concurrent approval cannot advance
    /// the workflow twice.
    pub async fn approve_phase(
        &self,
        workflow_id: &str,
        phase: PhaseId,
        reviewer: Option<String>,
    ) -> Result<Approval, SessionError> {
        let mut workflow = self.get_workflow(workflow_id).await?;
        check_approvable(&workflow, phase)?;

        let next = next_phase(
            phase,
            workflow.input.skip_prior_auth,
            workflow.input.payer.as_deref(),
            workflow.input.procedure.as_deref(),
        );
        match next {
            Some(next) => {
                workflow.current_phase = Some(next);
                workflow.status = WorkflowStatus::Pending;
            }
            None => {
                workflow.current_phase = None;
                workflow.complete();
            }
        }

        let applied = self
            .store
            .approve_phase(&workflow, phase, reviewer.as_deref(), Utc::now())
            .await
            .map_err(SessionError::Store)?;
        if !applied {
            let latest = self.get_workflow(workflow_id).await?;
            check_approvable(&latest, phase)?;
            return Err(SessionError::Store(anyhow::anyhow!(
                "Approval of {} in workflow {} did not apply",
                phase,
                workflow_id
            )));
        }

        tracing::info!(%workflow_id, %phase, next = ?next, "phase approved");
        self.emit(SessionEvent::PhaseApproved {
            workflow_id: workflow_id.to_string(),
            phase,
            next_phase: next,
        });
        Ok(Approval {
            phase,
            next_phase: next,
            workflow_status: workflow.status,
        })
    }
}

fn check_approvable(workflow: &WorkflowRecord, phase: PhaseId) -> Result<(), SessionError> {
    if workflow.phase(phase).status != PhaseStatus::Completed {
        return Err(SessionError::PhaseNotCompleted {
            phase,
            action: "approval",
        });
    }
    if workflow.current_phase != Some(phase) {
        return Err(SessionError::NotCurrentPhase {
            current: workflow
                .current_phase
                .map(|p| p.to_string())
                .unwrap_or_else(|| "done".to_string()),
            requested: phase,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{Reply, ScriptedAgent};
    use crate::agent::{AgentOutcome, PhaseAgent, PhaseInputs, PhaseRequest};
    use crate::pipeline::retry::RetryPolicy;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn session_with(agent: Arc<dyn PhaseAgent>) -> ReviewSession {
        session_over(Arc::new(SqliteStore::open_in_memory().unwrap()), agent)
    }

    fn session_over(store: Arc<dyn WorkflowStore>, agent: Arc<dyn PhaseAgent>) -> ReviewSession {
        let coordinator = Arc::new(PipelineCoordinator::new(
            agent,
            RetryPolicy::new(0, Duration::ZERO),
        ));
        ReviewSession::new(store, coordinator)
    }

    fn note() -> WorkflowInput {
        WorkflowInput::new("58yo F, chest tightness on exertion, relieved by rest.")
            .with_patient_id("P-42")
    }

    async fn run_and_approve(session: &ReviewSession, id: &str, phase: PhaseId) -> Approval {
        let record = session.run_phase_and_wait(id, phase).await.unwrap();
        assert_eq!(record.status, PhaseStatus::Completed, "{} did not complete", phase);
        session
            .approve_phase(id, phase, Some("dr.ortiz".into()))
            .await
            .unwrap()
    }

    /// Blocks every call until released.
    struct GatedAgent {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl PhaseAgent for GatedAgent {
        async fn generate(&self, _request: &PhaseRequest) -> anyhow::Result<AgentOutcome> {
            self.gate.notified().await;
            Ok(AgentOutcome::completed("late output", TokenUsage::new(1, 1)))
        }
    }

    /// A write made by another reviewer between a read and the write
    /// that follows it.
    enum RivalWrite {
        Claim(PhaseId),
        Edit(PhaseId, &'static str),
        Approve { phase: PhaseId, next: PhaseId },
    }

    /// Store that performs a `RivalWrite` right after a chosen
    /// `get_workflow` call returns its snapshot.
    struct InterposedStore {
        inner: SqliteStore,
        reads: AtomicUsize,
        rival: std::sync::Mutex<Option<(usize, RivalWrite)>>,
    }

    impl InterposedStore {
        fn new() -> Self {
            Self {
                inner: SqliteStore::open_in_memory().unwrap(),
                reads: AtomicUsize::new(0),
                rival: std::sync::Mutex::new(None),
            }
        }

        /// Fire `write` after `skip` further workflow reads.
        fn arm(&self, skip: usize, write: RivalWrite) {
            let at = self.reads.load(Ordering::SeqCst) + skip;
            *self.rival.lock().unwrap() = Some((at, write));
        }

        fn take_due(&self, read: usize) -> Option<RivalWrite> {
            let mut rival = self.rival.lock().unwrap();
            match rival.as_ref() {
                Some((at, _)) if *at == read => rival.take().map(|(_, write)| write),
                _ => None,
            }
        }
    }

    #[async_trait]
    impl WorkflowStore for InterposedStore {
        async fn insert_workflow(&self, workflow: &WorkflowRecord) -> anyhow::Result<()> {
            self.inner.insert_workflow(workflow).await
        }

        async fn get_workflow(&self, workflow_id: &str) -> anyhow::Result<Option<WorkflowRecord>> {
            let snapshot = self.inner.get_workflow(workflow_id).await?;
            let read = self.reads.fetch_add(1, Ordering::SeqCst);
            if let (Some(write), Some(workflow)) = (self.take_due(read), snapshot.as_ref()) {
                match write {
                    RivalWrite::Claim(phase) => {
                        let mut record = workflow.phase(phase).clone();
                        record.mark_running()?;
                        assert!(self.inner.try_start_phase(workflow_id, &record).await?);
                    }
                    RivalWrite::Edit(phase, content) => {
                        let edited = self
                            .inner
                            .edit_phase(workflow_id, phase, content, Some("dr.kim"), Utc::now())
                            .await?;
                        assert!(edited);
                    }
                    RivalWrite::Approve { phase, next } => {
                        let mut advanced = workflow.clone();
                        advanced.current_phase = Some(next);
                        advanced.status = WorkflowStatus::Pending;
                        let approved = self
                            .inner
                            .approve_phase(&advanced, phase, Some("dr.kim"), Utc::now())
                            .await?;
                        assert!(approved);
                    }
                }
            }
            Ok(snapshot)
        }

        async fn update_workflow(&self, workflow: &WorkflowRecord) -> anyhow::Result<()> {
            self.inner.update_workflow(workflow).await
        }

        async fn list_workflows(
            &self,
            filter: &WorkflowFilter,
        ) -> anyhow::Result<Vec<WorkflowListing>> {
            self.inner.list_workflows(filter).await
        }

        async fn delete_workflow(&self, workflow_id: &str) -> anyhow::Result<bool> {
            self.inner.delete_workflow(workflow_id).await
        }

        async fn get_phase(
            &self,
            workflow_id: &str,
            phase: PhaseId,
        ) -> anyhow::Result<Option<PhaseRecord>> {
            self.inner.get_phase(workflow_id, phase).await
        }

        async fn update_phase(
            &self,
            workflow_id: &str,
            record: &PhaseRecord,
        ) -> anyhow::Result<()> {
            self.inner.update_phase(workflow_id, record).await
        }

        async fn try_start_phase(
            &self,
            workflow_id: &str,
            record: &PhaseRecord,
        ) -> anyhow::Result<bool> {
            self.inner.try_start_phase(workflow_id, record).await
        }

        async fn edit_phase(
            &self,
            workflow_id: &str,
            phase: PhaseId,
            content: &str,
            reviewer: Option<&str>,
            reviewed_at: DateTime<Utc>,
        ) -> anyhow::Result<bool> {
            self.inner
                .edit_phase(workflow_id, phase, content, reviewer, reviewed_at)
                .await
        }

        async fn approve_phase(
            &self,
            workflow: &WorkflowRecord,
            phase: PhaseId,
            reviewer: Option<&str>,
            reviewed_at: DateTime<Utc>,
        ) -> anyhow::Result<bool> {
            self.inner
                .approve_phase(workflow, phase, reviewer, reviewed_at)
                .await
        }
    }

    async fn wait_for_start(events: &mut broadcast::Receiver<SessionEvent>) {
        loop {
            if let SessionEvent::PhaseStarted { .. } = events.recv().await.unwrap() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_create_workflow_starts_at_documentation() {
        let session = session_with(Arc::new(ScriptedAgent::new()));
        let created = session.create_workflow(note()).await.unwrap();

        let fetched = session.get_workflow(&created.workflow_id).await.unwrap();
        assert_eq!(fetched.status, WorkflowStatus::Pending);
        assert_eq!(fetched.current_phase, Some(PhaseId::Documentation));
        assert!(fetched.phases.iter().all(|p| p.status == PhaseStatus::Pending));
    }

    #[tokio::test]
    async fn test_successful_run_awaits_review() {
        let session = session_with(Arc::new(ScriptedAgent::new()));
        let id = session.create_workflow(note()).await.unwrap().workflow_id;

        let record = session
            .run_phase_and_wait(&id, PhaseId::Documentation)
            .await
            .unwrap();
        assert_eq!(record.status, PhaseStatus::Completed);
        assert_eq!(record.content, "documentation output");

        let workflow = session.get_workflow(&id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::NeedsReview);
        assert_eq!(workflow.current_phase, Some(PhaseId::Documentation));
        assert!(workflow.started_at.is_some());
        assert_eq!(workflow.total_usage(), TokenUsage::new(10, 5));
    }

    #[tokio::test]
    async fn test_run_phase_rejects_out_of_order() {
        let session = session_with(Arc::new(ScriptedAgent::new()));
        let id = session.create_workflow(note()).await.unwrap().workflow_id;

        let err = session.run_phase(&id, PhaseId::Coding).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Current phase is 'documentation', not 'coding'"
        );
    }

    #[tokio::test]
    async fn test_run_phase_unknown_workflow() {
        let session = session_with(Arc::new(ScriptedAgent::new()));
        let err = session
            .run_phase("missing", PhaseId::Documentation)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::WorkflowNotFound { .. }));
    }

    #[tokio::test]
    async fn test_completed_phase_cannot_rerun() {
        let session = session_with(Arc::new(ScriptedAgent::new()));
        let id = session.create_workflow(note()).await.unwrap().workflow_id;
        session
            .run_phase_and_wait(&id, PhaseId::Documentation)
            .await
            .unwrap();

        let err = session
            .run_phase(&id, PhaseId::Documentation)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::PhaseAlreadyCompleted(PhaseId::Documentation)
        ));
    }

    #[tokio::test]
    async fn test_second_submission_is_rejected_while_in_flight() {
        let gate = Arc::new(Notify::new());
        let session = session_with(Arc::new(GatedAgent { gate: gate.clone() }));
        let id = session.create_workflow(note()).await.unwrap().workflow_id;
        let mut events = session.subscribe();

        let ack = session.run_phase(&id, PhaseId::Documentation).await.unwrap();
        assert_eq!(ack.phase, PhaseId::Documentation);

        let err = session
            .run_phase(&id, PhaseId::Documentation)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::PhaseAlreadyQueued(_) | SessionError::PhaseAlreadyRunning(_)
        ));

        gate.notify_one();
        loop {
            match events.recv().await.unwrap() {
                SessionEvent::PhaseCompleted { .. } => break,
                SessionEvent::PhaseFailed { error, .. } => panic!("unexpected failure: {}", error),
                _ => {}
            }
        }
        let record = session.get_phase(&id, PhaseId::Documentation).await.unwrap();
        assert_eq!(record.status, PhaseStatus::Completed);
        assert_eq!(record.content, "late output");
    }

    #[tokio::test]
    async fn test_failed_run_stays_in_progress_and_can_retry() {
        let agent = Arc::new(
            ScriptedAgent::new().reply(
                PhaseId::Documentation,
                Reply::Fail("Request timed out".into()),
            ),
        );
        let session = session_with(agent.clone());
        let id = session.create_workflow(note()).await.unwrap().workflow_id;

        let record = session
            .run_phase_and_wait(&id, PhaseId::Documentation)
            .await
            .unwrap();
        assert_eq!(record.status, PhaseStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("Request timed out"));

        let workflow = session.get_workflow(&id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::InProgress);
        assert_eq!(workflow.total_usage(), TokenUsage::default());

        let record = session
            .run_phase_and_wait(&id, PhaseId::Documentation)
            .await
            .unwrap();
        assert_eq!(record.status, PhaseStatus::Completed);
        assert!(record.error.is_none());
        assert_eq!(agent.calls_for(PhaseId::Documentation), 2);
    }

    #[tokio::test]
    async fn test_agent_fault_is_recorded_on_phase() {
        let agent = Arc::new(
            ScriptedAgent::new()
                .reply(PhaseId::Documentation, Reply::Fault("tls handshake".into())),
        );
        let session = session_with(agent);
        let id = session.create_workflow(note()).await.unwrap().workflow_id;

        let record = session
            .run_phase_and_wait(&id, PhaseId::Documentation)
            .await
            .unwrap();
        assert_eq!(record.status, PhaseStatus::Failed);
        assert_eq!(
            record.error.as_deref(),
            Some("Unexpected error: tls handshake")
        );
    }

    #[tokio::test]
    async fn test_edit_requires_completed_phase() {
        let session = session_with(Arc::new(ScriptedAgent::new()));
        let id = session.create_workflow(note()).await.unwrap().workflow_id;

        let err = session
            .edit_phase(&id, PhaseId::Documentation, "x".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::PhaseNotCompleted {
                action: "editing",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_edited_content_flows_into_next_phase() {
        let agent = Arc::new(ScriptedAgent::new());
        let session = session_with(agent.clone());
        let id = session.create_workflow(note()).await.unwrap().workflow_id;

        session
            .run_phase_and_wait(&id, PhaseId::Documentation)
            .await
            .unwrap();
        let edited = session
            .edit_phase(
                &id,
                PhaseId::Documentation,
                "S: exertional chest tightness".into(),
                Some("dr.ortiz".into()),
            )
            .await
            .unwrap();
        assert_eq!(edited.content, "documentation output");
        assert_eq!(edited.reviewed_by.as_deref(), Some("dr.ortiz"));

        session
            .approve_phase(&id, PhaseId::Documentation, None)
            .await
            .unwrap();
        session
            .run_phase_and_wait(&id, PhaseId::Coding)
            .await
            .unwrap();

        let coding_call = agent
            .calls()
            .into_iter()
            .find(|c| c.phase() == PhaseId::Coding)
            .unwrap();
        assert_eq!(
            coding_call.inputs,
            PhaseInputs::Coding {
                documentation: "S: exertional chest tightness".into()
            }
        );
        assert_eq!(coding_call.context["patient_id"], "P-42");
    }

    #[tokio::test]
    async fn test_approve_requires_completed_phase() {
        let session = session_with(Arc::new(ScriptedAgent::new()));
        let id = session.create_workflow(note()).await.unwrap().workflow_id;

        let err = session
            .approve_phase(&id, PhaseId::Documentation, None)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Phase documentation must be completed before approval"
        );
        let workflow = session.get_workflow(&id).await.unwrap();
        assert_eq!(workflow.current_phase, Some(PhaseId::Documentation));
    }

    #[tokio::test]
    async fn test_approve_advances_pointer() {
        let session = session_with(Arc::new(ScriptedAgent::new()));
        let id = session.create_workflow(note()).await.unwrap().workflow_id;

        let approval = run_and_approve(&session, &id, PhaseId::Documentation).await;
        assert_eq!(approval.next_phase, Some(PhaseId::Coding));
        assert_eq!(approval.workflow_status, WorkflowStatus::Pending);

        let workflow = session.get_workflow(&id).await.unwrap();
        assert_eq!(workflow.current_phase, Some(PhaseId::Coding));
        let doc = workflow.phase(PhaseId::Documentation);
        assert!(doc.reviewed_at.is_some());
        assert_eq!(doc.reviewed_by.as_deref(), Some("dr.ortiz"));
    }

    #[tokio::test]
    async fn test_full_review_without_payer_skips_prior_auth() {
        let agent = Arc::new(ScriptedAgent::new());
        let session = session_with(agent.clone());
        let id = session.create_workflow(note()).await.unwrap().workflow_id;

        run_and_approve(&session, &id, PhaseId::Documentation).await;
        run_and_approve(&session, &id, PhaseId::Coding).await;
        let approval = run_and_approve(&session, &id, PhaseId::Compliance).await;
        assert_eq!(approval.next_phase, Some(PhaseId::QualityAssurance));

        let approval = run_and_approve(&session, &id, PhaseId::QualityAssurance).await;
        assert_eq!(approval.next_phase, None);
        assert_eq!(approval.workflow_status, WorkflowStatus::Completed);

        let workflow = session.get_workflow(&id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert!(workflow.current_phase.is_none());
        assert!(workflow.completed_at.is_some());
        assert_eq!(
            workflow.phase(PhaseId::PriorAuth).status,
            PhaseStatus::Pending
        );
        assert_eq!(agent.calls_for(PhaseId::PriorAuth), 0);

        let err = session
            .run_phase(&id, PhaseId::QualityAssurance)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::WorkflowFinished(_)));
    }

    #[tokio::test]
    async fn test_events_are_broadcast_in_order() {
        let session = session_with(Arc::new(ScriptedAgent::new()));
        let id = session.create_workflow(note()).await.unwrap().workflow_id;
        let mut events = session.subscribe();

        session
            .run_phase_and_wait(&id, PhaseId::Documentation)
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(match event {
                SessionEvent::PhaseQueued { .. } => "queued",
                SessionEvent::PhaseStarted { .. } => "started",
                SessionEvent::PhaseCompleted { .. } => "completed",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["queued", "started", "completed"]);
    }

    #[test]
    fn test_parse_phase_rejects_unknown_name() {
        assert_eq!(parse_phase("coding").unwrap(), PhaseId::Coding);
        let err = parse_phase("billing").unwrap_err();
        assert_eq!(err.to_string(), "Invalid phase: billing");
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = SessionEvent::PhaseApproved {
            workflow_id: "w-1".into(),
            phase: PhaseId::Compliance,
            next_phase: Some(PhaseId::QualityAssurance),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "PhaseApproved");
        assert_eq!(json["data"]["next_phase"], "quality_assurance");
    }

    #[tokio::test]
    async fn test_second_session_on_same_file_cannot_run_claimed_phase() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.db");
        let gate = Arc::new(Notify::new());
        let first = session_over(
            Arc::new(SqliteStore::open(&path).unwrap()),
            Arc::new(GatedAgent { gate: gate.clone() }),
        );
        let second_agent = Arc::new(ScriptedAgent::new());
        let second = session_over(
            Arc::new(SqliteStore::open(&path).unwrap()),
            second_agent.clone(),
        );

        let id = first.create_workflow(note()).await.unwrap().workflow_id;
        let mut events = first.subscribe();
        first.run_phase(&id, PhaseId::Documentation).await.unwrap();
        wait_for_start(&mut events).await;

        let err = second
            .run_phase_and_wait(&id, PhaseId::Documentation)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::PhaseAlreadyRunning(PhaseId::Documentation)
        ));

        gate.notify_one();
        loop {
            if let SessionEvent::PhaseCompleted { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        let record = second.get_phase(&id, PhaseId::Documentation).await.unwrap();
        assert_eq!(record.content, "late output");
        assert_eq!(second_agent.calls_for(PhaseId::Documentation), 0);
    }

    #[tokio::test]
    async fn test_job_dropped_when_claimed_after_its_read() {
        let store = Arc::new(InterposedStore::new());
        let agent = Arc::new(ScriptedAgent::new());
        let session = session_over(store.clone(), agent.clone());
        let id = session.create_workflow(note()).await.unwrap().workflow_id;
        let mut events = session.subscribe();

        // run_phase reads first, then the worker's snapshot goes stale
        store.arm(1, RivalWrite::Claim(PhaseId::Documentation));
        let err = session
            .run_phase_and_wait(&id, PhaseId::Documentation)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::PhaseAlreadyRunning(PhaseId::Documentation)
        ));
        assert_eq!(agent.calls_for(PhaseId::Documentation), 0);

        let mut dropped = None;
        while let Ok(event) = events.try_recv() {
            match event {
                SessionEvent::PhaseDropped { reason, .. } => dropped = Some(reason),
                SessionEvent::PhaseStarted { .. } | SessionEvent::PhaseFailed { .. } => {
                    panic!("dropped job must not start or fail: {:?}", event)
                }
                _ => {}
            }
        }
        assert_eq!(
            dropped.as_deref(),
            Some("Phase documentation was started by another session")
        );

        let record = session.get_phase(&id, PhaseId::Documentation).await.unwrap();
        assert_eq!(record.status, PhaseStatus::Running);
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn test_approve_keeps_edit_made_during_approval() {
        let store = Arc::new(InterposedStore::new());
        let session = session_over(store.clone(), Arc::new(ScriptedAgent::new()));
        let id = session.create_workflow(note()).await.unwrap().workflow_id;
        session
            .run_phase_and_wait(&id, PhaseId::Documentation)
            .await
            .unwrap();

        store.arm(0, RivalWrite::Edit(PhaseId::Documentation, "EDITED"));
        let approval = session
            .approve_phase(&id, PhaseId::Documentation, None)
            .await
            .unwrap();
        assert_eq!(approval.next_phase, Some(PhaseId::Coding));

        let doc = session.get_phase(&id, PhaseId::Documentation).await.unwrap();
        assert_eq!(doc.edited_content.as_deref(), Some("EDITED"));
        assert_eq!(doc.reviewed_by.as_deref(), Some("dr.kim"));
        assert_eq!(doc.effective_content(), "EDITED");
    }

    #[tokio::test]
    async fn test_concurrent_approvals_advance_once() {
        let store = Arc::new(InterposedStore::new());
        let session = session_over(store.clone(), Arc::new(ScriptedAgent::new()));
        let id = session.create_workflow(note()).await.unwrap().workflow_id;
        session
            .run_phase_and_wait(&id, PhaseId::Documentation)
            .await
            .unwrap();

        store.arm(
            0,
            RivalWrite::Approve {
                phase: PhaseId::Documentation,
                next: PhaseId::Coding,
            },
        );
        let err = session
            .approve_phase(&id, PhaseId::Documentation, Some("dr.ortiz".into()))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Current phase is 'coding', not 'documentation'"
        );

        let workflow = session.get_workflow(&id).await.unwrap();
        assert_eq!(workflow.current_phase, Some(PhaseId::Coding));
        assert_eq!(
            workflow.phase(PhaseId::Documentation).reviewed_by.as_deref(),
            Some("dr.kim")
        );
    }

    #[tokio::test]
    async fn test_edit_without_reviewer_keeps_previous_reviewer() {
        let session = session_with(Arc::new(ScriptedAgent::new()));
        let id = session.create_workflow(note()).await.unwrap().workflow_id;
        session
            .run_phase_and_wait(&id, PhaseId::Documentation)
            .await
            .unwrap();

        session
            .edit_phase(
                &id,
                PhaseId::Documentation,
                "v1".into(),
                Some("dr.ortiz".into()),
            )
            .await
            .unwrap();
        let record = session
            .edit_phase(&id, PhaseId::Documentation, "v2".into(), None)
            .await
            .unwrap();
        assert_eq!(record.edited_content.as_deref(), Some("v2"));
        assert_eq!(record.reviewed_by.as_deref(), Some("dr.ortiz"));
    }

    #[tokio::test]
    async fn test_list_workflows_filters_by_status() {
        let session = session_with(Arc::new(ScriptedAgent::new()));
        let waiting = session.create_workflow(note()).await.unwrap().workflow_id;
        let reviewed = session.create_workflow(note()).await.unwrap().workflow_id;
        session
            .run_phase_and_wait(&reviewed, PhaseId::Documentation)
            .await
            .unwrap();

        let all = session
            .list_workflows(&WorkflowFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let needs_review = session
            .list_workflows(&WorkflowFilter::default().with_status(WorkflowStatus::NeedsReview))
            .await
            .unwrap();
        assert_eq!(needs_review.len(), 1);
        assert_eq!(needs_review[0].workflow_id, reviewed);
        assert_eq!(needs_review[0].total_tokens, TokenUsage::new(10, 5));
        assert!(needs_review.iter().all(|w| w.workflow_id != waiting));
    }

    #[tokio::test]
    async fn test_delete_refused_while_phase_queued() {
        let gate = Arc::new(Notify::new());
        let session = session_with(Arc::new(GatedAgent { gate: gate.clone() }));
        let id = session.create_workflow(note()).await.unwrap().workflow_id;
        let mut events = session.subscribe();

        session.run_phase(&id, PhaseId::Documentation).await.unwrap();
        let err = session.delete_workflow(&id, true).await.unwrap_err();
        assert!(matches!(err, SessionError::WorkflowBusy { .. }));

        gate.notify_one();
        loop {
            if let SessionEvent::PhaseCompleted { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        // the worker drops the phase from its set before broadcasting
        session.delete_workflow(&id, false).await.unwrap();
        let err = session.get_workflow(&id).await.unwrap_err();
        assert!(matches!(err, SessionError::WorkflowNotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_running_phase_needs_force() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let session = session_over(store.clone(), Arc::new(ScriptedAgent::new()));
        let workflow = session.create_workflow(note()).await.unwrap();
        let id = workflow.workflow_id.clone();

        // left Running by a process that went away
        let mut record = workflow.phase(PhaseId::Documentation).clone();
        record.mark_running().unwrap();
        assert!(store.try_start_phase(&id, &record).await.unwrap());

        let err = session.delete_workflow(&id, false).await.unwrap_err();
        assert_eq!(err.to_string(), format!("Workflow {} has a phase in progress", id));

        session.delete_workflow(&id, true).await.unwrap();
        let err = session.delete_workflow(&id, true).await.unwrap_err();
        assert!(matches!(err, SessionError::WorkflowNotFound { .. }));
    }
}
