use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::pipeline::phase::{PHASE_ORDER, PhaseId};
use crate::pipeline::state::{
    PhaseRecord, PhaseStatus, TokenUsage, WorkflowInput, WorkflowRecord, WorkflowStatus,
};
use crate::store::{WorkflowFilter, WorkflowListing, WorkflowStore};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Async-safe `WorkflowStore` over SQLite.
///
/// Wraps `BridgeDb` behind `Arc<Mutex>` and runs every query on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<std::sync::Mutex<BridgeDb>>,
}

impl SqliteStore {
    pub fn new(db: BridgeDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self::new(BridgeDb::new(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(BridgeDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BridgeDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

#[async_trait]
impl WorkflowStore for SqliteStore {
    async fn insert_workflow(&self, workflow: &WorkflowRecord) -> Result<()> {
        let workflow = workflow.clone();
        self.call(move |db| db.insert_workflow(&workflow)).await
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>> {
        let workflow_id = workflow_id.to_string();
        self.call(move |db| db.get_workflow(&workflow_id)).await
    }

    async fn update_workflow(&self, workflow: &WorkflowRecord) -> Result<()> {
        let workflow = workflow.clone();
        self.call(move |db| db.update_workflow(&workflow)).await
    }

    async fn get_phase(&self, workflow_id: &str, phase: PhaseId) -> Result<Option<PhaseRecord>> {
        let workflow_id = workflow_id.to_string();
        self.call(move |db| db.get_phase(&workflow_id, phase)).await
    }

    async fn list_workflows(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowListing>> {
        let filter = filter.clone();
        self.call(move |db| db.list_workflows(&filter)).await
    }

    async fn delete_workflow(&self, workflow_id: &str) -> Result<bool> {
        let workflow_id = workflow_id.to_string();
        self.call(move |db| db.delete_workflow(&workflow_id)).await
    }

    async fn update_phase(&self, workflow_id: &str, record: &PhaseRecord) -> Result<()> {
        let workflow_id = workflow_id.to_string();
        let record = record.clone();
        self.call(move |db| db.update_phase(&workflow_id, &record)).await
    }

    async fn try_start_phase(&self, workflow_id: &str, record: &PhaseRecord) -> Result<bool> {
        let workflow_id = workflow_id.to_string();
        let record = record.clone();
        self.call(move |db| db.try_start_phase(&workflow_id, &record)).await
    }

    async fn edit_phase(
        &self,
        workflow_id: &str,
        phase: PhaseId,
        content: &str,
        reviewer: Option<&str>,
        reviewed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let workflow_id = workflow_id.to_string();
        let content = content.to_string();
        let reviewer = reviewer.map(str::to_string);
        self.call(move |db| {
            db.edit_phase(&workflow_id, phase, &content, reviewer.as_deref(), reviewed_at)
        })
        .await
    }

    async fn approve_phase(
        &self,
        workflow: &WorkflowRecord,
        phase: PhaseId,
        reviewer: Option<&str>,
        reviewed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let workflow = workflow.clone();
        let reviewer = reviewer.map(str::to_string);
        self.call(move |db| db.approve_phase(&workflow, phase, reviewer.as_deref(), reviewed_at))
            .await
    }
}

pub struct BridgeDb {
    conn: Connection,
}

impl BridgeDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        // Other CLI invocations may hold the write lock briefly.
        self.conn
            .busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflows (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL DEFAULT 'pending',
                    raw_input TEXT NOT NULL,
                    patient_id TEXT,
                    payer TEXT,
                    procedure TEXT,
                    skip_prior_auth INTEGER NOT NULL DEFAULT 0,
                    current_phase TEXT,
                    total_input_tokens INTEGER NOT NULL DEFAULT 0,
                    total_output_tokens INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS phase_results (
                    workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                    phase TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    content TEXT NOT NULL DEFAULT '',
                    edited_content TEXT,
                    error TEXT,
                    input_tokens INTEGER NOT NULL DEFAULT 0,
                    output_tokens INTEGER NOT NULL DEFAULT 0,
                    started_at TEXT,
                    completed_at TEXT,
                    reviewed_at TEXT,
                    reviewed_by TEXT,
                    PRIMARY KEY (workflow_id, phase)
                );

                CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Workflows ────────────────────────────────────────────────────

    pub fn insert_workflow(&self, workflow: &WorkflowRecord) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let usage = workflow.total_usage();
        tx.execute(
            "INSERT INTO workflows (id, status, raw_input, patient_id, payer, procedure, skip_prior_auth,
                current_phase, total_input_tokens, total_output_tokens, created_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                workflow.workflow_id,
                workflow.status.as_str(),
                workflow.input.raw_input,
                workflow.input.patient_id,
                workflow.input.payer,
                workflow.input.procedure,
                workflow.input.skip_prior_auth,
                workflow.current_phase.map(|p| p.as_str()),
                usage.input_tokens as i64,
                usage.output_tokens as i64,
                workflow.created_at.to_rfc3339(),
                to_text(workflow.started_at),
                to_text(workflow.completed_at),
            ],
        )
        .context("Failed to insert workflow")?;

        for record in &workflow.phases {
            tx.execute(
                "INSERT INTO phase_results (workflow_id, phase, status, content, edited_content, error,
                    input_tokens, output_tokens, started_at, completed_at, reviewed_at, reviewed_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    workflow.workflow_id,
                    record.phase.as_str(),
                    record.status.as_str(),
                    record.content,
                    record.edited_content,
                    record.error,
                    record.usage.input_tokens as i64,
                    record.usage.output_tokens as i64,
                    to_text(record.started_at),
                    to_text(record.completed_at),
                    to_text(record.reviewed_at),
                    record.reviewed_by,
                ],
            )
            .context("Failed to insert phase result")?;
        }

        tx.commit().context("Failed to commit workflow insert")?;
        Ok(())
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, status, raw_input, patient_id, payer, procedure, skip_prior_auth,
                        current_phase, created_at, started_at, completed_at
                 FROM workflows WHERE id = ?1",
                params![workflow_id],
                |row| {
                    Ok(WorkflowRow {
                        id: row.get(0)?,
                        status: row.get(1)?,
                        raw_input: row.get(2)?,
                        patient_id: row.get(3)?,
                        payer: row.get(4)?,
                        procedure: row.get(5)?,
                        skip_prior_auth: row.get(6)?,
                        current_phase: row.get(7)?,
                        created_at: row.get(8)?,
                        started_at: row.get(9)?,
                        completed_at: row.get(10)?,
                    })
                },
            )
            .optional()
            .context("Failed to query workflow")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut phases = PHASE_ORDER.map(PhaseRecord::new);
        for record in self.get_phases(workflow_id)? {
            let index = record.phase.index();
            phases[index] = record;
        }
        Ok(Some(row.into_workflow(phases)?))
    }

    pub fn update_workflow(&self, workflow: &WorkflowRecord) -> Result<()> {
        let usage = workflow.total_usage();
        let changed = self
            .conn
            .execute(
                "UPDATE workflows SET status = ?1, current_phase = ?2, total_input_tokens = ?3,
                    total_output_tokens = ?4, started_at = ?5, completed_at = ?6
                 WHERE id = ?7",
                params![
                    workflow.status.as_str(),
                    workflow.current_phase.map(|p| p.as_str()),
                    usage.input_tokens as i64,
                    usage.output_tokens as i64,
                    to_text(workflow.started_at),
                    to_text(workflow.completed_at),
                    workflow.workflow_id,
                ],
            )
            .context("Failed to update workflow")?;
        if changed == 0 {
            anyhow::bail!("Workflow {} not found", workflow.workflow_id);
        }
        Ok(())
    }

    pub fn list_workflows(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowListing>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, status, patient_id, current_phase, total_input_tokens,
                        total_output_tokens, created_at
                 FROM workflows
                 WHERE ?1 IS NULL OR status = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2 OFFSET ?3",
            )
            .context("Failed to prepare list_workflows")?;
        let rows = stmt
            .query_map(
                params![
                    filter.status.map(|s| s.as_str()),
                    filter.effective_limit() as i64,
                    filter.offset as i64,
                ],
                |row| {
                    Ok(ListingRow {
                        id: row.get(0)?,
                        status: row.get(1)?,
                        patient_id: row.get(2)?,
                        current_phase: row.get(3)?,
                        input_tokens: row.get(4)?,
                        output_tokens: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .context("Failed to query workflows")?;

        let mut listings = Vec::new();
        for row in rows {
            let row = row.context("Failed to read workflow row")?;
            listings.push(row.into_listing()?);
        }
        Ok(listings)
    }

    /// Phase results go with the workflow via `ON DELETE CASCADE`.
    pub fn delete_workflow(&self, workflow_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM workflows WHERE id = ?1", params![workflow_id])
            .context("Failed to delete workflow")?;
        Ok(changed > 0)
    }

    // ── Phase results ────────────────────────────────────────────────

    pub fn get_phase(&self, workflow_id: &str, phase: PhaseId) -> Result<Option<PhaseRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE workflow_id = ?1 AND phase = ?2", PHASE_SELECT),
                params![workflow_id, phase.as_str()],
                PhaseRow::from_row,
            )
            .optional()
            .context("Failed to query phase result")?;
        row.map(PhaseRow::into_phase_record).transpose()
    }

    fn get_phases(&self, workflow_id: &str) -> Result<Vec<PhaseRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE workflow_id = ?1", PHASE_SELECT))
            .context("Failed to prepare get_phases")?;
        let rows = stmt
            .query_map(params![workflow_id], PhaseRow::from_row)
            .context("Failed to query phase results")?;

        let mut records = Vec::new();
        for row in rows {
            let row = row.context("Failed to read phase result row")?;
            records.push(row.into_phase_record()?);
        }
        Ok(records)
    }

    pub fn update_phase(&self, workflow_id: &str, record: &PhaseRecord) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE phase_results SET status = ?1, content = ?2, edited_content = ?3, error = ?4,
                    input_tokens = ?5, output_tokens = ?6, started_at = ?7, completed_at = ?8,
                    reviewed_at = ?9, reviewed_by = ?10
                 WHERE workflow_id = ?11 AND phase = ?12",
                params![
                    record.status.as_str(),
                    record.content,
                    record.edited_content,
                    record.error,
                    record.usage.input_tokens as i64,
                    record.usage.output_tokens as i64,
                    to_text(record.started_at),
                    to_text(record.completed_at),
                    to_text(record.reviewed_at),
                    record.reviewed_by,
                    workflow_id,
                    record.phase.as_str(),
                ],
            )
            .context("Failed to update phase result")?;
        if changed == 0 {
            anyhow::bail!(
                "Phase {} not found for workflow {}",
                record.phase,
                workflow_id
            );
        }
        Ok(())
    }

    pub fn try_start_phase(&self, workflow_id: &str, record: &PhaseRecord) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE phase_results SET status = 'running', started_at = ?1,
                    completed_at = NULL, error = NULL
                 WHERE workflow_id = ?2 AND phase = ?3 AND status IN ('pending', 'failed')
                   AND EXISTS (SELECT 1 FROM workflows WHERE id = ?2 AND current_phase = ?3)",
                params![
                    to_text(record.started_at),
                    workflow_id,
                    record.phase.as_str()
                ],
            )
            .context("Failed to claim phase")?;
        Ok(changed > 0)
    }

    pub fn edit_phase(
        &self,
        workflow_id: &str,
        phase: PhaseId,
        content: &str,
        reviewer: Option<&str>,
        reviewed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE phase_results SET edited_content = ?1,
                    reviewed_by = COALESCE(?2, reviewed_by), reviewed_at = ?3
                 WHERE workflow_id = ?4 AND phase = ?5 AND status = 'completed'",
                params![
                    content,
                    reviewer,
                    reviewed_at.to_rfc3339(),
                    workflow_id,
                    phase.as_str()
                ],
            )
            .context("Failed to store edited content")?;
        Ok(changed > 0)
    }

    pub fn approve_phase(
        &self,
        workflow: &WorkflowRecord,
        phase: PhaseId,
        reviewer: Option<&str>,
        reviewed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let stamped = tx
            .execute(
                "UPDATE phase_results SET reviewed_at = ?1, reviewed_by = COALESCE(?2, reviewed_by)
                 WHERE workflow_id = ?3 AND phase = ?4 AND status = 'completed'",
                params![
                    reviewed_at.to_rfc3339(),
                    reviewer,
                    workflow.workflow_id,
                    phase.as_str()
                ],
            )
            .context("Failed to stamp review")?;
        if stamped == 0 {
            return Ok(false);
        }

        let advanced = tx
            .execute(
                "UPDATE workflows SET status = ?1, current_phase = ?2, completed_at = ?3
                 WHERE id = ?4 AND current_phase = ?5",
                params![
                    workflow.status.as_str(),
                    workflow.current_phase.map(|p| p.as_str()),
                    to_text(workflow.completed_at),
                    workflow.workflow_id,
                    phase.as_str(),
                ],
            )
            .context("Failed to advance workflow")?;
        if advanced == 0 {
            return Ok(false);
        }

        tx.commit().context("Failed to commit approval")?;
        Ok(true)
    }
}

const PHASE_SELECT: &str = "SELECT phase, status, content, edited_content, error, input_tokens,
        output_tokens, started_at, completed_at, reviewed_at, reviewed_by
     FROM phase_results";

fn to_text(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339())
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{}'", value))
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

fn parse_workflow_status(value: &str) -> Result<WorkflowStatus> {
    WorkflowStatus::from_str(value)
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to parse workflow status")
}

fn parse_current_phase(value: Option<&str>) -> Result<Option<PhaseId>> {
    value
        .map(PhaseId::from_str)
        .transpose()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to parse current phase")
}

/// Intermediate row struct for workflows.
struct WorkflowRow {
    id: String,
    status: String,
    raw_input: String,
    patient_id: Option<String>,
    payer: Option<String>,
    procedure: Option<String>,
    skip_prior_auth: bool,
    current_phase: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl WorkflowRow {
    fn into_workflow(self, phases: [PhaseRecord; 5]) -> Result<WorkflowRecord> {
        let status = parse_workflow_status(&self.status)?;
        let current_phase = parse_current_phase(self.current_phase.as_deref())?;

        Ok(WorkflowRecord {
            workflow_id: self.id,
            status,
            input: WorkflowInput {
                raw_input: self.raw_input,
                patient_id: self.patient_id,
                payer: self.payer,
                procedure: self.procedure,
                skip_prior_auth: self.skip_prior_auth,
            },
            current_phase,
            phases,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
        })
    }
}

/// Intermediate row struct for workflow listings.
struct ListingRow {
    id: String,
    status: String,
    patient_id: Option<String>,
    current_phase: Option<String>,
    input_tokens: i64,
    output_tokens: i64,
    created_at: String,
}

impl ListingRow {
    fn into_listing(self) -> Result<WorkflowListing> {
        let status = parse_workflow_status(&self.status)?;
        let current_phase = parse_current_phase(self.current_phase.as_deref())?;

        Ok(WorkflowListing {
            workflow_id: self.id,
            status,
            patient_id: self.patient_id,
            current_phase,
            total_tokens: TokenUsage::new(self.input_tokens as u64, self.output_tokens as u64),
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

/// Intermediate row struct for phase_results.
struct PhaseRow {
    phase: String,
    status: String,
    content: String,
    edited_content: Option<String>,
    error: Option<String>,
    input_tokens: i64,
    output_tokens: i64,
    started_at: Option<String>,
    completed_at: Option<String>,
    reviewed_at: Option<String>,
    reviewed_by: Option<String>,
}

impl PhaseRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            phase: row.get(0)?,
            status: row.get(1)?,
            content: row.get(2)?,
            edited_content: row.get(3)?,
            error: row.get(4)?,
            input_tokens: row.get(5)?,
            output_tokens: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
            reviewed_at: row.get(9)?,
            reviewed_by: row.get(10)?,
        })
    }

    fn into_phase_record(self) -> Result<PhaseRecord> {
        let phase = PhaseId::from_str(&self.phase)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse phase name")?;
        let status = PhaseStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse phase status")?;

        Ok(PhaseRecord {
            phase,
            status,
            content: self.content,
            edited_content: self.edited_content,
            error: self.error,
            usage: TokenUsage::new(self.input_tokens as u64, self.output_tokens as u64),
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            reviewed_at: parse_opt_ts(self.reviewed_at)?,
            reviewed_by: self.reviewed_by,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
