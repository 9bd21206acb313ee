//! CLI command implementations.
//!
//! | Module     | Commands handled          |
//! |------------|---------------------------|
//! | `process`  | `Process`                 |
//! | `workflow` | `Workflow create/show`    |
//! | `phase`    | `Phase run/show/edit/approve` |

pub mod phase;
pub mod process;
pub mod render;
pub mod workflow;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use clinical_bridge::agent::{AgentOutcome, AnthropicAgent, PhaseAgent, PhaseRequest};
use clinical_bridge::config::{BridgeConfig, DEFAULT_CONFIG_PATH};
use clinical_bridge::pipeline::{PipelineCoordinator, RetryPolicy, WorkflowInput};
use clinical_bridge::session::ReviewSession;
use clinical_bridge::store::SqliteStore;

use super::{Cli, NoteArgs};

pub use phase::cmd_phase;
pub use process::cmd_process;
pub use workflow::cmd_workflow;

/// Layer the config file, environment and CLI flags.
pub fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = match &cli.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::load_or_default(Path::new(DEFAULT_CONFIG_PATH))?,
    };
    config.apply_env_overrides()?;
    if let Some(db_path) = &cli.db_path {
        config.store.path = db_path.clone();
    }
    Ok(config)
}

impl NoteArgs {
    pub fn to_input(&self) -> Result<WorkflowInput> {
        let raw = match (&self.note, &self.file) {
            (Some(note), _) => note.clone(),
            (None, Some(path)) => read_text(path)?,
            (None, None) => anyhow::bail!("Provide a clinical note inline or with --file"),
        };
        if raw.trim().is_empty() {
            anyhow::bail!("Clinical note is empty");
        }

        let mut input = WorkflowInput::new(raw);
        if let Some(id) = &self.patient_id {
            input = input.with_patient_id(id);
        }
        if let Some(payer) = &self.payer {
            input = input.with_payer(payer);
        }
        if let Some(procedure) = &self.procedure {
            input = input.with_procedure(procedure);
        }
        if self.skip_prior_auth {
            input = input.skipping_prior_auth();
        }
        Ok(input)
    }
}

pub fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

pub fn coordinator(config: &BridgeConfig) -> Result<PipelineCoordinator> {
    let agent = AnthropicAgent::from_config(&config.agent)?;
    Ok(PipelineCoordinator::new(
        Arc::new(agent),
        RetryPolicy::from(&config.retry),
    ))
}

/// Open the review session. Commands that never run a phase pass
/// `with_agent = false` and work without an API key.
pub fn open_session(config: &BridgeConfig, with_agent: bool) -> Result<ReviewSession> {
    let store = SqliteStore::open(&config.store.path)?;
    let coordinator = if with_agent {
        coordinator(config)?
    } else {
        PipelineCoordinator::new(Arc::new(Unconfigured), RetryPolicy::from(&config.retry))
    };
    Ok(ReviewSession::new(Arc::new(store), Arc::new(coordinator)))
}

struct Unconfigured;

#[async_trait]
impl PhaseAgent for Unconfigured {
    async fn generate(&self, _request: &PhaseRequest) -> Result<AgentOutcome> {
        anyhow::bail!("ANTHROPIC_API_KEY is not set")
    }
}
