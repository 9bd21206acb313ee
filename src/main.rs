use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "clinical-bridge")]
#[command(version, about = "Clinical note workflow orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to bridge.toml (defaults to .clinical-bridge/bridge.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database for step-mode workflows. Overrides BRIDGE_DB_PATH and [store].path.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Note source and routing metadata shared by `process` and `workflow create`.
#[derive(clap::Args, Clone, Debug)]
pub struct NoteArgs {
    /// Raw clinical note text
    #[arg(conflicts_with = "file")]
    pub note: Option<String>,

    /// Read the note from a file
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    #[arg(long)]
    pub patient_id: Option<String>,

    /// Payer name; prior authorization runs only when a payer and procedure are given
    #[arg(long)]
    pub payer: Option<String>,

    #[arg(long)]
    pub procedure: Option<String>,

    #[arg(long)]
    pub skip_prior_auth: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Summary,
    Json,
    Full,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run every phase of the pipeline on a note
    Process {
        #[command(flatten)]
        note: NoteArgs,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Summary)]
        output: OutputFormat,
    },
    /// Create and inspect reviewed workflows
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Run, edit and approve phases of a reviewed workflow
    Phase {
        #[command(subcommand)]
        command: PhaseCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum WorkflowCommands {
    /// Create a workflow that waits for a reviewer between phases
    Create {
        #[command(flatten)]
        note: NoteArgs,
    },
    /// Show a workflow and its phases
    Show {
        workflow_id: String,

        #[arg(long)]
        json: bool,
    },
    /// List workflows, newest first
    List {
        /// Only workflows with this status (e.g. needs_review)
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = clinical_bridge::store::DEFAULT_LIST_LIMIT)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long)]
        json: bool,
    },
    /// Delete a workflow and its phase outputs
    Delete {
        workflow_id: String,

        /// Delete even if a phase is recorded as running
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum PhaseCommands {
    /// Run the workflow's current phase and wait for it to finish
    Run { workflow_id: String, phase: String },
    /// Show one phase's output
    Show { workflow_id: String, phase: String },
    /// Replace a completed phase's output
    Edit {
        workflow_id: String,
        phase: String,

        /// New content
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        content: Option<String>,

        /// Read new content from a file
        #[arg(short, long)]
        file: Option<PathBuf>,

        #[arg(long)]
        reviewer: Option<String>,
    },
    /// Approve a completed phase and advance the workflow
    Approve {
        workflow_id: String,
        phase: String,

        #[arg(long)]
        reviewer: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = cmd::load_config(&cli)?;
    let _log_guard = clinical_bridge::logging::init(&config.logging, cli.verbose)?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    match &cli.command {
        Commands::Process { note, output } => cmd::cmd_process(&config, note, *output).await?,
        Commands::Workflow { command } => cmd::cmd_workflow(&config, command.clone()).await?,
        Commands::Phase { command } => cmd::cmd_phase(&config, command.clone()).await?,
    }

    Ok(())
}
