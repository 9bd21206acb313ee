//! Full-mode pipeline run: `clinical-bridge process`.

use anyhow::Result;

use clinical_bridge::config::BridgeConfig;
use clinical_bridge::pipeline::{ProcessRequest, WorkflowStatus};

use super::super::{NoteArgs, OutputFormat};
use super::render;

pub async fn cmd_process(
    config: &BridgeConfig,
    note: &NoteArgs,
    output: OutputFormat,
) -> Result<()> {
    let input = note.to_input()?;
    let coordinator = super::coordinator(config)?;

    let workflow = coordinator.process(ProcessRequest::new(input)).await;

    match output {
        OutputFormat::Summary => render::print_workflow(&workflow),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&workflow.summary())?),
        OutputFormat::Full => println!("{}", serde_json::to_string_pretty(&workflow)?),
    }

    if workflow.status != WorkflowStatus::Completed {
        anyhow::bail!(
            "Workflow {} finished with status {}",
            workflow.workflow_id,
            workflow.status
        );
    }
    Ok(())
}
