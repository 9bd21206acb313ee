//! Reviewed workflow commands: `clinical-bridge workflow create|show|list|delete`.

use anyhow::Result;
use console::style;

use clinical_bridge::config::BridgeConfig;
use clinical_bridge::pipeline::WorkflowStatus;
use clinical_bridge::store::WorkflowFilter;

use super::super::WorkflowCommands;
use super::render;

pub async fn cmd_workflow(config: &BridgeConfig, command: WorkflowCommands) -> Result<()> {
    match command {
        WorkflowCommands::Create { note } => {
            let input = note.to_input()?;
            let session = super::open_session(config, false)?;
            let workflow = session.create_workflow(input).await?;

            println!("Created workflow {}", workflow.workflow_id);
            if let Some(phase) = workflow.current_phase {
                println!(
                    "{}",
                    style(format!(
                        "Next: clinical-bridge phase run {} {}",
                        workflow.workflow_id, phase
                    ))
                    .dim()
                );
            }
        }
        WorkflowCommands::Show { workflow_id, json } => {
            let session = super::open_session(config, false)?;
            let workflow = session.get_workflow(&workflow_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&workflow)?);
            } else {
                render::print_workflow(&workflow);
            }
        }
        WorkflowCommands::List {
            status,
            limit,
            offset,
            json,
        } => {
            let status = status
                .as_deref()
                .map(str::parse::<WorkflowStatus>)
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let filter = WorkflowFilter {
                status,
                offset,
                limit,
            };
            let session = super::open_session(config, false)?;
            let listings = session.list_workflows(&filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&listings)?);
            } else {
                render::print_listings(&listings);
            }
        }
        WorkflowCommands::Delete { workflow_id, force } => {
            let session = super::open_session(config, false)?;
            session.delete_workflow(&workflow_id, force).await?;
            println!("{} Deleted workflow {}", style("-").red().bold(), workflow_id);
        }
    }
    Ok(())
}
