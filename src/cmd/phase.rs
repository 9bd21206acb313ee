//! Reviewer phase commands: `clinical-bridge phase run|show|edit|approve`.

use anyhow::Result;
use console::style;

use clinical_bridge::config::BridgeConfig;
use clinical_bridge::pipeline::PhaseStatus;
use clinical_bridge::session::parse_phase;

use super::super::PhaseCommands;
use super::render;

pub async fn cmd_phase(config: &BridgeConfig, command: PhaseCommands) -> Result<()> {
    match command {
        PhaseCommands::Run { workflow_id, phase } => {
            let phase = parse_phase(&phase)?;
            let session = super::open_session(config, true)?;

            println!("Running {} for workflow {}...", phase, workflow_id);
            let record = session.run_phase_and_wait(&workflow_id, phase).await?;
            render::print_phase(&record);

            if record.status == PhaseStatus::Failed {
                anyhow::bail!(
                    "Phase {} failed: {}",
                    phase,
                    record.error.as_deref().unwrap_or("unknown error")
                );
            }
            println!(
                "{}",
                style(format!(
                    "Review, then: clinical-bridge phase approve {} {}",
                    workflow_id, phase
                ))
                .dim()
            );
        }
        PhaseCommands::Show { workflow_id, phase } => {
            let phase = parse_phase(&phase)?;
            let session = super::open_session(config, false)?;
            let record = session.get_phase(&workflow_id, phase).await?;
            render::print_phase(&record);
        }
        PhaseCommands::Edit {
            workflow_id,
            phase,
            content,
            file,
            reviewer,
        } => {
            let phase = parse_phase(&phase)?;
            let content = match (content, file) {
                (Some(content), _) => content,
                (None, Some(path)) => super::read_text(&path)?,
                (None, None) => anyhow::bail!("Provide --content or --file"),
            };
            let session = super::open_session(config, false)?;
            session
                .edit_phase(&workflow_id, phase, content, reviewer)
                .await?;
            println!("{} Updated {} output", style("+").green().bold(), phase);
        }
        PhaseCommands::Approve {
            workflow_id,
            phase,
            reviewer,
        } => {
            let phase = parse_phase(&phase)?;
            let session = super::open_session(config, false)?;
            let approval = session.approve_phase(&workflow_id, phase, reviewer).await?;

            println!("{} Approved {}", style("+").green().bold(), approval.phase);
            match approval.next_phase {
                Some(next) => println!("Next phase: {}", style(next).cyan()),
                None => println!("Workflow {} is {}", workflow_id, approval.workflow_status),
            }
        }
    }
    Ok(())
}
