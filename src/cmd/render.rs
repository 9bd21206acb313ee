//! Terminal rendering for workflows and phases.

use console::style;
use std::time::Duration;

use clinical_bridge::pipeline::{PhaseRecord, PhaseStatus, WorkflowRecord, WorkflowStatus};
use clinical_bridge::store::WorkflowListing;

pub fn status_icon(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Completed => "+",
        PhaseStatus::Failed => "X",
        PhaseStatus::Skipped => "-",
        PhaseStatus::Running => "~",
        PhaseStatus::Pending => ".",
    }
}

pub fn format_duration(duration: Option<Duration>) -> String {
    match duration {
        Some(d) if d.as_secs() >= 60 => format!("{}m{:02}s", d.as_secs() / 60, d.as_secs() % 60),
        Some(d) => format!("{:.1}s", d.as_secs_f64()),
        None => "-".to_string(),
    }
}

fn styled_icon(status: PhaseStatus) -> String {
    let icon = status_icon(status);
    match status {
        PhaseStatus::Completed => style(icon).green().bold().to_string(),
        PhaseStatus::Failed => style(icon).red().bold().to_string(),
        PhaseStatus::Running => style(icon).yellow().to_string(),
        PhaseStatus::Skipped | PhaseStatus::Pending => style(icon).dim().to_string(),
    }
}

fn styled_status(status: WorkflowStatus) -> String {
    let text = status.to_string();
    match status {
        WorkflowStatus::Completed => style(text).green().bold().to_string(),
        WorkflowStatus::Failed => style(text).red().bold().to_string(),
        WorkflowStatus::NeedsReview => style(text).yellow().bold().to_string(),
        WorkflowStatus::Pending | WorkflowStatus::InProgress => style(text).cyan().to_string(),
    }
}

pub fn print_workflow(workflow: &WorkflowRecord) {
    println!();
    println!(
        "Workflow {} {}",
        style(&workflow.workflow_id).bold(),
        styled_status(workflow.status)
    );
    println!(
        "  duration {}  tokens {}",
        format_duration(workflow.total_duration()),
        workflow.total_usage().total()
    );
    if let Some(current) = workflow.current_phase {
        println!("  current phase: {}", style(current).cyan());
    }
    println!();

    for record in &workflow.phases {
        println!(
            "  {} {:<18} {:<10} {:>8} {:>8}",
            styled_icon(record.status),
            record.phase,
            record.status,
            format_duration(record.duration()),
            record.usage.total()
        );
        if let Some(error) = &record.error {
            println!("      {}", style(error).red());
        }
    }
    println!();
}

pub fn print_listings(listings: &[WorkflowListing]) {
    if listings.is_empty() {
        println!("No workflows found");
        return;
    }
    println!(
        "{}",
        style(format!(
            "{:<36}  {:<12}  {:<18}  {:<12}  {:>8}  {}",
            "ID", "STATUS", "PHASE", "PATIENT", "TOKENS", "CREATED"
        ))
        .bold()
    );
    for listing in listings {
        println!(
            "{:<36}  {:<12}  {:<18}  {:<12}  {:>8}  {}",
            listing.workflow_id,
            listing.status,
            listing
                .current_phase
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            listing.patient_id.as_deref().unwrap_or("-"),
            listing.total_tokens.total(),
            listing.created_at.format("%Y-%m-%d %H:%M")
        );
    }
}

pub fn print_phase(record: &PhaseRecord) {
    println!();
    println!(
        "{} {} {}",
        styled_icon(record.status),
        style(record.phase).bold(),
        record.status
    );
    if let Some(reviewer) = &record.reviewed_by {
        println!("  reviewed by {}", reviewer);
    }
    if let Some(error) = &record.error {
        println!("  {}", style(error).red());
    }
    let content = record.effective_content();
    if !content.is_empty() {
        if record.edited_content.is_some() {
            println!("  {}", style("(edited)").dim());
        }
        println!();
        println!("{}", content);
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_icons() {
        assert_eq!(status_icon(PhaseStatus::Completed), "+");
        assert_eq!(status_icon(PhaseStatus::Failed), "X");
        assert_eq!(status_icon(PhaseStatus::Skipped), "-");
        assert_eq!(status_icon(PhaseStatus::Running), "~");
        assert_eq!(status_icon(PhaseStatus::Pending), ".");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(None), "-");
        assert_eq!(format_duration(Some(Duration::from_millis(1500))), "1.5s");
        assert_eq!(format_duration(Some(Duration::from_secs(125))), "2m05s");
    }
}
