//! Instructions and task prompts for each phase.

use crate::agent::PhaseInputs;
use crate::pipeline::phase::PhaseId;

/// System prompt for the agent that handles `phase`.
pub fn system_prompt(phase: PhaseId) -> &'static str {
    match phase {
        PhaseId::Documentation => {
            "You are a clinical documentation specialist. Turn unstructured physician notes \
into complete SOAP notes using precise medical terminology. Never invent findings that \
are not in the source note. List any documentation gaps and give coding hints."
        }
        PhaseId::Coding => {
            "You are a certified medical coding specialist. Suggest ICD-10-CM diagnosis codes \
and CPT procedure codes supported by the documentation, with a rationale for each code. \
Prefer the most specific code available and flag anything the documentation does not support."
        }
        PhaseId::Compliance => {
            "You are a healthcare compliance specialist. Check suggested codes against the \
clinical documentation and payer rules. Report every issue with its severity and a \
concrete correction."
        }
        PhaseId::PriorAuth => {
            "You are a prior authorization specialist. Decide whether the procedure needs \
prior authorization for the payer, cite the supporting clinical evidence, and assemble \
the request package."
        }
        PhaseId::QualityAssurance => {
            "You are a clinical quality assurance specialist. Perform the final review of the \
documentation, coding, and compliance output. Flag inconsistencies, missed conditions, \
and any content that cannot be traced back to the source note."
        }
    }
}

/// Task prompt carrying the phase inputs.
pub fn task_prompt(inputs: &PhaseInputs) -> String {
    match inputs {
        PhaseInputs::Documentation { raw_note } => format!(
            "Structure this physician note as a SOAP note and identify documentation gaps.\n\n\
             ## Physician Note\n{}",
            raw_note
        ),
        PhaseInputs::Coding { documentation } => format!(
            "Suggest ICD-10-CM and CPT codes for this documentation, with a rationale for \
             each code.\n\n## Clinical Documentation\n{}",
            documentation
        ),
        PhaseInputs::Compliance {
            documentation,
            coding,
        } => format!(
            "Validate these coding suggestions against the documentation and flag any \
             issues.\n\n## Clinical Documentation\n{}\n\n## Suggested Codes\n{}",
            documentation, coding
        ),
        PhaseInputs::PriorAuth {
            procedure,
            payer,
            documentation,
        } => format!(
            "Assess prior authorization requirements and assemble the request.\n\n\
             ## Procedure\n{}\n\n## Payer\n{}\n\n## Clinical Documentation\n{}",
            procedure, payer, documentation
        ),
        PhaseInputs::QualityAssurance {
            raw_note,
            documentation,
            coding,
            compliance,
        } => {
            let mut prompt = format!(
                "Review this pipeline output for consistency, accuracy, completeness, and \
                 untraceable content.\n\n## Original Physician Note\n{}\n\n\
                 ## Structured Documentation\n{}\n\n## Coding Suggestions\n{}",
                raw_note, documentation, coding
            );
            if !compliance.is_empty() {
                prompt.push_str("\n\n## Compliance Validation\n");
                prompt.push_str(compliance);
            }
            prompt
        }
    }
}
