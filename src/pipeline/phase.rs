//! Phase graph for the clinical review pipeline.
//!
//! This module provides:
//! - `PhaseId`, the fixed set of pipeline phases in execution order
//! - `PhasePolicy`, the per-phase failure/skip classification
//! - `next_phase`, the conditional transition function used by step mode

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// One discrete pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseId {
    Documentation,
    Coding,
    Compliance,
    PriorAuth,
    QualityAssurance,
}

/// Phases in execution order.
pub const PHASE_ORDER: [PhaseId; 5] = [
    PhaseId::Documentation,
    PhaseId::Coding,
    PhaseId::Compliance,
    PhaseId::PriorAuth,
    PhaseId::QualityAssurance,
];

/// How the full-mode coordinator treats a phase that fails or is not applicable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhasePolicy {
    /// A failure halts the run and fails the workflow.
    Fatal,
    /// A failure is recorded and the run continues.
    NonFatal,
    /// Runs only when its inputs are available, otherwise skipped. Failure is non-fatal.
    ConditionalSkip,
    /// A failure leaves output unverified: the workflow needs human review.
    Degrade,
}

impl PhaseId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Documentation => "documentation",
            Self::Coding => "coding",
            Self::Compliance => "compliance",
            Self::PriorAuth => "prior_auth",
            Self::QualityAssurance => "quality_assurance",
        }
    }

    /// Name of the agent that handles this phase.
    pub fn agent_name(&self) -> &'static str {
        match self {
            Self::Documentation => "clinical_documentation",
            Self::Coding => "medical_coding",
            Self::Compliance => "compliance",
            Self::PriorAuth => "prior_authorization",
            Self::QualityAssurance => "quality_assurance",
        }
    }

    pub fn policy(&self) -> PhasePolicy {
        match self {
            Self::Documentation | Self::Coding | Self::Compliance => PhasePolicy::Fatal,
            Self::PriorAuth => PhasePolicy::ConditionalSkip,
            Self::QualityAssurance => PhasePolicy::Degrade,
        }
    }

    /// Position in `PHASE_ORDER`.
    pub fn index(&self) -> usize {
        match self {
            Self::Documentation => 0,
            Self::Coding => 1,
            Self::Compliance => 2,
            Self::PriorAuth => 3,
            Self::QualityAssurance => 4,
        }
    }

    pub fn first() -> Self {
        PHASE_ORDER[0]
    }

    pub fn is_last(&self) -> bool {
        self.index() == PHASE_ORDER.len() - 1
    }
}

impl std::fmt::Display for PhaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for PhaseId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "documentation" => Ok(Self::Documentation),
            "coding" => Ok(Self::Coding),
            "compliance" => Ok(Self::Compliance),
            "prior_auth" => Ok(Self::PriorAuth),
            "quality_assurance" => Ok(Self::QualityAssurance),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Whether prior authorization applies to a workflow with these inputs.
pub fn prior_auth_applies(
    skip_prior_auth: bool,
    payer: Option<&str>,
    procedure: Option<&str>,
) -> bool {
    !skip_prior_auth && is_present(payer) && is_present(procedure)
}

pub(crate) fn is_present(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.is_empty())
}

/// Phase that follows `current`, or `None` after the last phase.
///
/// `prior_auth` is bypassed in favour of `quality_assurance` when it does
/// not apply (see [`prior_auth_applies`]).
pub fn next_phase(
    current: PhaseId,
    skip_prior_auth: bool,
    payer: Option<&str>,
    procedure: Option<&str>,
) -> Option<PhaseId> {
    let next = *PHASE_ORDER.get(current.index() + 1)?;
    if next == PhaseId::PriorAuth && !prior_auth_applies(skip_prior_auth, payer, procedure) {
        return Some(PhaseId::QualityAssurance);
    }
    Some(next)
}

/// String-level variant of [`next_phase`]. Unrecognised names stop advancing.
pub fn next_phase_name(
    current: &str,
    skip_prior_auth: bool,
    payer: Option<&str>,
    procedure: Option<&str>,
) -> Option<&'static str> {
    let current = current.parse::<PhaseId>().ok()?;
    next_phase(current, skip_prior_auth, payer, procedure).map(|p| p.as_str())
}
