//! Text-generation seam for pipeline phases.
//!
//! The coordinator talks to a `PhaseAgent`, never to a provider directly.
//! A call ends in one of three ways:
//! - `Ok(AgentOutcome::Completed)`: content plus token usage
//! - `Ok(AgentOutcome::Failed)`: the provider reported a problem; retryable
//! - `Err(_)`: a fault; never retried

pub mod anthropic;
pub mod prompts;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::pipeline::phase::PhaseId;
use crate::pipeline::state::TokenUsage;

pub use anthropic::AnthropicAgent;

/// Result of a single generation call that did not fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Completed { content: String, usage: TokenUsage },
    Failed { error: String },
}

impl AgentOutcome {
    pub fn completed(content: impl Into<String>, usage: TokenUsage) -> Self {
        Self::Completed {
            content: content.into(),
            usage,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Phase-specific material the agent works from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseInputs {
    Documentation {
        raw_note: String,
    },
    Coding {
        documentation: String,
    },
    Compliance {
        documentation: String,
        coding: String,
    },
    PriorAuth {
        procedure: String,
        payer: String,
        documentation: String,
    },
    QualityAssurance {
        raw_note: String,
        documentation: String,
        coding: String,
        /// Empty when compliance has not produced output
        compliance: String,
    },
}

impl PhaseInputs {
    pub fn phase(&self) -> PhaseId {
        match self {
            Self::Documentation { .. } => PhaseId::Documentation,
            Self::Coding { .. } => PhaseId::Coding,
            Self::Compliance { .. } => PhaseId::Compliance,
            Self::PriorAuth { .. } => PhaseId::PriorAuth,
            Self::QualityAssurance { .. } => PhaseId::QualityAssurance,
        }
    }
}

/// Everything an agent needs for one phase call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRequest {
    pub inputs: PhaseInputs,
    /// Ordered key/value context (patient id, payer, caller extras)
    pub context: BTreeMap<String, String>,
}

impl PhaseRequest {
    pub fn new(inputs: PhaseInputs, context: BTreeMap<String, String>) -> Self {
        Self { inputs, context }
    }

    pub fn phase(&self) -> PhaseId {
        self.inputs.phase()
    }

    pub fn agent_name(&self) -> &'static str {
        self.phase().agent_name()
    }

    /// The user turn sent to the provider: the task prompt, prefixed by a
    /// context block when any context is present.
    pub fn user_message(&self) -> String {
        let task = prompts::task_prompt(&self.inputs);
        if self.context.is_empty() {
            return task;
        }
        let context = self
            .context
            .iter()
            .map(|(key, value)| format!("**{}**: {}", key, value))
            .collect::<Vec<_>>()
            .join("\n");
        format!("## Context\n{}\n\n## Task\n{}", context, task)
    }
}

/// A provider able to run any pipeline phase.
#[async_trait]
pub trait PhaseAgent: Send + Sync {
    async fn generate(&self, request: &PhaseRequest) -> anyhow::Result<AgentOutcome>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted agent double used by coordinator and session tests.

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum Reply {
        Complete(String),
        Fail(String),
        Fault(String),
    }

    /// Replays queued replies per phase. An empty queue completes with
    /// `"<phase> output"` and 10/5 tokens.
    #[derive(Default)]
    pub struct ScriptedAgent {
        replies: Mutex<HashMap<PhaseId, VecDeque<Reply>>>,
        calls: Mutex<Vec<PhaseRequest>>,
    }

    impl ScriptedAgent {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(self, phase: PhaseId, reply: Reply) -> Self {
            self.replies
                .lock()
                .unwrap()
                .entry(phase)
                .or_default()
                .push_back(reply);
            self
        }

        pub fn calls(&self) -> Vec<PhaseRequest> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls_for(&self, phase: PhaseId) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.phase() == phase)
                .count()
        }
    }

    #[async_trait]
    impl PhaseAgent for ScriptedAgent {
        async fn generate(&self, request: &PhaseRequest) -> anyhow::Result<AgentOutcome> {
            self.calls.lock().unwrap().push(request.clone());
            let phase = request.phase();
            let reply = self
                .replies
                .lock()
                .unwrap()
                .get_mut(&phase)
                .and_then(|q| q.pop_front());
            match reply {
                None => Ok(AgentOutcome::completed(
                    format!("{} output", phase),
                    TokenUsage::new(10, 5),
                )),
                Some(Reply::Complete(content)) => {
                    Ok(AgentOutcome::completed(content, TokenUsage::new(10, 5)))
                }
                Some(Reply::Fail(error)) => Ok(AgentOutcome::failed(error)),
                Some(Reply::Fault(msg)) => Err(anyhow::anyhow!(msg)),
            }
        }
    }
}
