//! Clinical note workflow orchestration.
//!
//! A raw clinical note flows through five agent phases (documentation,
//! coding, compliance, prior authorization, quality assurance). Full mode
//! runs them back to back via [`pipeline::PipelineCoordinator::process`];
//! step mode runs one phase at a time under human review via
//! [`session::ReviewSession`].

pub mod agent;
pub mod config;
pub mod errors;
pub mod logging;
pub mod pipeline;
pub mod session;
pub mod store;
