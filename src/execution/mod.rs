//! Flow Execution Module
//!
//! Provides the core engine for running flow definitions against
//! registered agents and tools.
//!
//! # Architecture
//!
//! - [`engine`]: Flow engine orchestrating runs and parallel barriers
//! - [`step`]: Individual step execution with retry and error policies
//! - [`capability`]: The agent/tool boundary and its registry
//! - [`context`]: Per-run Context Store
//! - [`escalation`]: Divergence-driven routing to an arbitration step

pub mod capability;
pub mod context;
pub mod engine;
pub mod escalation;
pub mod step;

#[cfg(test)]
pub(crate) mod testing;

pub use capability::{
    invoke_bounded, Capability, CapabilityOutcome, CapabilityRegistry, CapabilityRequest,
};
pub use context::{ContextStore, INPUT_KEY};
pub use engine::{AbortInfo, FlowEngine, FlowRun, FlowState, RunResult, RunStatus};
pub use escalation::{EscalationDecision, EscalationPolicy};
pub use step::{ExecutionResult, SkipReason, StepExecutor, StepStatus};
