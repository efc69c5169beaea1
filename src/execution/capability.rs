//! Capability Boundary
//!
//! Agents and tools are external collaborators. The engine only knows how
//! to call them: by kind and id, with a read-only view of the Context Store,
//! receiving a discriminated success/failure outcome.
//!
//! Capabilities are resolved through a [`CapabilityRegistry`] checked
//! against the flow when an engine is built, so no step can reference an
//! unknown target at run time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CapabilityError, ConfigError};
use crate::flow::{CapabilityKind, FlowDefinition, StepKind};

use super::context::ContextStore;

/// Input handed to a capability for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct CapabilityRequest<'a> {
    /// Name of the step being executed
    pub step: &'a str,
    /// 1-based attempt number
    pub attempt: u32,
    /// Context Store as of the step's dispatch
    pub context: &'a ContextStore,
    /// Per-step parameters from the flow's `llm_overrides`
    pub overrides: Option<&'a Value>,
}

/// Result of one capability invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CapabilityOutcome {
    Success { output: Value },
    Failure { error: String },
}

impl CapabilityOutcome {
    /// Successful outcome carrying `output`.
    pub fn success(output: Value) -> Self {
        Self::Success { output }
    }

    /// Failed outcome with a description.
    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
        }
    }

    /// Returns true on success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// An agent or tool the engine can invoke.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Runs the capability once.
    async fn invoke(&self, request: CapabilityRequest<'_>) -> CapabilityOutcome;
}

/// Registered capabilities, split into agent and tool namespaces.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    agents: HashMap<String, Arc<dyn Capability>>,
    tools: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an agent, replacing any previous one with the same id.
    pub fn register_agent(&mut self, id: impl Into<String>, agent: Arc<dyn Capability>) {
        let id = id.into();
        debug!("Registered agent '{}'", id);
        self.agents.insert(id, agent);
    }

    /// Registers a tool, replacing any previous one with the same id.
    pub fn register_tool(&mut self, id: impl Into<String>, tool: Arc<dyn Capability>) {
        let id = id.into();
        debug!("Registered tool '{}'", id);
        self.tools.insert(id, tool);
    }

    /// Builder-style [`register_agent`](Self::register_agent).
    pub fn with_agent(mut self, id: impl Into<String>, agent: Arc<dyn Capability>) -> Self {
        self.register_agent(id, agent);
        self
    }

    /// Builder-style [`register_tool`](Self::register_tool).
    pub fn with_tool(mut self, id: impl Into<String>, tool: Arc<dyn Capability>) -> Self {
        self.register_tool(id, tool);
        self
    }

    /// Looks up a capability by kind and id.
    pub fn resolve(&self, kind: CapabilityKind, id: &str) -> Option<Arc<dyn Capability>> {
        let namespace = match kind {
            CapabilityKind::Agent => &self.agents,
            CapabilityKind::Tool => &self.tools,
        };
        namespace.get(id).cloned()
    }

    /// Checks that every step target of a flow is registered.
    pub fn ensure_resolvable(&self, flow: &FlowDefinition) -> Result<(), ConfigError> {
        for step in flow.invocable_steps() {
            if let StepKind::Single { capability, target } = &step.kind {
                if self.resolve(*capability, target).is_none() {
                    return Err(ConfigError::UnknownCapability {
                        step: step.name.clone(),
                        kind: capability.to_string(),
                        target: target.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Number of registered agents and tools.
    pub fn len(&self) -> usize {
        self.agents.len() + self.tools.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty() && self.tools.is_empty()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut agents: Vec<_> = self.agents.keys().collect();
        let mut tools: Vec<_> = self.tools.keys().collect();
        agents.sort();
        tools.sort();
        f.debug_struct("CapabilityRegistry")
            .field("agents", &agents)
            .field("tools", &tools)
            .finish()
    }
}

/// Invokes a capability once, optionally bounded by `timeout`.
///
/// A reported failure and an elapsed timeout both come back as
/// [`CapabilityError`], so retry and abort handling treat them alike.
pub async fn invoke_bounded(
    capability: &dyn Capability,
    target: &str,
    request: CapabilityRequest<'_>,
    timeout: Option<Duration>,
) -> Result<Value, CapabilityError> {
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, capability.invoke(request)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(CapabilityError::TimedOut {
                    capability: target.to_string(),
                    after: limit,
                })
            }
        },
        None => capability.invoke(request).await,
    };

    match outcome {
        CapabilityOutcome::Success { output } => Ok(output),
        CapabilityOutcome::Failure { error } => Err(CapabilityError::Failed {
            capability: target.to_string(),
            message: error,
        }),
    }
}
