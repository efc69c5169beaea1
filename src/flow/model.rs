//! Flow Data Model
//!
//! Immutable, validated description of a pipeline: an ordered list of
//! [`StepDescriptor`]s (single capability calls or parallel groups) plus
//! flow-level metadata.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: dual_llm_v1
//! description: Triage, two specialists and divergence-driven arbitration
//! version: 1.0.0
//! env: [OPENAI_API_KEY]
//! flow:
//!   - type: agent
//!     name: triage
//!     on_error: abort
//!
//!   - type: parallel
//!     name: specialists
//!     agents:
//!       - name: specialist_a
//!         on_error: skip
//!       - name: specialist_b
//!         on_error: skip
//!
//!   - name: arbitration
//!     condition: divergence_check.outcome == "divergent"
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::condition::Condition;
use crate::execution::EscalationPolicy;

/// Namespace a step target is resolved in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Agent,
    Tool,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// Reaction to a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Retry per the retry policy; a step that exhausts its attempts is
    /// recorded as failed and the flow continues.
    #[default]
    Retry,
    /// Record the step as skipped and continue.
    Skip,
    /// Stop the flow once the current step (or group barrier) resolves.
    Abort,
}

impl fmt::Display for OnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Skip => write!(f, "skip"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// Attempt budget and backoff schedule for a step.
///
/// The delay before retry `n` (1-based) is
/// `base_delay * multiplier^(n-1)`, capped at `max_delay` and stretched by
/// up to `jitter` (a fraction) of itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total invocations allowed, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Growth factor applied per retry
    pub multiplier: f64,
    /// Upper bound for any single delay
    pub max_delay: Option<Duration>,
    /// Random stretch in `[0, jitter)` applied to each delay
    pub jitter: f64,
}

impl RetryPolicy {
    /// Policy making a single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: None,
            jitter: 0.0,
        }
    }

    /// Exponential schedule with the given attempt budget, base delay and multiplier.
    pub fn exponential(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier,
            max_delay: None,
            jitter: 0.0,
        }
    }

    /// Default policy for `on_error`, used when the step declares none.
    pub fn default_for(on_error: OnError) -> Self {
        match on_error {
            OnError::Retry => Self::default(),
            OnError::Skip | OnError::Abort => Self::none(),
        }
    }

    /// Caps every delay.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Sets the jitter fraction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait before retry number `retry` (1-based), without jitter.
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let delay = Duration::from_millis(millis.max(0.0).round() as u64);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Full delay schedule between attempts, without jitter.
    ///
    /// ```
    /// use std::time::Duration;
    /// use medflow::flow::RetryPolicy;
    ///
    /// let policy = RetryPolicy::exponential(4, Duration::from_secs(1), 2.0);
    /// assert_eq!(
    ///     policy.schedule(),
    ///     vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
    /// );
    /// ```
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts)
            .map(|retry| self.delay_before_retry(retry))
            .collect()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(1000), 2.0)
    }
}

/// What a step dispatches.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    /// One capability invocation.
    Single {
        capability: CapabilityKind,
        target: String,
    },
    /// Children executed concurrently behind a barrier.
    Parallel { children: Vec<StepDescriptor> },
}

/// One schedulable unit of a flow.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDescriptor {
    /// Unique name within the flow
    pub name: String,
    /// Single invocation or parallel group
    pub kind: StepKind,
    /// Failure reaction
    pub on_error: OnError,
    /// Attempt budget and backoff
    pub retry_policy: RetryPolicy,
    /// Gate evaluated before dispatch; absent means always run
    pub condition: Option<Condition>,
    /// Upper bound for a single invocation
    pub timeout: Option<Duration>,
    /// Context key receiving the step output
    pub output_key: String,
}

impl StepDescriptor {
    fn single(name: impl Into<String>, capability: CapabilityKind) -> Self {
        let name = name.into().trim().to_string();
        Self {
            kind: StepKind::Single {
                capability,
                target: name.clone(),
            },
            output_key: name.clone(),
            name,
            on_error: OnError::Retry,
            retry_policy: RetryPolicy::default(),
            condition: None,
            timeout: None,
        }
    }

    /// Creates an agent step targeting the agent registered under `name`.
    ///
    /// # Example
    ///
    /// ```
    /// use medflow::flow::{OnError, StepDescriptor};
    ///
    /// let step = StepDescriptor::agent("triage").with_on_error(OnError::Abort);
    /// assert_eq!(step.target(), Some("triage"));
    /// assert_eq!(step.retry_policy.max_attempts, 1);
    /// ```
    pub fn agent(name: impl Into<String>) -> Self {
        Self::single(name, CapabilityKind::Agent)
    }

    /// Creates a tool step targeting the tool registered under `name`.
    pub fn tool(name: impl Into<String>) -> Self {
        Self::single(name, CapabilityKind::Tool)
    }

    /// Creates a parallel group.
    pub fn parallel(name: impl Into<String>, children: Vec<StepDescriptor>) -> Self {
        let name = name.into().trim().to_string();
        Self {
            kind: StepKind::Parallel { children },
            output_key: name.clone(),
            name,
            on_error: OnError::Skip,
            retry_policy: RetryPolicy::none(),
            condition: None,
            timeout: None,
        }
    }

    /// Points the step at a capability id different from its name.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        if let StepKind::Single { target: t, .. } = &mut self.kind {
            *t = target.into();
        }
        self
    }

    /// Sets the error policy and resets the retry policy to its default.
    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self.retry_policy = RetryPolicy::default_for(on_error);
        self
    }

    /// Sets an explicit retry policy.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Gates the step on a condition.
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Bounds every invocation of the step.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Writes the output under a key other than the step name.
    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = key.into();
        self
    }

    /// Returns the capability id for single steps.
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Single { target, .. } => Some(target),
            StepKind::Parallel { .. } => None,
        }
    }

    /// Returns the children of a parallel group, or an empty slice.
    pub fn children(&self) -> &[StepDescriptor] {
        match &self.kind {
            StepKind::Parallel { children } => children,
            StepKind::Single { .. } => &[],
        }
    }

    /// Returns true for parallel groups.
    pub fn is_parallel(&self) -> bool {
        matches!(self.kind, StepKind::Parallel { .. })
    }
}

/// Complete, validated pipeline description.
///
/// Shared read-only between runs once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowDefinition {
    /// Slug identifier
    pub id: String,
    /// Human-readable summary
    pub description: String,
    /// SemVer of the definition
    pub version: Option<String>,
    /// Names of required environment variables
    pub env: Vec<String>,
    /// Top-level steps in execution order
    pub steps: Vec<StepDescriptor>,
    /// Opaque per-step parameters passed through to capabilities
    pub llm_overrides: HashMap<String, Value>,
    /// Divergence-driven branch, if the flow has one
    pub escalation: Option<EscalationPolicy>,
}

impl FlowDefinition {
    /// Creates an empty definition.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            version: None,
            env: Vec::new(),
            steps: Vec::new(),
            llm_overrides: HashMap::new(),
            escalation: None,
        }
    }

    /// Appends a top-level step.
    pub fn with_step(mut self, step: StepDescriptor) -> Self {
        self.steps.push(step);
        self
    }

    /// Sets the version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Declares a required environment variable.
    pub fn requires_env(mut self, name: impl Into<String>) -> Self {
        self.env.push(name.into());
        self
    }

    /// Attaches an override payload for a named step.
    pub fn with_override(mut self, step: impl Into<String>, params: Value) -> Self {
        self.llm_overrides.insert(step.into(), params);
        self
    }

    /// Installs an escalation policy.
    pub fn with_escalation(mut self, policy: EscalationPolicy) -> Self {
        self.escalation = Some(policy);
        self
    }

    /// Finds a step by name, searching inside parallel groups.
    pub fn step(&self, name: &str) -> Option<&StepDescriptor> {
        self.all_steps().find(|s| s.name == name)
    }

    /// Finds a step by name for modification.
    pub fn step_mut(&mut self, name: &str) -> Option<&mut StepDescriptor> {
        for step in &mut self.steps {
            if step.name == name {
                return Some(step);
            }
            if let StepKind::Parallel { children } = &mut step.kind {
                if let Some(child) = children.iter_mut().find(|c| c.name == name) {
                    return Some(child);
                }
            }
        }
        None
    }

    /// Iterates over every step, groups first followed by their children.
    pub fn all_steps(&self) -> impl Iterator<Item = &StepDescriptor> {
        self.steps
            .iter()
            .flat_map(|s| std::iter::once(s).chain(s.children().iter()))
    }

    /// Iterates over the steps that invoke a capability.
    pub fn invocable_steps(&self) -> impl Iterator<Item = &StepDescriptor> {
        self.all_steps().filter(|s| !s.is_parallel())
    }

    /// Override payload for a step, if any.
    pub fn overrides_for(&self, step: &str) -> Option<&Value> {
        self.llm_overrides.get(step)
    }

    /// Returns the number of top-level steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the flow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_step_defaults() {
        let step = StepDescriptor::agent("  triage ");

        assert_eq!(step.name, "triage");
        assert_eq!(step.output_key, "triage");
        assert_eq!(step.target(), Some("triage"));
        assert_eq!(step.on_error, OnError::Retry);
        assert_eq!(step.retry_policy, RetryPolicy::default());
        assert!(step.condition.is_none());
        assert!(!step.is_parallel());
    }

    #[test]
    fn test_with_on_error_resets_retry_policy() {
        let step = StepDescriptor::tool("rag_retrieval").with_on_error(OnError::Skip);
        assert_eq!(step.retry_policy.max_attempts, 1);

        let step = StepDescriptor::tool("rag_retrieval")
            .with_on_error(OnError::Abort)
            .with_retry(RetryPolicy::exponential(2, Duration::from_millis(10), 2.0));
        assert_eq!(step.retry_policy.max_attempts, 2);
    }

    #[test]
    fn test_with_target_and_output_key() {
        let step = StepDescriptor::agent("specialist_a")
            .with_target("medical_rag_agent")
            .with_output_key("report_a");

        assert_eq!(step.target(), Some("medical_rag_agent"));
        assert_eq!(step.output_key, "report_a");
    }

    #[test]
    fn test_parallel_children() {
        let group = StepDescriptor::parallel(
            "specialists",
            vec![StepDescriptor::agent("a"), StepDescriptor::agent("b")],
        );

        assert!(group.is_parallel());
        assert_eq!(group.children().len(), 2);
        assert_eq!(group.target(), None);
        assert!(StepDescriptor::agent("x").children().is_empty());
    }

    #[test]
    fn test_default_retry_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.schedule(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert!(RetryPolicy::none().schedule().is_empty());
    }

    #[test]
    fn test_retry_delay_capped() {
        let policy = RetryPolicy::exponential(6, Duration::from_secs(1), 2.0)
            .with_max_delay(Duration::from_secs(5));

        assert_eq!(policy.delay_before_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_before_retry(3), Duration::from_secs(4));
        assert_eq!(policy.delay_before_retry(4), Duration::from_secs(5));
        assert_eq!(policy.delay_before_retry(5), Duration::from_secs(5));
    }

    #[test]
    fn test_flow_step_lookup() {
        let flow = FlowDefinition::new("lookup", "lookup test")
            .with_step(StepDescriptor::agent("triage"))
            .with_step(StepDescriptor::parallel(
                "specialists",
                vec![StepDescriptor::agent("a"), StepDescriptor::agent("b")],
            ));

        assert_eq!(flow.len(), 2);
        assert!(flow.step("b").is_some());
        assert!(flow.step("specialists").is_some());
        assert!(flow.step("missing").is_none());
        assert_eq!(flow.all_steps().count(), 4);
        assert_eq!(
            flow.invocable_steps().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["triage", "a", "b"]
        );
    }

    #[test]
    fn test_flow_step_mut() {
        let mut flow = FlowDefinition::new("mutate", "mutation test").with_step(
            StepDescriptor::parallel("group", vec![StepDescriptor::agent("child")]),
        );

        flow.step_mut("child").unwrap().on_error = OnError::Abort;
        assert_eq!(flow.step("child").unwrap().on_error, OnError::Abort);
        assert!(flow.step_mut("missing").is_none());
    }

    #[test]
    fn test_overrides_passthrough() {
        let flow = FlowDefinition::new("overrides", "overrides test")
            .with_override("specialist_a", json!({"temperature": 0.2}));

        assert_eq!(
            flow.overrides_for("specialist_a"),
            Some(&json!({"temperature": 0.2}))
        );
        assert!(flow.overrides_for("specialist_b").is_none());
    }
}
