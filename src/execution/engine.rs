//! Flow Execution Engine
//!
//! The core engine that orchestrates flow runs including:
//! - Strictly sequential top-level steps in declared order
//! - Conditional gating against the Context Store
//! - Parallel groups with a fan-out/fan-in barrier
//! - Abort handling at step and barrier boundaries
//! - Escalation routing and outcome reporting
//!
//! A [`FlowEngine`] is built once per definition and shared; every call to
//! [`FlowEngine::start`] creates an independent [`FlowRun`] owning its own
//! Context Store and a unique run id.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, error, info};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::flow::{prepare_flow, FlowDefinition, StepDescriptor, StepKind};
use crate::monitoring::ExecutionTimeline;

use super::capability::CapabilityRegistry;
use super::context::ContextStore;
use super::step::{ExecutionResult, StepExecutor, StepStatus};

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowState {
    Pending,
    Running,
    Completed,
    Aborted,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Aborted,
}

impl From<RunStatus> for FlowState {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Completed => FlowState::Completed,
            RunStatus::Aborted => FlowState::Aborted,
        }
    }
}

/// The step and error that aborted a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbortInfo {
    pub step: String,
    pub error: String,
}

/// Aggregated outcome of one flow run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    /// Unique id of this run
    pub run_id: String,
    /// Id of the flow that ran
    pub flow_id: String,
    /// Completed or aborted
    pub status: RunStatus,
    /// Per-step results in resolution order
    pub results: Vec<ExecutionResult>,
    /// Escalation outcome tag, if one was produced
    pub outcome: Option<String>,
    /// Output of the last successful step
    pub output: Option<Value>,
    /// Triggering step and error when aborted
    pub abort: Option<AbortInfo>,
    /// Final Context Store, for external persistence
    pub context: ContextStore,
    /// Start/end events of every step
    pub timeline: ExecutionTimeline,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    /// Returns true if the run reached the end of the flow.
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Terminal lifecycle state of the run.
    pub fn state(&self) -> FlowState {
        self.status.into()
    }

    /// Finds the result recorded for a step.
    pub fn result(&self, step: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.step == step)
    }

    /// Step names paired with their status, in resolution order.
    pub fn statuses(&self) -> Vec<(&str, StepStatus)> {
        self.results
            .iter()
            .map(|r| (r.step.as_str(), r.status))
            .collect()
    }
}

/// Shared, validated engine for one flow definition.
///
/// Cheap to clone; any number of runs may execute concurrently.
///
/// # Example
///
/// ```rust,no_run
/// use medflow::execution::{CapabilityRegistry, FlowEngine};
/// use medflow::flow::{FlowDefinition, StepDescriptor};
/// use serde_json::json;
///
/// # async fn demo(registry: CapabilityRegistry) -> Result<(), Box<dyn std::error::Error>> {
/// let flow = FlowDefinition::new("triage_only", "Triage a case")
///     .with_step(StepDescriptor::agent("triage"));
///
/// let engine = FlowEngine::new(flow, registry)?;
/// let result = engine.run(json!({"case": "chest pain"})).await;
/// println!("{:?}", result.status);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FlowEngine {
    flow: Arc<FlowDefinition>,
    executor: StepExecutor,
}

impl FlowEngine {
    /// Prepares, validates and binds a flow to its capabilities.
    ///
    /// Attaches the escalation condition if the definition leaves it
    /// implicit, then fails if the flow is structurally invalid or any step
    /// targets an unregistered capability.
    pub fn new(flow: FlowDefinition, registry: CapabilityRegistry) -> Result<Self, ConfigError> {
        let flow = prepare_flow(flow)?;
        registry.ensure_resolvable(&flow)?;

        let flow = Arc::new(flow);
        let executor = StepExecutor::new(Arc::new(registry), Arc::clone(&flow));
        Ok(Self { flow, executor })
    }

    /// The definition this engine executes.
    pub fn flow(&self) -> &FlowDefinition {
        &self.flow
    }

    /// Creates a pending run seeded with `input` under a fresh run id.
    pub fn start(&self, input: Value) -> FlowRun {
        self.start_with_id(Uuid::new_v4().to_string(), input)
    }

    /// Creates a pending run with a caller-chosen id, e.g. a request id.
    pub fn start_with_id(&self, run_id: impl Into<String>, input: Value) -> FlowRun {
        FlowRun {
            run_id: run_id.into(),
            flow: Arc::clone(&self.flow),
            executor: self.executor.clone(),
            context: ContextStore::with_input(input),
            results: Vec::new(),
            timeline: ExecutionTimeline::new(),
        }
    }

    /// Runs the flow to completion on `input`.
    pub async fn run(&self, input: Value) -> RunResult {
        self.start(input).execute().await
    }
}

/// One invocation of a flow, owning its Context Store.
///
/// A `FlowRun` is [`FlowState::Pending`] for as long as it exists:
/// [`FlowRun::execute`] consumes it, and the terminal state is read from
/// the returned [`RunResult`].
#[derive(Debug)]
pub struct FlowRun {
    run_id: String,
    flow: Arc<FlowDefinition>,
    executor: StepExecutor,
    context: ContextStore,
    results: Vec<ExecutionResult>,
    timeline: ExecutionTimeline,
}

impl FlowRun {
    /// Unique id of this run.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Context Store as seeded so far.
    pub fn context(&self) -> &ContextStore {
        &self.context
    }

    /// Executes every top-level step in order and assembles the run result.
    pub async fn execute(mut self) -> RunResult {
        let flow = Arc::clone(&self.flow);
        let started_at = Utc::now();

        info!(
            "Starting flow '{}' run {} ({} top-level steps)",
            flow.id,
            self.run_id,
            flow.steps.len()
        );

        let mut abort = None;
        for step in &flow.steps {
            abort = match &step.kind {
                StepKind::Single { .. } => self.run_single(step).await,
                StepKind::Parallel { children } => self.run_group(step, children).await,
            };
            if abort.is_some() {
                break;
            }
        }

        let status = match &abort {
            Some(AbortInfo { step, error: cause }) => {
                error!(
                    "Flow '{}' run {} aborted at step '{}': {}",
                    flow.id, self.run_id, step, cause
                );
                RunStatus::Aborted
            }
            None => {
                info!("Flow '{}' run {} completed", flow.id, self.run_id);
                RunStatus::Completed
            }
        };

        let outcome = flow
            .escalation
            .as_ref()
            .and_then(|policy| policy.outcome(&flow, &self.context));
        let output = self
            .results
            .iter()
            .rev()
            .find(|r| r.status == StepStatus::Success)
            .and_then(|r| r.output.clone());

        RunResult {
            run_id: self.run_id,
            flow_id: flow.id.clone(),
            status,
            results: self.results,
            outcome,
            output,
            abort,
            context: self.context,
            timeline: self.timeline,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn run_single(&mut self, step: &StepDescriptor) -> Option<AbortInfo> {
        let result = if admits(&self.flow, step, &self.context) {
            info!("Starting step: {}", step.name);
            self.executor.execute(step, &mut self.context).await
        } else {
            ExecutionResult::condition_false(step)
        };

        let abort = abort_info(&result);
        self.record(result);
        abort
    }

    async fn run_group(
        &mut self,
        group: &StepDescriptor,
        children: &[StepDescriptor],
    ) -> Option<AbortInfo> {
        if !admits(&self.flow, group, &self.context) {
            for child in children {
                self.record(ExecutionResult::condition_false(child).in_group(&group.name));
            }
            return None;
        }

        info!(
            "Starting parallel group '{}' ({} steps)",
            group.name,
            children.len()
        );

        let flow = self.flow.as_ref();
        let context = &self.context;
        let executor = &self.executor;
        let results = join_all(children.iter().map(|child| async move {
            if admits(flow, child, context) {
                executor.run(child, context).await
            } else {
                ExecutionResult::condition_false(child)
            }
        }))
        .await;

        debug!("Parallel group '{}' reached its barrier", group.name);

        let mut abort = None;
        for (child, result) in children.iter().zip(results) {
            StepExecutor::commit(child, &result, &mut self.context);
            if abort.is_none() {
                abort = abort_info(&result);
            }
            self.record(result.in_group(&group.name));
        }
        abort
    }

    fn record(&mut self, result: ExecutionResult) {
        self.timeline.record(&result);
        self.results.push(result);
    }
}

/// Evaluates a step's condition, logging escalation decisions on the way.
fn admits(flow: &FlowDefinition, step: &StepDescriptor, context: &ContextStore) -> bool {
    if let Some(policy) = flow.escalation.as_ref().filter(|p| p.to == step.name) {
        info!(
            "Escalation '{}' -> '{}': {:?}",
            policy.from,
            policy.to,
            policy.decide(flow, context)
        );
    }

    match &step.condition {
        None => true,
        Some(condition) => {
            let admitted = condition.evaluate(context);
            if !admitted {
                info!("Skipping step '{}': condition `{}` is false", step.name, condition);
            }
            admitted
        }
    }
}

fn abort_info(result: &ExecutionResult) -> Option<AbortInfo> {
    if !result.is_abort() {
        return None;
    }
    Some(AbortInfo {
        step: result.step.clone(),
        error: result
            .error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default(),
    })
}
