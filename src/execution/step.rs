//! Individual Step Execution
//!
//! Handles the execution of a single capability step including:
//! - Capability resolution
//! - Per-invocation timeout
//! - Retry with exponential backoff and jitter
//! - Error policy resolution (retry / skip / abort)
//! - Writing the output into the Context Store

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::{CapabilityError, StepError};
use crate::flow::{FlowDefinition, OnError, RetryPolicy, StepDescriptor, StepKind};

use super::capability::{invoke_bounded, CapabilityRegistry, CapabilityRequest};
use super::context::ContextStore;

/// Terminal status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

/// Why a step ended up skipped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// The step's condition evaluated to false.
    ConditionFalse,
    /// The step failed under `on_error: skip`.
    FailureAbsorbed(String),
}

/// Record of one step's execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    /// Step name
    pub step: String,
    /// Enclosing parallel group, if any
    pub group: Option<String>,
    /// Terminal status
    pub status: StepStatus,
    /// Capability output (success only)
    pub output: Option<Value>,
    /// Failure cause (present iff failed)
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<StepError>,
    /// Why the step was skipped (skipped only)
    pub skip_reason: Option<SkipReason>,
    /// Capability invocations actually made
    pub attempts: u32,
    /// Error policy the step ran under
    pub on_error: OnError,
    /// When the step started resolving
    pub started_at: DateTime<Utc>,
    /// When the step reached its terminal status
    pub finished_at: DateTime<Utc>,
}

fn serialize_error<S: Serializer>(error: &Option<StepError>, serializer: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(err) => serializer.serialize_some(&err.to_string()),
        None => serializer.serialize_none(),
    }
}

impl ExecutionResult {
    /// Result for a step whose condition was false; nothing was invoked.
    pub fn condition_false(step: &StepDescriptor) -> Self {
        let now = Utc::now();
        Self {
            step: step.name.clone(),
            group: None,
            status: StepStatus::Skipped,
            output: None,
            error: None,
            skip_reason: Some(SkipReason::ConditionFalse),
            attempts: 0,
            on_error: step.on_error,
            started_at: now,
            finished_at: now,
        }
    }

    /// Marks the result as belonging to a parallel group.
    pub fn in_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    /// Returns true if this failure must abort the flow.
    pub fn is_abort(&self) -> bool {
        self.status == StepStatus::Failed && self.on_error == OnError::Abort
    }

    /// Wall-clock time spent resolving the step.
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Runs single capability steps on behalf of the flow engine.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    registry: Arc<CapabilityRegistry>,
    flow: Arc<FlowDefinition>,
}

impl StepExecutor {
    /// Creates an executor resolving targets through `registry`.
    pub fn new(registry: Arc<CapabilityRegistry>, flow: Arc<FlowDefinition>) -> Self {
        Self { registry, flow }
    }

    /// Executes a step and writes its output into the Context Store on success.
    pub async fn execute(&self, step: &StepDescriptor, context: &mut ContextStore) -> ExecutionResult {
        let result = self.run(step, context).await;
        Self::commit(step, &result, context);
        result
    }

    /// Executes a step against a read-only Context Store without writing.
    ///
    /// Used for parallel groups, where the engine commits all outputs after
    /// the barrier.
    pub async fn run(&self, step: &StepDescriptor, context: &ContextStore) -> ExecutionResult {
        let started_at = Utc::now();

        let StepKind::Single { capability, target } = &step.kind else {
            error!("Step '{}' is a parallel group and cannot be invoked directly", step.name);
            let err = CapabilityError::Unresolved {
                capability: step.name.clone(),
            };
            return Self::resolve_failure(step, StepError::Invocation(err), 0, started_at);
        };

        let Some(handle) = self.registry.resolve(*capability, target) else {
            let err = CapabilityError::Unresolved {
                capability: target.clone(),
            };
            return Self::resolve_failure(step, StepError::Invocation(err), 0, started_at);
        };

        let policy = &step.retry_policy;
        let max_attempts = policy.max_attempts.max(1);
        let overrides = self.flow.overrides_for(&step.name);
        let mut attempt = 0;

        let last_error = loop {
            attempt += 1;
            debug!("Step '{}': attempt {}/{}", step.name, attempt, max_attempts);

            let request = CapabilityRequest {
                step: &step.name,
                attempt,
                context,
                overrides,
            };

            match invoke_bounded(handle.as_ref(), target, request, step.timeout).await {
                Ok(output) => {
                    info!(
                        "Step '{}' succeeded after {} attempt(s)",
                        step.name, attempt
                    );
                    return ExecutionResult {
                        step: step.name.clone(),
                        group: None,
                        status: StepStatus::Success,
                        output: Some(output),
                        error: None,
                        skip_reason: None,
                        attempts: attempt,
                        on_error: step.on_error,
                        started_at,
                        finished_at: Utc::now(),
                    };
                }
                Err(err) if attempt >= max_attempts => break err,
                Err(err) => {
                    let delay = backoff_delay(policy, attempt);
                    warn!(
                        "Step '{}' attempt {}/{} failed: {}. Retrying in {:?}",
                        step.name, attempt, max_attempts, err, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let error = if max_attempts > 1 {
            StepError::RetryExhausted {
                attempts: attempt,
                last: last_error,
            }
        } else {
            StepError::Invocation(last_error)
        };

        Self::resolve_failure(step, error, attempt, started_at)
    }

    /// Writes a successful result's output under the step's output key.
    pub fn commit(step: &StepDescriptor, result: &ExecutionResult, context: &mut ContextStore) {
        if let (StepStatus::Success, Some(output)) = (result.status, &result.output) {
            context.set(step.output_key.clone(), output.clone());
        }
    }

    /// Applies the step's error policy to a terminal failure.
    fn resolve_failure(
        step: &StepDescriptor,
        error: StepError,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) -> ExecutionResult {
        let mut result = ExecutionResult {
            step: step.name.clone(),
            group: None,
            status: StepStatus::Failed,
            output: None,
            error: None,
            skip_reason: None,
            attempts,
            on_error: step.on_error,
            started_at,
            finished_at: Utc::now(),
        };

        match step.on_error {
            OnError::Skip => {
                warn!("Step '{}' failed and was skipped: {}", step.name, error);
                result.status = StepStatus::Skipped;
                result.skip_reason = Some(SkipReason::FailureAbsorbed(error.to_string()));
            }
            OnError::Retry => {
                warn!("Step '{}' failed: {}", step.name, error);
                result.error = Some(error);
            }
            OnError::Abort => {
                error!("Step '{}' failed (abort): {}", step.name, error);
                result.error = Some(error);
            }
        }

        result
    }
}

/// Delay before the retry following `attempt`, with jitter applied.
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let delay = policy.delay_before_retry(attempt);
    if policy.jitter <= 0.0 {
        return delay;
    }
    delay.mul_f64(1.0 + rand::random::<f64>() * policy.jitter)
}
