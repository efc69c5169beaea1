//! Error Types
//!
//! Typed errors for every stage of a flow's life:
//!
//! - [`LoadError`] / [`ConfigError`]: raised while loading and validating a
//!   flow definition. These are always fatal and never surface mid-run.
//! - [`ConditionError`]: malformed condition expressions, caught at load time.
//! - [`CapabilityError`] / [`StepError`]: failures of an agent or tool call.
//!   These are resolved per step according to its error policy and end up
//!   recorded in the run result rather than returned as `Err`.
//! - [`ContextError`]: lookups of missing context keys.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single capability (agent or tool) invocation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CapabilityError {
    /// The capability ran and reported a failure.
    #[error("capability '{capability}' failed: {message}")]
    Failed { capability: String, message: String },

    /// The invocation exceeded its time bound.
    #[error("capability '{capability}' timed out after {after:?}")]
    TimedOut { capability: String, after: Duration },

    /// No capability is registered under the requested id.
    #[error("capability '{capability}' is not registered")]
    Unresolved { capability: String },
}

/// Terminal failure of a step after its retry policy has been applied.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    #[error(transparent)]
    Invocation(CapabilityError),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        last: CapabilityError,
    },
}

impl StepError {
    /// Returns the capability error that ended the step.
    pub fn last_failure(&self) -> &CapabilityError {
        match self {
            Self::Invocation(err) => err,
            Self::RetryExhausted { last, .. } => last,
        }
    }
}

/// Malformed condition expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("condition is empty")]
    Empty,

    #[error("unexpected '{found}' at offset {offset} in condition")]
    UnexpectedToken { found: String, offset: usize },

    #[error("unterminated string literal starting at offset {0}")]
    UnterminatedString(usize),

    #[error("invalid literal '{0}'")]
    InvalidLiteral(String),

    #[error("expected a key path at offset {0}")]
    ExpectedPath(usize),

    #[error("expected a literal after comparison at offset {0}")]
    ExpectedLiteral(usize),
}

/// Structural problem with a flow definition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("flow must contain at least one step")]
    EmptyFlow,

    #[error("invalid flow id '{0}': only lowercase letters, digits, '_' and '-' are allowed")]
    InvalidId(String),

    #[error("invalid version '{0}': expected MAJOR.MINOR.PATCH[-PRERELEASE]")]
    InvalidVersion(String),

    #[error("{kind} step at position {position} has no name")]
    MissingName { kind: String, position: usize },

    #[error("duplicate step name: '{0}'")]
    DuplicateStepName(String),

    #[error("parallel group '{0}' has no children")]
    EmptyParallelGroup(String),

    #[error("parallel group '{group}' does not accept '{field}'; set it on each child step")]
    UnsupportedGroupField { group: String, field: &'static str },

    #[error("parallel group '{group}' contains nested parallel step at position {position}")]
    NestedParallel { group: String, position: usize },

    #[error("steps '{first}' and '{second}' both write context key '{key}'")]
    OutputKeyCollision {
        key: String,
        first: String,
        second: String,
    },

    #[error("step '{step}' uses reserved context key '{key}'")]
    ReservedKey { step: String, key: String },

    #[error("step '{step}' condition references '{reference}', which is not produced by an earlier step")]
    InvalidReference { step: String, reference: String },

    #[error("invalid condition on step '{step}': {source}")]
    InvalidCondition {
        step: String,
        #[source]
        source: ConditionError,
    },

    #[error("step '{step}' has an invalid retry policy: {reason}")]
    InvalidRetryPolicy { step: String, reason: String },

    #[error("invalid escalation policy: {0}")]
    InvalidEscalation(String),

    #[error("missing required environment variables for flow '{flow}': {}", .missing.join(", "))]
    MissingEnvironment { flow: String, missing: Vec<String> },

    #[error("step '{step}' targets unregistered {kind} '{target}'")]
    UnknownCapability {
        step: String,
        kind: String,
        target: String,
    },
}

/// Failure to load a flow definition from disk or text.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read flow definition '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("flow definition '{id}' not found at {path}")]
    NotFound { id: String, path: String },

    #[error("failed to parse flow definition YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Context Store lookup failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context key not found: '{0}'")]
    KeyNotFound(String),
}
