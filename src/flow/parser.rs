//! Flow Parser
//!
//! Handles loading flow definitions from YAML documents:
//! - Raw document deserialization (`serde_yaml`)
//! - Conversion into [`FlowDefinition`] with defaults applied
//! - Condition parsing (malformed expressions fail here, never at run time)
//! - Validation and required environment checks
//! - Locating a definition by id in a configuration directory

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;

use super::condition::Condition;
use super::model::{FlowDefinition, OnError, RetryPolicy, StepDescriptor};
use super::validator::{is_valid_id, prepare_flow, validate_environment, ValidationMode};
use crate::error::{ConfigError, LoadError};
use crate::execution::EscalationPolicy;

/// Directory searched by [`FlowLocator::default`].
pub const DEFAULT_CONFIG_DIR: &str = "config/orchestrations";

/// Flow loaded when neither an explicit id nor [`FLOW_ID_ENV`] is given.
pub const DEFAULT_FLOW_ID: &str = "dual_llm_v1";

/// Environment variable selecting the flow id.
pub const FLOW_ID_ENV: &str = "ORCHESTRATION_ID";

#[derive(Debug, Deserialize)]
struct FlowDocument {
    id: String,
    description: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    env: Vec<String>,
    flow: Vec<StepEntry>,
    #[serde(default)]
    llm_overrides: HashMap<String, Value>,
    #[serde(default)]
    escalation: Option<EscalationPolicy>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EntryType {
    #[default]
    Agent,
    Tool,
    Parallel,
}

impl EntryType {
    fn label(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::Parallel => "parallel",
        }
    }
}

#[derive(Debug, Deserialize)]
struct StepEntry {
    #[serde(default, rename = "type")]
    kind: EntryType,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    on_error: Option<OnError>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    retry: Option<RetryEntry>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    output_key: Option<String>,
    #[serde(default, alias = "steps")]
    agents: Option<Vec<StepEntry>>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetryEntry {
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    multiplier: f64,
    #[serde(default)]
    max_delay_ms: Option<u64>,
    #[serde(default)]
    jitter: f64,
}

impl From<RetryEntry> for RetryPolicy {
    fn from(entry: RetryEntry) -> Self {
        let policy = RetryPolicy::exponential(
            entry.max_attempts,
            Duration::from_millis(entry.base_delay_ms),
            entry.multiplier,
        )
        .with_jitter(entry.jitter);

        match entry.max_delay_ms {
            Some(ms) => policy.with_max_delay(Duration::from_millis(ms)),
            None => policy,
        }
    }
}

impl StepEntry {
    /// First set field that only applies to capability steps.
    fn child_only_field(&self) -> Option<&'static str> {
        [
            ("target", self.target.is_some()),
            ("on_error", self.on_error.is_some()),
            ("retry", self.retry.is_some()),
            ("timeout_secs", self.timeout_secs.is_some()),
            ("output_key", self.output_key.is_some()),
        ]
        .into_iter()
        .find_map(|(field, set)| set.then_some(field))
    }

    fn into_descriptor(self, position: usize) -> Result<StepDescriptor, ConfigError> {
        let step = match self.kind {
            EntryType::Parallel => {
                let child_only_field = self.child_only_field();
                let name = self
                    .name
                    .unwrap_or_else(|| format!("parallel_{}", position));
                if let Some(field) = child_only_field {
                    return Err(ConfigError::UnsupportedGroupField { group: name, field });
                }
                let children = self
                    .agents
                    .unwrap_or_default()
                    .into_iter()
                    .enumerate()
                    .map(|(i, child)| child.into_descriptor(i))
                    .collect::<Result<Vec<_>, _>>()?;
                StepDescriptor::parallel(name, children)
            }
            kind => {
                let name = match self.name {
                    Some(name) if !name.trim().is_empty() => name,
                    _ => {
                        return Err(ConfigError::MissingName {
                            kind: kind.label().to_string(),
                            position,
                        })
                    }
                };

                let mut step = match kind {
                    EntryType::Tool => StepDescriptor::tool(name),
                    _ => StepDescriptor::agent(name),
                }
                .with_on_error(self.on_error.unwrap_or_default());

                if let Some(target) = self.target {
                    step = step.with_target(target);
                }
                if let Some(retry) = self.retry {
                    step = step.with_retry(retry.into());
                }
                if let Some(secs) = self.timeout_secs {
                    step = step.with_timeout(Duration::from_secs(secs));
                }
                if let Some(key) = self.output_key {
                    step = step.with_output_key(key);
                }
                step
            }
        };

        match self.condition {
            Some(source) => {
                let condition =
                    Condition::parse(&source).map_err(|source| ConfigError::InvalidCondition {
                        step: step.name.clone(),
                        source,
                    })?;
                Ok(step.with_condition(condition))
            }
            None => Ok(step),
        }
    }
}

impl FlowDocument {
    fn into_definition(self) -> Result<FlowDefinition, ConfigError> {
        let steps = self
            .flow
            .into_iter()
            .enumerate()
            .map(|(position, entry)| entry.into_descriptor(position))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(FlowDefinition {
            id: self.id,
            description: self.description.trim().to_string(),
            version: self.version,
            env: self.env,
            steps,
            llm_overrides: self.llm_overrides,
            escalation: self.escalation,
        })
    }
}

/// Parses and validates a flow definition from YAML text.
///
/// Required environment variables are checked against the process
/// environment according to `mode`.
pub fn parse_flow(yaml: &str, mode: ValidationMode) -> Result<FlowDefinition, LoadError> {
    let document: FlowDocument = serde_yaml::from_str(yaml)?;

    debug!(
        "Parsed flow document '{}' ({} entries)",
        document.id,
        document.flow.len()
    );

    let flow = prepare_flow(document.into_definition()?)?;
    validate_environment(&flow, mode, |name| std::env::var_os(name).is_some())?;

    Ok(flow)
}

/// Loads a flow definition from a YAML file.
///
/// # Arguments
///
/// * `path` - Path to the flow YAML file
/// * `mode` - How strictly required environment variables are enforced
///
/// # Example
///
/// ```rust,no_run
/// use medflow::flow::{load_flow, ValidationMode};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let flow = load_flow("config/orchestrations/dual_llm_v1.yaml", ValidationMode::Strict)?;
///     println!("Loaded {} steps", flow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_flow(path: impl AsRef<Path>, mode: ValidationMode) -> Result<FlowDefinition, LoadError> {
    let path = path.as_ref();
    info!("Loading flow from: {}", path.display());

    let yaml = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;

    debug!("YAML content loaded ({} bytes)", yaml.len());

    let flow = parse_flow(&yaml, mode)?;
    info!(
        "Loaded flow '{}' ({} top-level steps)",
        flow.id,
        flow.steps.len()
    );
    Ok(flow)
}

/// Finds flow definitions by id in a configuration directory.
///
/// The id is chosen from, in order: an explicit argument, the
/// [`FLOW_ID_ENV`] environment variable, then [`DEFAULT_FLOW_ID`].
/// A flow with id `x` lives in `<root>/x.yaml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowLocator {
    root: PathBuf,
}

impl FlowLocator {
    /// Creates a locator searching `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory being searched.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves the id to load.
    pub fn resolve_id(&self, explicit: Option<&str>) -> String {
        select_id(explicit, std::env::var(FLOW_ID_ENV).ok())
    }

    /// Path of the definition file for `id`.
    pub fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.yaml", id))
    }

    /// Loads the selected flow definition.
    ///
    /// Ids that are not slugs are rejected before touching the filesystem,
    /// so an id can never name a file outside the root.
    pub fn load(&self, explicit: Option<&str>, mode: ValidationMode) -> Result<FlowDefinition, LoadError> {
        let id = self.resolve_id(explicit);
        if !is_valid_id(&id) {
            return Err(ConfigError::InvalidId(id).into());
        }
        let path = self.path_for(&id);

        if !path.is_file() {
            return Err(LoadError::NotFound {
                id,
                path: path.display().to_string(),
            });
        }

        load_flow(&path, mode)
    }

    /// Ids of all definitions in the directory, sorted.
    pub fn available(&self) -> Result<Vec<String>, LoadError> {
        let entries = fs::read_dir(&self.root).map_err(|source| LoadError::Io {
            path: self.root.display().to_string(),
            source,
        })?;

        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().map_or(false, |ext| ext == "yaml"))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

impl Default for FlowLocator {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_DIR)
    }
}

fn select_id(explicit: Option<&str>, from_env: Option<String>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| from_env.filter(|id| !id.trim().is_empty()))
        .unwrap_or_else(|| DEFAULT_FLOW_ID.to_string())
}
