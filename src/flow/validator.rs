//! Flow Validation
//!
//! Structural checks run once when a flow definition is loaded or an
//! engine is built:
//! - Identifier and version formats
//! - Step name uniqueness
//! - Parallel group shape (non-empty, no nesting)
//! - Context key partitioning (no two steps write the same key)
//! - Condition references (only keys produced by earlier steps)
//! - Retry policy sanity
//! - Escalation policy wiring
//!
//! Every problem is a [`ConfigError`]; nothing here is deferred to run time.

use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};

use super::model::{FlowDefinition, StepDescriptor};
use crate::error::ConfigError;
use crate::execution::INPUT_KEY;

/// How strictly flow-level requirements are enforced while loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Missing environment variables are fatal.
    #[default]
    Strict,
    /// Missing environment variables are only logged (test contexts).
    Permissive,
}

/// Environment variable that switches loading to permissive mode.
pub const SKIP_ENV_VALIDATION: &str = "SKIP_ORCH_ENV_VALIDATION";

impl ValidationMode {
    /// Permissive if [`SKIP_ENV_VALIDATION`] is set, strict otherwise.
    pub fn from_env() -> Self {
        if std::env::var_os(SKIP_ENV_VALIDATION).is_some() {
            Self::Permissive
        } else {
            Self::Strict
        }
    }
}

/// Completes and validates a definition before it is shared.
///
/// Attaches the escalation condition to its target when the definition
/// leaves it implicit, then runs [`validate_flow`].
pub fn prepare_flow(mut flow: FlowDefinition) -> Result<FlowDefinition, ConfigError> {
    if let Some(policy) = flow.escalation.clone() {
        policy.attach(&mut flow);
    }
    validate_flow(&flow)?;
    Ok(flow)
}

/// Validates the entire flow structure.
///
/// Performs the following checks:
/// 1. Flow is not empty
/// 2. Id is a slug and version, if present, is SemVer
/// 3. Step names are present and unique (including group children)
/// 4. Parallel groups have children and do not nest
/// 5. Output keys are unique and avoid the reserved input key
/// 6. Retry policies are usable
/// 7. Conditions only reference keys produced by earlier steps
/// 8. The escalation policy, if any, is wired to existing steps
pub fn validate_flow(flow: &FlowDefinition) -> Result<(), ConfigError> {
    info!("Validating flow '{}' with {} steps", flow.id, flow.steps.len());

    if flow.steps.is_empty() {
        return Err(ConfigError::EmptyFlow);
    }

    if !is_valid_id(&flow.id) {
        return Err(ConfigError::InvalidId(flow.id.clone()));
    }

    if let Some(version) = &flow.version {
        if !is_valid_version(version) {
            return Err(ConfigError::InvalidVersion(version.clone()));
        }
    }

    let mut seen_names: HashSet<&str> = HashSet::new();
    for (position, step) in flow.steps.iter().enumerate() {
        validate_name(step, position, &mut seen_names)?;

        if step.is_parallel() {
            if step.children().is_empty() {
                return Err(ConfigError::EmptyParallelGroup(step.name.clone()));
            }
            for (child_position, child) in step.children().iter().enumerate() {
                if child.is_parallel() {
                    return Err(ConfigError::NestedParallel {
                        group: step.name.clone(),
                        position: child_position,
                    });
                }
                validate_name(child, child_position, &mut seen_names)?;
            }
        }
    }

    validate_output_keys(flow)?;

    for step in flow.invocable_steps() {
        validate_retry_policy(step)?;
    }

    validate_references(flow)?;

    if let Some(policy) = &flow.escalation {
        policy.validate(flow)?;
    }

    info!(
        "Flow validated: {} top-level steps, {} capability calls",
        flow.steps.len(),
        flow.invocable_steps().count()
    );
    Ok(())
}

/// Checks that every required environment variable is set.
///
/// In [`ValidationMode::Permissive`] missing variables are logged and
/// ignored. `is_set` decides whether a variable is present, which keeps the
/// check independent of the real process environment in tests.
pub fn validate_environment<F>(
    flow: &FlowDefinition,
    mode: ValidationMode,
    is_set: F,
) -> Result<(), ConfigError>
where
    F: Fn(&str) -> bool,
{
    let missing: Vec<String> = flow
        .env
        .iter()
        .filter(|name| !is_set(name.as_str()))
        .cloned()
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    match mode {
        ValidationMode::Strict => Err(ConfigError::MissingEnvironment {
            flow: flow.id.clone(),
            missing,
        }),
        ValidationMode::Permissive => {
            warn!(
                "Flow '{}': ignoring missing environment variables {:?} (permissive mode)",
                flow.id, missing
            );
            Ok(())
        }
    }
}

fn validate_name<'a>(
    step: &'a StepDescriptor,
    position: usize,
    seen: &mut HashSet<&'a str>,
) -> Result<(), ConfigError> {
    if step.name.trim().is_empty() {
        let kind = if step.is_parallel() { "parallel" } else { "capability" };
        return Err(ConfigError::MissingName {
            kind: kind.to_string(),
            position,
        });
    }
    if !seen.insert(step.name.as_str()) {
        return Err(ConfigError::DuplicateStepName(step.name.clone()));
    }
    Ok(())
}

/// Ensures no two invocable steps share an output key.
fn validate_output_keys(flow: &FlowDefinition) -> Result<(), ConfigError> {
    let mut writers: HashMap<&str, &str> = HashMap::new();

    for step in flow.invocable_steps() {
        let key = step.output_key.as_str();
        if key == INPUT_KEY {
            return Err(ConfigError::ReservedKey {
                step: step.name.clone(),
                key: key.to_string(),
            });
        }
        if let Some(first) = writers.insert(key, step.name.as_str()) {
            return Err(ConfigError::OutputKeyCollision {
                key: key.to_string(),
                first: first.to_string(),
                second: step.name.clone(),
            });
        }
    }

    Ok(())
}

fn validate_retry_policy(step: &StepDescriptor) -> Result<(), ConfigError> {
    let policy = &step.retry_policy;
    let reason = if policy.max_attempts == 0 {
        Some("max_attempts must be at least 1")
    } else if !policy.multiplier.is_finite() || policy.multiplier <= 0.0 {
        Some("multiplier must be a positive number")
    } else if !policy.jitter.is_finite() || !(0.0..=1.0).contains(&policy.jitter) {
        Some("jitter must be between 0 and 1")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ConfigError::InvalidRetryPolicy {
            step: step.name.clone(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Ensures conditions only read keys written before the step is reached.
///
/// Siblings inside one parallel group cannot see each other's output.
fn validate_references(flow: &FlowDefinition) -> Result<(), ConfigError> {
    let mut available: HashSet<&str> = HashSet::from([INPUT_KEY]);

    for step in &flow.steps {
        check_condition(step, &available)?;
        for child in step.children() {
            check_condition(child, &available)?;
        }

        if step.is_parallel() {
            available.extend(step.children().iter().map(|c| c.output_key.as_str()));
        } else {
            available.insert(step.output_key.as_str());
        }
    }

    Ok(())
}

fn check_condition(step: &StepDescriptor, available: &HashSet<&str>) -> Result<(), ConfigError> {
    let Some(condition) = &step.condition else {
        return Ok(());
    };

    for reference in condition.references() {
        if !available.contains(reference) {
            return Err(ConfigError::InvalidReference {
                step: step.name.clone(),
                reference: reference.to_string(),
            });
        }
    }

    debug!("Step '{}' gated on: {}", step.name, condition);
    Ok(())
}

/// Slug check: lowercase ASCII letters, digits, `_` and `-`.
pub(crate) fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// SemVer check: `MAJOR.MINOR.PATCH` with an optional `-PRERELEASE` suffix.
fn is_valid_version(version: &str) -> bool {
    let (core, pre) = match version.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (version, None),
    };

    let parts: Vec<&str> = core.split('.').collect();
    let core_ok = parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));

    let pre_ok = pre.map_or(true, |p| {
        !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric() || c == '.')
    });

    core_ok && pre_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::EscalationPolicy;
    use crate::flow::{Condition, OnError, RetryPolicy};
    use std::time::Duration;

    fn base_flow() -> FlowDefinition {
        FlowDefinition::new("test-flow", "validation test")
            .with_step(StepDescriptor::agent("triage").with_on_error(OnError::Abort))
            .with_step(StepDescriptor::parallel(
                "specialists",
                vec![
                    StepDescriptor::agent("specialist_a").with_on_error(OnError::Skip),
                    StepDescriptor::agent("specialist_b").with_on_error(OnError::Skip),
                ],
            ))
            .with_step(StepDescriptor::agent("divergence_check"))
    }

    #[test]
    fn test_prepare_attaches_escalation() {
        let flow = base_flow()
            .with_step(StepDescriptor::agent("arbitration"))
            .with_escalation(EscalationPolicy::new("divergence_check", "arbitration"));

        assert!(validate_flow(&flow).is_err());

        let prepared = prepare_flow(flow).unwrap();
        assert!(prepared.step("arbitration").unwrap().condition.is_some());
    }

    #[test]
    fn test_valid_flow() {
        assert!(validate_flow(&base_flow()).is_ok());
    }

    #[test]
    fn test_empty_flow() {
        let flow = FlowDefinition::new("empty", "nothing");
        assert_eq!(validate_flow(&flow), Err(ConfigError::EmptyFlow));
    }

    #[test]
    fn test_invalid_id() {
        let mut flow = base_flow();
        flow.id = "Invalid Flow Name!".to_string();
        assert!(matches!(validate_flow(&flow), Err(ConfigError::InvalidId(_))));
    }

    #[test]
    fn test_version_formats() {
        assert!(is_valid_version("1.0.0"));
        assert!(is_valid_version("0.12.3-rc.1"));
        assert!(!is_valid_version("1.0"));
        assert!(!is_valid_version("1.0.x"));
        assert!(!is_valid_version("1.0.0-"));
        assert!(!is_valid_version("v1.0.0"));

        let flow = base_flow().with_version("one");
        assert_eq!(
            validate_flow(&flow),
            Err(ConfigError::InvalidVersion("one".to_string()))
        );
    }

    #[test]
    fn test_duplicate_step_name() {
        let flow = base_flow().with_step(StepDescriptor::agent("triage"));
        assert_eq!(
            validate_flow(&flow),
            Err(ConfigError::DuplicateStepName("triage".to_string()))
        );
    }

    #[test]
    fn test_duplicate_name_inside_group() {
        let flow = FlowDefinition::new("dupes", "dupes").with_step(StepDescriptor::parallel(
            "group",
            vec![StepDescriptor::agent("same"), StepDescriptor::tool("same")],
        ));
        assert_eq!(
            validate_flow(&flow),
            Err(ConfigError::DuplicateStepName("same".to_string()))
        );
    }

    #[test]
    fn test_missing_name() {
        let flow = FlowDefinition::new("unnamed", "unnamed").with_step(StepDescriptor::agent(""));
        assert!(matches!(
            validate_flow(&flow),
            Err(ConfigError::MissingName { position: 0, .. })
        ));
    }

    #[test]
    fn test_empty_parallel_group() {
        let flow = FlowDefinition::new("empty-group", "empty group")
            .with_step(StepDescriptor::parallel("group", vec![]));
        assert_eq!(
            validate_flow(&flow),
            Err(ConfigError::EmptyParallelGroup("group".to_string()))
        );
    }

    #[test]
    fn test_nested_parallel_group() {
        let flow = FlowDefinition::new("nested", "nested").with_step(StepDescriptor::parallel(
            "outer",
            vec![StepDescriptor::parallel(
                "inner",
                vec![StepDescriptor::agent("a")],
            )],
        ));
        assert!(matches!(
            validate_flow(&flow),
            Err(ConfigError::NestedParallel { .. })
        ));
    }

    #[test]
    fn test_parallel_output_key_collision() {
        let flow = FlowDefinition::new("collide", "collide").with_step(StepDescriptor::parallel(
            "specialists",
            vec![
                StepDescriptor::agent("specialist_a").with_output_key("report"),
                StepDescriptor::agent("specialist_b").with_output_key("report"),
            ],
        ));
        assert_eq!(
            validate_flow(&flow),
            Err(ConfigError::OutputKeyCollision {
                key: "report".to_string(),
                first: "specialist_a".to_string(),
                second: "specialist_b".to_string(),
            })
        );
    }

    #[test]
    fn test_reserved_input_key() {
        let flow = FlowDefinition::new("reserved", "reserved")
            .with_step(StepDescriptor::agent("loader").with_output_key("input"));
        assert!(matches!(
            validate_flow(&flow),
            Err(ConfigError::ReservedKey { .. })
        ));
    }

    #[test]
    fn test_invalid_retry_policy() {
        let flow = FlowDefinition::new("retry", "retry").with_step(
            StepDescriptor::agent("a").with_retry(RetryPolicy::exponential(
                0,
                Duration::from_millis(1),
                2.0,
            )),
        );
        assert!(matches!(
            validate_flow(&flow),
            Err(ConfigError::InvalidRetryPolicy { .. })
        ));

        let flow = FlowDefinition::new("jitter", "jitter")
            .with_step(StepDescriptor::agent("a").with_retry(RetryPolicy::default().with_jitter(1.5)));
        assert!(matches!(
            validate_flow(&flow),
            Err(ConfigError::InvalidRetryPolicy { .. })
        ));
    }

    #[test]
    fn test_condition_may_reference_earlier_steps_and_input() {
        let flow = base_flow()
            .with_step(
                StepDescriptor::agent("arbitration")
                    .with_condition(Condition::parse(r#"divergence_check.outcome == "divergent""#).unwrap()),
            )
            .with_step(
                StepDescriptor::tool("notify")
                    .with_condition(Condition::parse("input.notify").unwrap()),
            );
        assert!(validate_flow(&flow).is_ok());
    }

    #[test]
    fn test_forward_reference_rejected() {
        let flow = FlowDefinition::new("forward", "forward")
            .with_step(
                StepDescriptor::agent("arbitration")
                    .with_condition(Condition::parse("divergence_check").unwrap()),
            )
            .with_step(StepDescriptor::agent("divergence_check"));
        assert_eq!(
            validate_flow(&flow),
            Err(ConfigError::InvalidReference {
                step: "arbitration".to_string(),
                reference: "divergence_check".to_string(),
            })
        );
    }

    #[test]
    fn test_sibling_reference_rejected() {
        let flow = FlowDefinition::new("siblings", "siblings").with_step(StepDescriptor::parallel(
            "group",
            vec![
                StepDescriptor::agent("a"),
                StepDescriptor::agent("b").with_condition(Condition::parse("a").unwrap()),
            ],
        ));
        assert!(matches!(
            validate_flow(&flow),
            Err(ConfigError::InvalidReference { .. })
        ));
    }

    #[test]
    fn test_invalid_escalation_is_rejected() {
        let flow = base_flow().with_escalation(EscalationPolicy::new("divergence_check", "arbitration"));
        assert!(matches!(
            validate_flow(&flow),
            Err(ConfigError::InvalidEscalation(_))
        ));
    }

    #[test]
    fn test_environment_strict_and_permissive() {
        let flow = base_flow().requires_env("PRESENT").requires_env("ABSENT");
        let is_set = |name: &str| name == "PRESENT";

        assert_eq!(
            validate_environment(&flow, ValidationMode::Strict, is_set),
            Err(ConfigError::MissingEnvironment {
                flow: "test-flow".to_string(),
                missing: vec!["ABSENT".to_string()],
            })
        );
        assert!(validate_environment(&flow, ValidationMode::Permissive, is_set).is_ok());
        assert!(validate_environment(&flow, ValidationMode::Strict, |_| true).is_ok());
    }
}
