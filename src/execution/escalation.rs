//! Escalation Policy
//!
//! The divergence-driven branch of a second-opinion flow: a designated step
//! (the divergence check) emits an outcome tag, and a later step (the
//! arbitration) runs only when that tag carries the trigger value.
//!
//! Routing itself is ordinary conditional branching. The policy only
//! describes the wiring, attaches the matching condition to the target step
//! when the definition leaves it implicit, and reports the decision and the
//! outcome tag for the run result.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;
use crate::flow::condition::values_equal;
use crate::flow::{Condition, FlowDefinition, KeyPath};

use super::context::ContextStore;

fn default_field() -> String {
    "outcome".to_string()
}

fn default_trigger() -> Value {
    Value::String("divergent".to_string())
}

/// Routing decision for the escalation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationDecision {
    /// The outcome tag matches the trigger; the target runs.
    Escalate,
    /// An outcome tag is present but does not match; the target is skipped.
    Skip,
    /// No outcome tag was produced; the target is skipped.
    NotApplicable,
}

/// Wiring between the step producing an outcome tag and the step it escalates to.
///
/// # Example
///
/// ```
/// use medflow::execution::EscalationPolicy;
///
/// let policy = EscalationPolicy::new("divergence_check", "arbitration");
/// assert_eq!(policy.field, "outcome");
/// assert_eq!(policy.when, "divergent");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    /// Step whose output carries the outcome tag
    pub from: String,
    /// Field (dotted path) of the outcome tag within that output
    #[serde(default = "default_field")]
    pub field: String,
    /// Tag value that triggers escalation: a string, number or boolean
    #[serde(default = "default_trigger")]
    pub when: Value,
    /// Step that runs on escalation
    pub to: String,
}

impl EscalationPolicy {
    /// Creates a policy with the default `outcome` field and `divergent` trigger.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            field: default_field(),
            when: default_trigger(),
            to: to.into(),
        }
    }

    /// Reads the tag from a different field.
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    /// Escalates on a different tag value.
    pub fn with_trigger(mut self, when: impl Into<Value>) -> Self {
        self.when = when.into();
        self
    }

    /// Context path of the outcome tag.
    pub fn outcome_path(&self, flow: &FlowDefinition) -> KeyPath {
        let key = flow
            .step(&self.from)
            .map(|s| s.output_key.as_str())
            .unwrap_or(self.from.as_str());
        KeyPath::new(&format!("{}.{}", key, self.field))
    }

    /// Condition the target step runs under.
    pub fn condition(&self, flow: &FlowDefinition) -> Condition {
        Condition::Equals(self.outcome_path(flow), self.when.clone())
    }

    /// Reads the outcome tag produced so far, if any.
    pub fn outcome(&self, flow: &FlowDefinition, context: &ContextStore) -> Option<String> {
        match context.lookup(&self.outcome_path(flow))? {
            Value::Null => None,
            Value::String(tag) => Some(tag.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Decides whether the target step should run.
    pub fn decide(&self, flow: &FlowDefinition, context: &ContextStore) -> EscalationDecision {
        let decision = match context.lookup(&self.outcome_path(flow)) {
            None | Some(Value::Null) => EscalationDecision::NotApplicable,
            Some(tag) if values_equal(tag, &self.when) => EscalationDecision::Escalate,
            Some(_) => EscalationDecision::Skip,
        };
        debug!(
            "Escalation '{}' -> '{}': {:?}",
            self.from, self.to, decision
        );
        decision
    }

    /// Gives the target step the escalation condition if it has none.
    pub fn attach(&self, flow: &mut FlowDefinition) {
        let condition = self.condition(flow);
        if let Some(target) = flow.step_mut(&self.to) {
            if target.condition.is_none() {
                debug!("Attaching escalation condition to '{}': {}", self.to, condition);
                target.condition = Some(condition);
            }
        }
    }

    /// Checks the policy against the flow it belongs to.
    pub fn validate(&self, flow: &FlowDefinition) -> Result<(), ConfigError> {
        if self.field.trim().is_empty() {
            return Err(ConfigError::InvalidEscalation(
                "field must not be empty".to_string(),
            ));
        }
        match &self.when {
            Value::String(tag) if tag.trim().is_empty() => {
                return Err(ConfigError::InvalidEscalation(
                    "trigger value must not be empty".to_string(),
                ));
            }
            Value::Null | Value::Array(_) | Value::Object(_) => {
                return Err(ConfigError::InvalidEscalation(format!(
                    "trigger value must be a string, number or boolean, got {}",
                    self.when
                )));
            }
            _ => {}
        }

        let source = flow.step(&self.from).ok_or_else(|| {
            ConfigError::InvalidEscalation(format!("unknown source step '{}'", self.from))
        })?;
        if source.is_parallel() {
            return Err(ConfigError::InvalidEscalation(format!(
                "source step '{}' is a parallel group",
                self.from
            )));
        }

        let target = flow.step(&self.to).ok_or_else(|| {
            ConfigError::InvalidEscalation(format!("unknown target step '{}'", self.to))
        })?;

        let (Some(from_pos), Some(to_pos)) = (
            top_level_position(flow, &self.from),
            top_level_position(flow, &self.to),
        ) else {
            return Err(ConfigError::InvalidEscalation(
                "escalation steps not found in flow order".to_string(),
            ));
        };
        if from_pos >= to_pos {
            return Err(ConfigError::InvalidEscalation(format!(
                "target '{}' must come after source '{}'",
                self.to, self.from
            )));
        }

        match &target.condition {
            Some(condition) if !condition.references().contains(&source.output_key.as_str()) => {
                Err(ConfigError::InvalidEscalation(format!(
                    "condition of '{}' does not read the output of '{}'",
                    self.to, self.from
                )))
            }
            Some(_) => Ok(()),
            None => Err(ConfigError::InvalidEscalation(format!(
                "target '{}' has no condition",
                self.to
            ))),
        }
    }
}

/// Index of the top-level step that is, or contains, `name`.
fn top_level_position(flow: &FlowDefinition, name: &str) -> Option<usize> {
    flow.steps
        .iter()
        .position(|s| s.name == name || s.children().iter().any(|c| c.name == name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::StepDescriptor;
    use serde_json::json;

    fn second_opinion_flow() -> FlowDefinition {
        FlowDefinition::new("escalation", "escalation test")
            .with_step(StepDescriptor::agent("divergence_check"))
            .with_step(StepDescriptor::agent("arbitration"))
    }

    fn context_with_outcome(outcome: Value) -> ContextStore {
        let mut ctx = ContextStore::new();
        ctx.set("divergence_check", json!({ "outcome": outcome }));
        ctx
    }

    #[test]
    fn test_divergent_escalates() {
        let flow = second_opinion_flow();
        let policy = EscalationPolicy::new("divergence_check", "arbitration");
        let ctx = context_with_outcome(json!("divergent"));

        assert_eq!(policy.decide(&flow, &ctx), EscalationDecision::Escalate);
        assert_eq!(policy.outcome(&flow, &ctx), Some("divergent".to_string()));
        assert!(policy.condition(&flow).evaluate(&ctx));
    }

    #[test]
    fn test_equivalent_skips() {
        let flow = second_opinion_flow();
        let policy = EscalationPolicy::new("divergence_check", "arbitration");
        let ctx = context_with_outcome(json!("equivalent"));

        assert_eq!(policy.decide(&flow, &ctx), EscalationDecision::Skip);
        assert!(!policy.condition(&flow).evaluate(&ctx));
    }

    #[test]
    fn test_missing_outcome_not_applicable() {
        let flow = second_opinion_flow();
        let policy = EscalationPolicy::new("divergence_check", "arbitration");

        assert_eq!(
            policy.decide(&flow, &ContextStore::new()),
            EscalationDecision::NotApplicable
        );
        assert_eq!(
            policy.decide(&flow, &context_with_outcome(Value::Null)),
            EscalationDecision::NotApplicable
        );
        assert!(!policy.condition(&flow).evaluate(&ContextStore::new()));
    }

    #[test]
    fn test_custom_field_and_output_key() {
        let flow = FlowDefinition::new("custom", "custom")
            .with_step(StepDescriptor::agent("review").with_output_key("verdict"))
            .with_step(StepDescriptor::agent("arbiter"));
        let policy = EscalationPolicy::new("review", "arbiter").with_field("status");

        let mut ctx = ContextStore::new();
        ctx.set("verdict", json!({"status": "divergent"}));

        assert_eq!(policy.outcome_path(&flow).to_string(), "verdict.status");
        assert_eq!(policy.decide(&flow, &ctx), EscalationDecision::Escalate);
    }

    #[test]
    fn test_boolean_trigger_agrees_with_condition() {
        let mut flow = FlowDefinition::new("flagged", "boolean outcome")
            .with_step(StepDescriptor::agent("divergence_check"))
            .with_step(StepDescriptor::agent("arbitration"));
        let policy = EscalationPolicy::new("divergence_check", "arbitration")
            .with_field("divergent")
            .with_trigger(true);
        policy.attach(&mut flow);
        assert!(policy.validate(&flow).is_ok());

        let mut ctx = ContextStore::new();
        ctx.set("divergence_check", json!({"divergent": true}));
        assert_eq!(policy.decide(&flow, &ctx), EscalationDecision::Escalate);
        assert!(flow.step("arbitration").unwrap().condition.as_ref().unwrap().evaluate(&ctx));
        assert_eq!(policy.outcome(&flow, &ctx), Some("true".to_string()));

        ctx.set("divergence_check", json!({"divergent": "true"}));
        assert_eq!(policy.decide(&flow, &ctx), EscalationDecision::Skip);
        assert!(!policy.condition(&flow).evaluate(&ctx));
    }

    #[test]
    fn test_numeric_trigger_matches_across_int_and_float() {
        let flow = second_opinion_flow();
        let policy = EscalationPolicy::new("divergence_check", "arbitration").with_trigger(1);
        let ctx = context_with_outcome(json!(1.0));

        assert_eq!(policy.decide(&flow, &ctx), EscalationDecision::Escalate);
        assert!(policy.condition(&flow).evaluate(&ctx));
    }

    #[test]
    fn test_validate_rejects_structured_trigger() {
        let mut flow = second_opinion_flow();
        let base = EscalationPolicy::new("divergence_check", "arbitration");
        base.attach(&mut flow);

        for when in [Value::Null, json!(""), json!(["divergent"]), json!({"a": 1})] {
            let policy = base.clone().with_trigger(when);
            assert!(matches!(
                policy.validate(&flow),
                Err(ConfigError::InvalidEscalation(_))
            ));
        }
    }

    #[test]
    fn test_attach_sets_missing_condition_only() {
        let mut flow = second_opinion_flow();
        let policy = EscalationPolicy::new("divergence_check", "arbitration");

        policy.attach(&mut flow);
        assert_eq!(
            flow.step("arbitration").unwrap().condition,
            Some(Condition::parse(r#"divergence_check.outcome == "divergent""#).unwrap())
        );

        let custom = Condition::parse("divergence_check.escalate == true").unwrap();
        flow.step_mut("arbitration").unwrap().condition = Some(custom.clone());
        policy.attach(&mut flow);
        assert_eq!(flow.step("arbitration").unwrap().condition, Some(custom));
    }

    #[test]
    fn test_validate_ordering_and_conditions() {
        let mut flow = second_opinion_flow();
        let policy = EscalationPolicy::new("divergence_check", "arbitration");

        assert!(policy.validate(&flow).is_err());
        policy.attach(&mut flow);
        assert!(policy.validate(&flow).is_ok());

        let backwards = EscalationPolicy::new("arbitration", "divergence_check");
        assert!(matches!(
            backwards.validate(&flow),
            Err(ConfigError::InvalidEscalation(_))
        ));

        let unknown = EscalationPolicy::new("divergence_check", "nobody");
        assert!(unknown.validate(&flow).is_err());

        flow.step_mut("arbitration").unwrap().condition = Some(Condition::parse("input").unwrap());
        assert!(policy.validate(&flow).is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let policy: EscalationPolicy =
            serde_yaml::from_str("from: divergence_check\nto: arbitration\n").unwrap();
        assert_eq!(policy, EscalationPolicy::new("divergence_check", "arbitration"));

        let policy: EscalationPolicy = serde_yaml::from_str(
            "from: divergence_check\nfield: divergent\nwhen: true\nto: arbitration\n",
        )
        .unwrap();
        assert_eq!(policy.when, Value::Bool(true));
    }
}
