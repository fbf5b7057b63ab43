// Automation definitions - named rule sets loaded from the definition store.
//
// A definition is immutable during a run except for its aggregate counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::actions::ActionConfig;
use super::conditions::Condition;
use super::exits::ExitCriteria;
use super::steps::{AutomationStep, StepConfig};
use crate::entities::lookup_path;
use crate::error::{EngineError, EngineResult};
use crate::events::{TriggerEvent, TriggerType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: Uuid,
    pub name: String,
    pub trigger_type: TriggerType,
    /// Implicit trigger filter: a JSON object whose entries must all match
    /// the triggering entity's fields (loose string comparison).
    pub trigger_filter: Value,
    /// Automation-level enrollment conditions.
    pub conditions: Vec<Condition>,
    /// Legacy flat action list, executed inline for single-step automations.
    pub actions: Vec<ActionConfig>,
    pub is_multi_step: bool,
    pub is_active: bool,
    pub enrolled_count: i64,
    pub active_count: i64,
    pub completed_count: i64,
    pub exit_criteria: ExitCriteria,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Automation {
    pub fn new(name: &str, trigger_type: TriggerType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            trigger_type,
            trigger_filter: Value::Object(Default::default()),
            conditions: Vec::new(),
            actions: Vec::new(),
            is_multi_step: false,
            is_active: true,
            enrolled_count: 0,
            active_count: 0,
            completed_count: 0,
            exit_criteria: ExitCriteria::default(),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// Does this automation react to the given event? Checks the trigger
    /// type and the implicit filter against the event's entity snapshot.
    pub fn matches_trigger(&self, event: &TriggerEvent) -> bool {
        if self.trigger_type != event.trigger_type {
            return false;
        }

        if let Some(filter) = self.trigger_filter.as_object() {
            for (key, expected) in filter {
                let actual = lookup_path(&event.snapshot.fields, key);
                if loose(&actual) != loose(expected) {
                    return false;
                }
            }
        }

        true
    }
}

fn loose(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Validate a definition together with its step arena, as done at
/// automation-save time. Returns every problem found, not just the first.
pub fn validate(automation: &Automation, steps: &[AutomationStep]) -> EngineResult<()> {
    let mut problems = Vec::new();

    if automation.name.trim().is_empty() {
        problems.push("name must not be empty".to_string());
    }

    if automation.is_multi_step && steps.is_empty() {
        problems.push("multi-step automation has no steps".to_string());
    }
    if !automation.is_multi_step && automation.actions.is_empty() {
        problems.push("single-step automation has no actions".to_string());
    }

    let exists = |index: i32| steps.iter().any(|s| s.step_index == index);

    for step in steps {
        if step.step_index < 0 {
            problems.push(format!("step index {} is negative", step.step_index));
        }
        if let Some(next) = step.next_step_index {
            if !exists(next) {
                problems.push(format!(
                    "step {} points at missing step {next}",
                    step.step_index
                ));
            }
        }
        match &step.config {
            StepConfig::Action { actions } => {
                if actions.is_empty() {
                    problems.push(format!("action step {} has no actions", step.step_index));
                }
            }
            StepConfig::Delay {
                days,
                hours,
                minutes,
            } => {
                if *days < 0 || *hours < 0 || *minutes < 0 {
                    problems.push(format!("delay step {} is negative", step.step_index));
                }
            }
            StepConfig::Condition { false_branch, .. } => {
                if let Some(target) = false_branch {
                    if !exists(*target) {
                        problems.push(format!(
                            "condition step {} false-branch points at missing step {target}",
                            step.step_index
                        ));
                    }
                }
            }
            StepConfig::Branch {
                branches,
                default_branch,
            } => {
                if branches.is_empty() {
                    problems.push(format!("branch step {} has no branches", step.step_index));
                }
                for arm in branches {
                    if !exists(arm.target_step) {
                        problems.push(format!(
                            "branch '{}' of step {} points at missing step {}",
                            arm.name, step.step_index, arm.target_step
                        ));
                    }
                }
                if let Some(target) = default_branch {
                    if !exists(*target) {
                        problems.push(format!(
                            "default branch of step {} points at missing step {target}",
                            step.step_index
                        ));
                    }
                }
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation(problems.join("; ")))
    }
}

/// Validate a raw action payload before deserialization.
///
/// The UI historically saved tagging actions with a plural `tags` field that
/// one of the two engines silently failed to read. `tag` is the canonical
/// spelling; the legacy one is a hard validation error at save time rather
/// than a silent no-op at execution time.
pub fn validate_action_payload(raw: &Value) -> EngineResult<()> {
    let Some(obj) = raw.as_object() else {
        return Err(EngineError::Validation(
            "action config must be a JSON object".to_string(),
        ));
    };

    if obj.get("type").and_then(Value::as_str) == Some("add_contact_tag") && obj.contains_key("tags")
    {
        return Err(EngineError::Validation(
            "add_contact_tag uses the field 'tag'; the legacy 'tags' field is not accepted"
                .to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{EntityKind, EntitySnapshot};
    use serde_json::json;

    fn event(trigger_type: TriggerType, fields: Value) -> TriggerEvent {
        TriggerEvent::new(
            trigger_type,
            EntitySnapshot::new(EntityKind::Contact, Uuid::new_v4(), fields),
            None,
        )
    }

    #[test]
    fn trigger_match_checks_type_and_filter() {
        let mut automation = Automation::new("vip deals", TriggerType::DealStageChanged);
        automation.trigger_filter = json!({ "stage": "negotiation" });

        assert!(automation.matches_trigger(&event(
            TriggerType::DealStageChanged,
            json!({ "stage": "negotiation" })
        )));
        assert!(!automation.matches_trigger(&event(
            TriggerType::DealStageChanged,
            json!({ "stage": "won" })
        )));
        assert!(!automation.matches_trigger(&event(
            TriggerType::DealCreated,
            json!({ "stage": "negotiation" })
        )));
    }

    #[test]
    fn validate_rejects_dangling_step_references() {
        let mut automation = Automation::new("broken", TriggerType::ContactCreated);
        automation.is_multi_step = true;

        let steps = vec![AutomationStep::new(
            automation.id,
            0,
            StepConfig::Condition {
                conditions: vec![],
                false_branch: Some(7),
            },
        )];

        let err = validate(&automation, &steps).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(err.to_string().contains("missing step 7"));
    }

    #[test]
    fn validate_rejects_legacy_tags_field() {
        let raw = json!({ "type": "add_contact_tag", "tags": ["lead"] });
        let err = validate_action_payload(&raw).unwrap_err();
        assert!(err.to_string().contains("'tag'"));

        let ok = json!({ "type": "add_contact_tag", "tag": "lead" });
        assert!(validate_action_payload(&ok).is_ok());
    }

    #[test]
    fn validate_accepts_linear_multi_step() {
        let mut automation = Automation::new("nurture", TriggerType::ContactCreated);
        automation.is_multi_step = true;

        let steps = vec![
            AutomationStep::new(
                automation.id,
                0,
                StepConfig::Delay { days: 1, hours: 0, minutes: 0 },
            ),
            AutomationStep::new(
                automation.id,
                1,
                StepConfig::Action {
                    actions: vec![ActionConfig::AddContactTag { tag: "nurtured".into() }],
                },
            ),
        ];

        assert!(validate(&automation, &steps).is_ok());
    }
}
