// Branch resolver - picks the next step index for branch and condition steps.

use super::conditions::{self, Condition, ConditionTrace};
use super::steps::BranchArm;
use crate::entities::EntitySnapshot;

/// Resolution of a branch step: the winning arm's target, the default
/// branch, or `None` when nothing matched and no default is configured
/// (which ends the enrollment).
pub fn resolve_branch(
    branches: &[BranchArm],
    default_branch: Option<i32>,
    snapshot: &EntitySnapshot,
) -> (Option<i32>, Vec<ConditionTrace>) {
    let mut trace = Vec::new();

    // First match wins, in declared order.
    for arm in branches {
        let (matched, arm_trace) = conditions::evaluate_traced(&arm.conditions, snapshot);
        trace.extend(arm_trace);
        if matched {
            return (Some(arm.target_step), trace);
        }
    }

    (default_branch, trace)
}

/// Outcome of a gating condition step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Conditions passed; continue to the step's successor.
    Continue,
    /// Conditions failed and a false-branch is configured.
    Goto(i32),
    /// Conditions failed with no false-branch: end the enrollment. This is
    /// a normal completion path, logged as skipped - not a failure.
    EndSkipped,
}

pub fn resolve_condition_step(
    conditions: &[Condition],
    false_branch: Option<i32>,
    snapshot: &EntitySnapshot,
) -> (GateOutcome, Vec<ConditionTrace>) {
    let (passed, trace) = conditions::evaluate_traced(conditions, snapshot);

    let outcome = if passed {
        GateOutcome::Continue
    } else {
        match false_branch {
            Some(target) => GateOutcome::Goto(target),
            None => GateOutcome::EndSkipped,
        }
    };

    (outcome, trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntityKind;
    use serde_json::json;
    use uuid::Uuid;

    fn deal(fields: serde_json::Value) -> EntitySnapshot {
        EntitySnapshot::new(EntityKind::Deal, Uuid::new_v4(), fields)
    }

    fn arm(name: &str, conditions: Vec<Condition>, target: i32) -> BranchArm {
        BranchArm {
            name: name.to_string(),
            conditions,
            target_step: target,
        }
    }

    #[test]
    fn first_matching_arm_wins() {
        let branches = vec![
            arm("high_value", vec![Condition::greater_than("value", 10_000.0)], 3),
            arm("any", vec![], 5), // empty conditions always match
        ];

        let (target, _) = resolve_branch(&branches, Some(9), &deal(json!({"value": 15_000})));
        assert_eq!(target, Some(3));

        let (target, _) = resolve_branch(&branches, Some(9), &deal(json!({"value": 500})));
        assert_eq!(target, Some(5), "second arm matches once the first fails");
    }

    #[test]
    fn falls_back_to_default_then_none() {
        let branches = vec![arm(
            "high_value",
            vec![Condition::greater_than("value", 10_000.0)],
            3,
        )];

        let (target, _) = resolve_branch(&branches, Some(9), &deal(json!({"value": 1})));
        assert_eq!(target, Some(9));

        let (target, _) = resolve_branch(&branches, None, &deal(json!({"value": 1})));
        assert_eq!(target, None);
    }

    #[test]
    fn condition_gate_routes_false_branch() {
        let conditions = vec![Condition::equals("status", json!("open"))];

        let (outcome, _) =
            resolve_condition_step(&conditions, Some(4), &deal(json!({"status": "won"})));
        assert_eq!(outcome, GateOutcome::Goto(4));

        let (outcome, _) =
            resolve_condition_step(&conditions, None, &deal(json!({"status": "won"})));
        assert_eq!(outcome, GateOutcome::EndSkipped);

        let (outcome, _) =
            resolve_condition_step(&conditions, Some(4), &deal(json!({"status": "open"})));
        assert_eq!(outcome, GateOutcome::Continue);
    }
}
