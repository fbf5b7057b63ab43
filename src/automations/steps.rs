// Step graph - the flat, index-addressed arena of steps per automation.
//
// Steps reference each other purely by integer index, so branches and
// condition steps can jump anywhere (including backwards) without cyclic
// object references.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::actions::ActionConfig;
use super::conditions::Condition;

/// One unit of work in a multi-step automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationStep {
    pub id: Uuid,
    pub automation_id: Uuid,
    /// Zero-based position in the step arena.
    pub step_index: i32,
    pub config: StepConfig,
    /// Explicit successor. When absent, execution falls through to
    /// `step_index + 1` if such a step exists.
    pub next_step_index: Option<i32>,
}

impl AutomationStep {
    pub fn new(automation_id: Uuid, step_index: i32, config: StepConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            automation_id,
            step_index,
            config,
            next_step_index: None,
        }
    }

    pub fn with_next(mut self, next_step_index: i32) -> Self {
        self.next_step_index = Some(next_step_index);
        self
    }
}

/// Type-specific payload of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Apply an ordered action batch.
    Action { actions: Vec<ActionConfig> },
    /// Hold the enrollment until the delay elapses.
    Delay {
        #[serde(default)]
        days: i64,
        #[serde(default)]
        hours: i64,
        #[serde(default)]
        minutes: i64,
    },
    /// Gate continuation. On failure, route to `false_branch` when
    /// configured, otherwise end the enrollment (logged as skipped).
    Condition {
        conditions: Vec<Condition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        false_branch: Option<i32>,
    },
    /// First matching arm wins; `default_branch` catches the rest.
    Branch {
        branches: Vec<BranchArm>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_branch: Option<i32>,
    },
}

impl StepConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Action { .. } => "action",
            Self::Delay { .. } => "delay",
            Self::Condition { .. } => "condition",
            Self::Branch { .. } => "branch",
        }
    }

    /// Wait duration for delay steps, `None` for every other type.
    pub fn delay_duration(&self) -> Option<Duration> {
        match self {
            Self::Delay {
                days,
                hours,
                minutes,
            } => Some(
                Duration::days(*days) + Duration::hours(*hours) + Duration::minutes(*minutes),
            ),
            _ => None,
        }
    }
}

/// One arm of a branch step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchArm {
    pub name: String,
    pub conditions: Vec<Condition>,
    pub target_step: i32,
}

/// Array-backed arena of one automation's steps, keyed by `step_index`.
#[derive(Debug, Clone)]
pub struct StepArena {
    steps: Vec<AutomationStep>,
}

impl StepArena {
    pub fn new(mut steps: Vec<AutomationStep>) -> Self {
        steps.sort_by_key(|s| s.step_index);
        Self { steps }
    }

    pub fn get(&self, step_index: i32) -> Option<&AutomationStep> {
        self.steps.iter().find(|s| s.step_index == step_index)
    }

    /// Successor index after a successfully executed step: the explicit
    /// `next_step_index` when set, otherwise `step_index + 1` when such a
    /// step exists. `None` means the enrollment completes.
    pub fn next_after(&self, step: &AutomationStep) -> Option<i32> {
        match step.next_step_index {
            Some(next) => Some(next),
            None => {
                let fallthrough = step.step_index + 1;
                self.get(fallthrough).map(|s| s.step_index)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AutomationStep> {
        self.steps.iter()
    }
}
