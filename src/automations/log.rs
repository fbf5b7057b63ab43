// Automation logs - append-only audit records, one per execution attempt.
// Never mutated after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::conditions::ConditionTrace;
use crate::entities::EntityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Enrolled,
    Advanced,
    Completed,
    /// Condition gate not met - a normal completion path, not a failure.
    Skipped,
    Failed,
    Exited,
    Unenrolled,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enrolled => "enrolled",
            Self::Advanced => "advanced",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Exited => "exited",
            Self::Unenrolled => "unenrolled",
        }
    }
}

impl std::str::FromStr for LogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enrolled" => Ok(Self::Enrolled),
            "advanced" => Ok(Self::Advanced),
            "completed" => Ok(Self::Completed),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            "exited" => Ok(Self::Exited),
            "unenrolled" => Ok(Self::Unenrolled),
            other => Err(format!("unknown log status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationLog {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub enrollment_id: Option<Uuid>,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    /// Snapshot of the trigger context at execution time.
    pub trigger: Value,
    /// Per-condition pass/fail results.
    pub conditions_evaluated: Value,
    /// Per-action outcomes.
    pub actions_executed: Value,
    pub status: LogStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AutomationLog {
    pub fn new(
        automation_id: Uuid,
        entity_kind: EntityKind,
        entity_id: Uuid,
        status: LogStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            automation_id,
            enrollment_id: None,
            entity_kind,
            entity_id,
            trigger: json!({}),
            conditions_evaluated: json!([]),
            actions_executed: json!([]),
            status,
            error: None,
            created_at: now,
        }
    }

    pub fn with_enrollment(mut self, enrollment_id: Uuid) -> Self {
        self.enrollment_id = Some(enrollment_id);
        self
    }

    pub fn with_trigger(mut self, trigger: Value) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_conditions(mut self, trace: &[ConditionTrace]) -> Self {
        self.conditions_evaluated = serde_json::to_value(trace).unwrap_or(json!([]));
        self
    }

    pub fn with_actions(mut self, outcomes: Value) -> Self {
        self.actions_executed = outcomes;
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }
}
