// Enrollment - the runtime record tracking one entity's progress through one
// automation. Mutated exclusively by the enrollment state machine; terminal
// rows are retained for audit and never deleted by the engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::entities::EntityKind;

/// `Active` is the only non-terminal state. Re-enrollment requires a new row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Failed,
    Unenrolled,
    Exited,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unenrolled => "unenrolled",
            Self::Exited => "exited",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrollmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "unenrolled" => Ok(Self::Unenrolled),
            "exited" => Ok(Self::Exited),
            other => Err(format!("unknown enrollment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub current_step_index: i32,
    pub status: EnrollmentStatus,
    pub enrolled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    /// `None` or a past timestamp means the enrollment is due.
    pub next_step_at: Option<DateTime<Utc>>,
    /// Free-form diagnostic bag (last error, consecutive error count, ...).
    pub metadata: Value,
    pub exit_reason: Option<String>,
}

impl Enrollment {
    pub fn new(
        automation_id: Uuid,
        entity_kind: EntityKind,
        entity_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            automation_id,
            entity_kind,
            entity_id,
            current_step_index: 0,
            status: EnrollmentStatus::Active,
            enrolled_at: now,
            completed_at: None,
            exited_at: None,
            next_step_at: Some(now),
            metadata: json!({}),
            exit_reason: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EnrollmentStatus::Active
            && self.next_step_at.map(|at| at <= now).unwrap_or(true)
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.enrolled_at).num_days()
    }

    pub fn consecutive_errors(&self) -> i64 {
        self.metadata
            .get("consecutive_errors")
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    /// Record a step execution error in the metadata bag.
    pub fn record_error(&mut self, error: &str) {
        let count = self.consecutive_errors() + 1;
        self.set_metadata("error", json!(error));
        self.set_metadata("consecutive_errors", json!(count));
    }

    pub fn set_metadata(&mut self, key: &str, value: Value) {
        if !self.metadata.is_object() {
            self.metadata = json!({});
        }
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = EnrollmentStatus::Completed;
        self.completed_at = Some(now);
        self.next_step_at = None;
    }

    pub fn fail(&mut self, error: &str, now: DateTime<Utc>) {
        self.status = EnrollmentStatus::Failed;
        self.completed_at = Some(now);
        self.next_step_at = None;
        self.set_metadata("error", json!(error));
    }

    pub fn exit(&mut self, reason: &str, now: DateTime<Utc>) {
        self.status = EnrollmentStatus::Exited;
        self.exited_at = Some(now);
        self.next_step_at = None;
        self.exit_reason = Some(reason.to_string());
    }

    pub fn unenroll(&mut self, now: DateTime<Utc>) {
        self.status = EnrollmentStatus::Unenrolled;
        self.exited_at = Some(now);
        self.next_step_at = None;
    }
}

/// Enrollment counts by status for one automation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentStats {
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub unenrolled: i64,
    pub exited: i64,
}

impl EnrollmentStats {
    pub fn total(&self) -> i64 {
        self.active + self.completed + self.failed + self.unenrolled + self.exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_enrollment_is_immediately_due() {
        let now = Utc::now();
        let e = Enrollment::new(Uuid::new_v4(), EntityKind::Contact, Uuid::new_v4(), now);

        assert_eq!(e.status, EnrollmentStatus::Active);
        assert_eq!(e.current_step_index, 0);
        assert!(e.is_due(now));
    }

    #[test]
    fn future_next_step_is_not_due() {
        let now = Utc::now();
        let mut e = Enrollment::new(Uuid::new_v4(), EntityKind::Contact, Uuid::new_v4(), now);
        e.next_step_at = Some(now + chrono::Duration::hours(24));

        assert!(!e.is_due(now));
        assert!(e.is_due(now + chrono::Duration::hours(25)));
    }

    #[test]
    fn terminal_states_are_never_due() {
        let now = Utc::now();
        let mut e = Enrollment::new(Uuid::new_v4(), EntityKind::Deal, Uuid::new_v4(), now);
        e.complete(now);

        assert!(e.status.is_terminal());
        assert!(!e.is_due(now));
        assert_eq!(e.completed_at, Some(now));
    }

    #[test]
    fn record_error_tracks_consecutive_count() {
        let now = Utc::now();
        let mut e = Enrollment::new(Uuid::new_v4(), EntityKind::Contact, Uuid::new_v4(), now);

        e.record_error("boom");
        e.record_error("boom again");

        assert_eq!(e.consecutive_errors(), 2);
        assert_eq!(e.metadata["error"], "boom again");
    }

    #[test]
    fn exit_records_reason() {
        let now = Utc::now();
        let mut e = Enrollment::new(Uuid::new_v4(), EntityKind::Contact, Uuid::new_v4(), now);
        e.exit("goal met", now);

        assert_eq!(e.status, EnrollmentStatus::Exited);
        assert_eq!(e.exit_reason.as_deref(), Some("goal met"));
        assert_eq!(e.exited_at, Some(now));
    }
}
