// Port definitions - traits the engine consumes.
//
// The definition/enrollment/log stores are owned by this crate (Postgres and
// in-memory implementations under `storage`). The entity store, email sender
// and reminder store belong to external subsystems; the engine only sees
// these narrow interfaces.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::automations::definition::Automation;
use crate::automations::enrollment::{Enrollment, EnrollmentStats};
use crate::automations::log::AutomationLog;
use crate::automations::steps::AutomationStep;
use crate::entities::{EntityKind, EntitySnapshot};
use crate::error::EngineResult;

/// Read-only access to automation definitions.
#[async_trait]
pub trait AutomationStore: Send + Sync {
    async fn get(&self, id: Uuid) -> EngineResult<Option<Automation>>;

    async fn list_active(&self) -> EngineResult<Vec<Automation>>;

    /// Ordered step arena for one automation (ascending `step_index`).
    async fn steps(&self, automation_id: Uuid) -> EngineResult<Vec<AutomationStep>>;

    /// Adjust the aggregate enrolled/active/completed counters.
    async fn adjust_counters(
        &self,
        id: Uuid,
        enrolled: i64,
        active: i64,
        completed: i64,
    ) -> EngineResult<()>;
}

/// Persistence for enrollment rows. Mutated exclusively by the state machine.
#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    async fn get(&self, id: Uuid) -> EngineResult<Option<Enrollment>>;

    /// The single active enrollment for (automation, entity), if any.
    async fn find_active(
        &self,
        automation_id: Uuid,
        entity_kind: EntityKind,
        entity_id: Uuid,
    ) -> EngineResult<Option<Enrollment>>;

    async fn insert(&self, enrollment: &Enrollment) -> EngineResult<()>;

    async fn update(&self, enrollment: &Enrollment) -> EngineResult<()>;

    /// Active enrollments whose `next_step_at` is null or `<= now`.
    async fn due(&self, now: DateTime<Utc>) -> EngineResult<Vec<Enrollment>>;

    async fn stats(&self, automation_id: Uuid) -> EngineResult<EnrollmentStats>;
}

/// Append-only execution audit log.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, log: &AutomationLog) -> EngineResult<()>;

    async fn for_automation(&self, automation_id: Uuid, limit: i64)
        -> EngineResult<Vec<AutomationLog>>;
}

/// Contact/deal store, owned externally.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find(&self, kind: EntityKind, id: Uuid) -> EngineResult<Option<EntitySnapshot>>;

    /// Overwrite one top-level field.
    async fn update_field(
        &self,
        kind: EntityKind,
        id: Uuid,
        field: &str,
        value: &Value,
    ) -> EngineResult<()>;

    /// Idempotent tag insertion. Returns `false` if the tag was already set.
    async fn add_tag(&self, kind: EntityKind, id: Uuid, tag: &str) -> EngineResult<bool>;
}

/// Outbound email, owned externally.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> EngineResult<()>;
}

/// A reminder to be created by a create_reminder action.
#[derive(Debug, Clone)]
pub struct NewReminder {
    pub title: String,
    pub description: String,
    pub due_at: DateTime<Utc>,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
}

/// Reminder/task store, owned externally.
#[async_trait]
pub trait ReminderStore: Send + Sync {
    async fn create(&self, reminder: NewReminder) -> EngineResult<()>;
}
