// In-memory adapters - deterministic store implementations for tests and
// local experimentation. Locks recover from poisoning instead of panicking;
// the guarded data is always left in a consistent state by the mutators.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::automations::definition::Automation;
use crate::automations::enrollment::{Enrollment, EnrollmentStats, EnrollmentStatus};
use crate::automations::log::AutomationLog;
use crate::automations::steps::AutomationStep;
use crate::entities::{EntityKind, EntitySnapshot};
use crate::error::{EngineError, EngineResult};
use crate::ports::{
    AutomationStore, EmailSender, EnrollmentStore, EntityStore, LogStore, NewReminder,
    ReminderStore,
};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct MemoryAutomationStore {
    inner: RwLock<HashMap<Uuid, (Automation, Vec<AutomationStep>)>>,
}

impl MemoryAutomationStore {
    pub fn insert(&self, automation: Automation, steps: Vec<AutomationStep>) {
        write(&self.inner).insert(automation.id, (automation, steps));
    }
}

#[async_trait]
impl AutomationStore for MemoryAutomationStore {
    async fn get(&self, id: Uuid) -> EngineResult<Option<Automation>> {
        Ok(read(&self.inner).get(&id).map(|(a, _)| a.clone()))
    }

    async fn list_active(&self) -> EngineResult<Vec<Automation>> {
        Ok(read(&self.inner)
            .values()
            .filter(|(a, _)| a.is_active)
            .map(|(a, _)| a.clone())
            .collect())
    }

    async fn steps(&self, automation_id: Uuid) -> EngineResult<Vec<AutomationStep>> {
        let mut steps = read(&self.inner)
            .get(&automation_id)
            .map(|(_, s)| s.clone())
            .unwrap_or_default();
        steps.sort_by_key(|s| s.step_index);
        Ok(steps)
    }

    async fn adjust_counters(
        &self,
        id: Uuid,
        enrolled: i64,
        active: i64,
        completed: i64,
    ) -> EngineResult<()> {
        if let Some((automation, _)) = write(&self.inner).get_mut(&id) {
            automation.enrolled_count += enrolled;
            automation.active_count = (automation.active_count + active).max(0);
            automation.completed_count += completed;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryEnrollmentStore {
    inner: RwLock<HashMap<Uuid, Enrollment>>,
}

#[async_trait]
impl EnrollmentStore for MemoryEnrollmentStore {
    async fn get(&self, id: Uuid) -> EngineResult<Option<Enrollment>> {
        Ok(read(&self.inner).get(&id).cloned())
    }

    async fn find_active(
        &self,
        automation_id: Uuid,
        entity_kind: EntityKind,
        entity_id: Uuid,
    ) -> EngineResult<Option<Enrollment>> {
        Ok(read(&self.inner)
            .values()
            .find(|e| {
                e.status == EnrollmentStatus::Active
                    && e.automation_id == automation_id
                    && e.entity_kind == entity_kind
                    && e.entity_id == entity_id
            })
            .cloned())
    }

    async fn insert(&self, enrollment: &Enrollment) -> EngineResult<()> {
        let mut inner = write(&self.inner);
        // mirrors the partial unique index on active rows
        let conflict = enrollment.status == EnrollmentStatus::Active
            && inner.values().any(|e| {
                e.status == EnrollmentStatus::Active
                    && e.automation_id == enrollment.automation_id
                    && e.entity_kind == enrollment.entity_kind
                    && e.entity_id == enrollment.entity_id
            });
        if conflict {
            return Err(EngineError::EnrollmentConflict);
        }
        inner.insert(enrollment.id, enrollment.clone());
        Ok(())
    }

    async fn update(&self, enrollment: &Enrollment) -> EngineResult<()> {
        write(&self.inner).insert(enrollment.id, enrollment.clone());
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>) -> EngineResult<Vec<Enrollment>> {
        let mut due: Vec<Enrollment> = read(&self.inner)
            .values()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        // stable sweep order for tests
        due.sort_by_key(|e| e.enrolled_at);
        Ok(due)
    }

    async fn stats(&self, automation_id: Uuid) -> EngineResult<EnrollmentStats> {
        let mut stats = EnrollmentStats::default();
        for e in read(&self.inner).values() {
            if e.automation_id != automation_id {
                continue;
            }
            match e.status {
                EnrollmentStatus::Active => stats.active += 1,
                EnrollmentStatus::Completed => stats.completed += 1,
                EnrollmentStatus::Failed => stats.failed += 1,
                EnrollmentStatus::Unenrolled => stats.unenrolled += 1,
                EnrollmentStatus::Exited => stats.exited += 1,
            }
        }
        Ok(stats)
    }
}

#[derive(Default)]
pub struct MemoryLogStore {
    inner: RwLock<Vec<AutomationLog>>,
}

impl MemoryLogStore {
    pub fn all(&self) -> Vec<AutomationLog> {
        read(&self.inner).clone()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, log: &AutomationLog) -> EngineResult<()> {
        write(&self.inner).push(log.clone());
        Ok(())
    }

    async fn for_automation(
        &self,
        automation_id: Uuid,
        limit: i64,
    ) -> EngineResult<Vec<AutomationLog>> {
        let logs = read(&self.inner);
        Ok(logs
            .iter()
            .rev()
            .filter(|l| l.automation_id == automation_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryEntityStore {
    inner: RwLock<HashMap<(EntityKind, Uuid), Value>>,
}

impl MemoryEntityStore {
    pub fn insert(&self, kind: EntityKind, id: Uuid, fields: Value) {
        write(&self.inner).insert((kind, id), fields);
    }

    pub fn remove(&self, kind: EntityKind, id: Uuid) {
        write(&self.inner).remove(&(kind, id));
    }

    pub fn snapshot(&self, kind: EntityKind, id: Uuid) -> Option<EntitySnapshot> {
        read(&self.inner)
            .get(&(kind, id))
            .map(|fields| EntitySnapshot::new(kind, id, fields.clone()))
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn find(&self, kind: EntityKind, id: Uuid) -> EngineResult<Option<EntitySnapshot>> {
        Ok(self.snapshot(kind, id))
    }

    async fn update_field(
        &self,
        kind: EntityKind,
        id: Uuid,
        field: &str,
        value: &Value,
    ) -> EngineResult<()> {
        if let Some(fields) = write(&self.inner).get_mut(&(kind, id)) {
            if let Some(map) = fields.as_object_mut() {
                map.insert(field.to_string(), value.clone());
            }
        }
        Ok(())
    }

    async fn add_tag(&self, kind: EntityKind, id: Uuid, tag: &str) -> EngineResult<bool> {
        let mut inner = write(&self.inner);
        let Some(fields) = inner.get_mut(&(kind, id)) else {
            return Ok(false);
        };
        let Some(map) = fields.as_object_mut() else {
            return Ok(false);
        };

        let tags = map.entry("tags").or_insert_with(|| json!([]));
        if let Some(arr) = tags.as_array_mut() {
            if arr.iter().any(|t| t.as_str() == Some(tag)) {
                return Ok(false);
            }
            arr.push(json!(tag));
            return Ok(true);
        }
        Ok(false)
    }
}

/// Records sent mail instead of delivering it.
#[derive(Default)]
pub struct MemoryMailer {
    sent: RwLock<Vec<(String, String, String)>>,
}

impl MemoryMailer {
    pub fn sent(&self) -> Vec<(String, String, String)> {
        read(&self.sent).clone()
    }
}

#[async_trait]
impl EmailSender for MemoryMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> EngineResult<()> {
        write(&self.sent).push((to.to_string(), subject.to_string(), body.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryReminderStore {
    created: RwLock<Vec<NewReminder>>,
}

impl MemoryReminderStore {
    pub fn created(&self) -> Vec<NewReminder> {
        read(&self.created).clone()
    }
}

#[async_trait]
impl ReminderStore for MemoryReminderStore {
    async fn create(&self, reminder: NewReminder) -> EngineResult<()> {
        write(&self.created).push(reminder);
        Ok(())
    }
}
