// Postgres adapters for the engine's ports.
//
// Definitions, steps, enrollments and logs are owned by this crate; the
// `crm_entities` and `reminders` tables are reference implementations of the
// external collaborator ports for deployments without a separate CRM service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::automations::definition::{self, Automation};
use crate::automations::enrollment::{Enrollment, EnrollmentStats, EnrollmentStatus};
use crate::automations::log::{AutomationLog, LogStatus};
use crate::automations::steps::{AutomationStep, StepConfig};
use crate::entities::{EntityKind, EntitySnapshot};
use crate::error::{EngineError, EngineResult};
use crate::events::TriggerType;
use crate::ports::{
    AutomationStore, EnrollmentStore, EntityStore, LogStore, NewReminder, ReminderStore,
};

fn parse_json<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> EngineResult<T> {
    serde_json::from_value(value)
        .map_err(|e| EngineError::Storage(format!("corrupt {what} column: {e}")))
}

fn parse_str<T: std::str::FromStr<Err = String>>(s: &str, what: &str) -> EngineResult<T> {
    s.parse()
        .map_err(|e| EngineError::Storage(format!("corrupt {what} column: {e}")))
}

// TriggerType is persisted as its snake_case serde name.
fn parse_trigger_type(s: &str) -> EngineResult<TriggerType> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| EngineError::Storage(format!("unknown trigger type: {s}")))
}

fn trigger_type_str(t: TriggerType) -> String {
    match serde_json::to_value(t) {
        Ok(Value::String(s)) => s,
        _ => "manual".to_string(),
    }
}

type AutomationRow = (
    Uuid,
    String,
    String,
    Value,
    Value,
    Value,
    bool,
    bool,
    i64,
    i64,
    i64,
    Value,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

const AUTOMATION_COLUMNS: &str = "id, name, trigger_type, trigger_filter, conditions, actions, \
     is_multi_step, is_active, enrolled_count, active_count, completed_count, \
     exit_criteria, created_at, updated_at";

fn automation_from_row(row: AutomationRow) -> EngineResult<Automation> {
    Ok(Automation {
        id: row.0,
        name: row.1,
        trigger_type: parse_trigger_type(&row.2)?,
        trigger_filter: row.3,
        conditions: parse_json(row.4, "conditions")?,
        actions: parse_json(row.5, "actions")?,
        is_multi_step: row.6,
        is_active: row.7,
        enrolled_count: row.8,
        active_count: row.9,
        completed_count: row.10,
        exit_criteria: parse_json(row.11, "exit_criteria")?,
        created_at: row.12,
        updated_at: row.13,
    })
}

pub struct PgAutomationStore {
    pool: PgPool,
}

impl PgAutomationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a new definition and its steps. Validates the whole graph
    /// first; nothing is written when validation fails.
    pub async fn create(
        &self,
        automation: &Automation,
        steps: &[AutomationStep],
    ) -> EngineResult<()> {
        definition::validate(automation, steps)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO automations (
                id, name, trigger_type, trigger_filter, conditions, actions,
                is_multi_step, is_active, enrolled_count, active_count,
                completed_count, exit_criteria, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(automation.id)
        .bind(&automation.name)
        .bind(trigger_type_str(automation.trigger_type))
        .bind(&automation.trigger_filter)
        .bind(serde_json::to_value(&automation.conditions).unwrap_or(Value::Null))
        .bind(serde_json::to_value(&automation.actions).unwrap_or(Value::Null))
        .bind(automation.is_multi_step)
        .bind(automation.is_active)
        .bind(automation.enrolled_count)
        .bind(automation.active_count)
        .bind(automation.completed_count)
        .bind(serde_json::to_value(&automation.exit_criteria).unwrap_or(Value::Null))
        .bind(automation.created_at)
        .execute(&mut *tx)
        .await?;

        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO automation_steps (id, automation_id, step_index, config, next_step_index)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(step.id)
            .bind(step.automation_id)
            .bind(step.step_index)
            .bind(serde_json::to_value(&step.config).unwrap_or(Value::Null))
            .bind(step.next_step_index)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn set_active(&self, id: Uuid, is_active: bool) -> EngineResult<()> {
        sqlx::query("UPDATE automations SET is_active = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(is_active)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AutomationStore for PgAutomationStore {
    async fn get(&self, id: Uuid) -> EngineResult<Option<Automation>> {
        let row = sqlx::query_as::<_, AutomationRow>(&format!(
            "SELECT {AUTOMATION_COLUMNS} FROM automations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(automation_from_row).transpose()
    }

    async fn list_active(&self) -> EngineResult<Vec<Automation>> {
        let rows = sqlx::query_as::<_, AutomationRow>(&format!(
            "SELECT {AUTOMATION_COLUMNS} FROM automations WHERE is_active = true ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(automation_from_row).collect()
    }

    async fn steps(&self, automation_id: Uuid) -> EngineResult<Vec<AutomationStep>> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid, i32, Value, Option<i32>)>(
            r#"
            SELECT id, automation_id, step_index, config, next_step_index
            FROM automation_steps
            WHERE automation_id = $1
            ORDER BY step_index ASC
            "#,
        )
        .bind(automation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(AutomationStep {
                    id: row.0,
                    automation_id: row.1,
                    step_index: row.2,
                    config: parse_json::<StepConfig>(row.3, "step config")?,
                    next_step_index: row.4,
                })
            })
            .collect()
    }

    async fn adjust_counters(
        &self,
        id: Uuid,
        enrolled: i64,
        active: i64,
        completed: i64,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE automations
            SET enrolled_count = enrolled_count + $2,
                active_count = GREATEST(active_count + $3, 0),
                completed_count = completed_count + $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(enrolled)
        .bind(active)
        .bind(completed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

type EnrollmentRow = (
    Uuid,
    Uuid,
    String,
    Uuid,
    i32,
    String,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Value,
    Option<String>,
);

const ENROLLMENT_COLUMNS: &str = "id, automation_id, entity_kind, entity_id, current_step_index, \
     status, enrolled_at, completed_at, exited_at, next_step_at, metadata, exit_reason";

fn enrollment_from_row(row: EnrollmentRow) -> EngineResult<Enrollment> {
    Ok(Enrollment {
        id: row.0,
        automation_id: row.1,
        entity_kind: parse_str::<EntityKind>(&row.2, "entity_kind")?,
        entity_id: row.3,
        current_step_index: row.4,
        status: parse_str::<EnrollmentStatus>(&row.5, "status")?,
        enrolled_at: row.6,
        completed_at: row.7,
        exited_at: row.8,
        next_step_at: row.9,
        metadata: row.10,
        exit_reason: row.11,
    })
}

pub struct PgEnrollmentStore {
    pool: PgPool,
}

impl PgEnrollmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EnrollmentStore for PgEnrollmentStore {
    async fn get(&self, id: Uuid) -> EngineResult<Option<Enrollment>> {
        let row = sqlx::query_as::<_, EnrollmentRow>(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM automation_enrollments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(enrollment_from_row).transpose()
    }

    async fn find_active(
        &self,
        automation_id: Uuid,
        entity_kind: EntityKind,
        entity_id: Uuid,
    ) -> EngineResult<Option<Enrollment>> {
        let row = sqlx::query_as::<_, EnrollmentRow>(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM automation_enrollments \
             WHERE automation_id = $1 AND entity_kind = $2 AND entity_id = $3 AND status = 'active'"
        ))
        .bind(automation_id)
        .bind(entity_kind.as_str())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(enrollment_from_row).transpose()
    }

    async fn insert(&self, enrollment: &Enrollment) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO automation_enrollments (
                id, automation_id, entity_kind, entity_id, current_step_index,
                status, enrolled_at, completed_at, exited_at, next_step_at,
                metadata, exit_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(enrollment.id)
        .bind(enrollment.automation_id)
        .bind(enrollment.entity_kind.as_str())
        .bind(enrollment.entity_id)
        .bind(enrollment.current_step_index)
        .bind(enrollment.status.as_str())
        .bind(enrollment.enrolled_at)
        .bind(enrollment.completed_at)
        .bind(enrollment.exited_at)
        .bind(enrollment.next_step_at)
        .bind(&enrollment.metadata)
        .bind(&enrollment.exit_reason)
        .execute(&self.pool)
        .await?;

        // the partial unique index enforces one active enrollment per
        // (automation, entity); a concurrent duplicate lands here
        if result.rows_affected() == 0 {
            return Err(EngineError::EnrollmentConflict);
        }
        Ok(())
    }

    async fn update(&self, enrollment: &Enrollment) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE automation_enrollments
            SET current_step_index = $2, status = $3, completed_at = $4,
                exited_at = $5, next_step_at = $6, metadata = $7, exit_reason = $8
            WHERE id = $1
            "#,
        )
        .bind(enrollment.id)
        .bind(enrollment.current_step_index)
        .bind(enrollment.status.as_str())
        .bind(enrollment.completed_at)
        .bind(enrollment.exited_at)
        .bind(enrollment.next_step_at)
        .bind(&enrollment.metadata)
        .bind(&enrollment.exit_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>) -> EngineResult<Vec<Enrollment>> {
        // inactive automations keep their enrollments dormant
        let rows = sqlx::query_as::<_, EnrollmentRow>(
            r#"
            SELECT e.id, e.automation_id, e.entity_kind, e.entity_id,
                   e.current_step_index, e.status, e.enrolled_at, e.completed_at,
                   e.exited_at, e.next_step_at, e.metadata, e.exit_reason
            FROM automation_enrollments e
            JOIN automations a ON a.id = e.automation_id AND a.is_active = true
            WHERE e.status = 'active'
              AND (e.next_step_at IS NULL OR e.next_step_at <= $1)
            ORDER BY e.next_step_at ASC NULLS FIRST
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(enrollment_from_row).collect()
    }

    async fn stats(&self, automation_id: Uuid) -> EngineResult<EnrollmentStats> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT status, COUNT(*)
            FROM automation_enrollments
            WHERE automation_id = $1
            GROUP BY status
            "#,
        )
        .bind(automation_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = EnrollmentStats::default();
        for (status, count) in rows {
            match parse_str::<EnrollmentStatus>(&status, "status")? {
                EnrollmentStatus::Active => stats.active = count,
                EnrollmentStatus::Completed => stats.completed = count,
                EnrollmentStatus::Failed => stats.failed = count,
                EnrollmentStatus::Unenrolled => stats.unenrolled = count,
                EnrollmentStatus::Exited => stats.exited = count,
            }
        }
        Ok(stats)
    }
}

pub struct PgLogStore {
    pool: PgPool,
}

impl PgLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogStore for PgLogStore {
    async fn append(&self, log: &AutomationLog) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO automation_logs (
                id, automation_id, enrollment_id, entity_kind, entity_id,
                trigger_snapshot, conditions_evaluated, actions_executed,
                status, error, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(log.id)
        .bind(log.automation_id)
        .bind(log.enrollment_id)
        .bind(log.entity_kind.as_str())
        .bind(log.entity_id)
        .bind(&log.trigger)
        .bind(&log.conditions_evaluated)
        .bind(&log.actions_executed)
        .bind(log.status.as_str())
        .bind(&log.error)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn for_automation(
        &self,
        automation_id: Uuid,
        limit: i64,
    ) -> EngineResult<Vec<AutomationLog>> {
        let rows = sqlx::query_as::<_, (
            Uuid,
            Uuid,
            Option<Uuid>,
            String,
            Uuid,
            Value,
            Value,
            Value,
            String,
            Option<String>,
            DateTime<Utc>,
        )>(
            r#"
            SELECT id, automation_id, enrollment_id, entity_kind, entity_id,
                   trigger_snapshot, conditions_evaluated, actions_executed,
                   status, error, created_at
            FROM automation_logs
            WHERE automation_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(automation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(AutomationLog {
                    id: row.0,
                    automation_id: row.1,
                    enrollment_id: row.2,
                    entity_kind: parse_str::<EntityKind>(&row.3, "entity_kind")?,
                    entity_id: row.4,
                    trigger: row.5,
                    conditions_evaluated: row.6,
                    actions_executed: row.7,
                    status: parse_str::<LogStatus>(&row.8, "status")?,
                    error: row.9,
                    created_at: row.10,
                })
            })
            .collect()
    }
}

/// Reference entity store backed by the `crm_entities` table. Deployments
/// with a real CRM service implement `EntityStore` against it instead.
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, kind: EntityKind, id: Uuid, fields: &Value) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO crm_entities (kind, id, fields)
            VALUES ($1, $2, $3)
            ON CONFLICT (kind, id) DO UPDATE SET fields = $3, updated_at = NOW()
            "#,
        )
        .bind(kind.as_str())
        .bind(id)
        .bind(fields)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn find(&self, kind: EntityKind, id: Uuid) -> EngineResult<Option<EntitySnapshot>> {
        let row = sqlx::query_as::<_, (Value,)>(
            "SELECT fields FROM crm_entities WHERE kind = $1 AND id = $2",
        )
        .bind(kind.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(fields,)| EntitySnapshot::new(kind, id, fields)))
    }

    async fn update_field(
        &self,
        kind: EntityKind,
        id: Uuid,
        field: &str,
        value: &Value,
    ) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE crm_entities
            SET fields = jsonb_set(fields, ARRAY[$3], $4::jsonb, true), updated_at = NOW()
            WHERE kind = $1 AND id = $2
            "#,
        )
        .bind(kind.as_str())
        .bind(id)
        .bind(field)
        .bind(value)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::EntityNotFound { kind, id });
        }
        Ok(())
    }

    async fn add_tag(&self, kind: EntityKind, id: Uuid, tag: &str) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE crm_entities
            SET fields = jsonb_set(
                    fields, '{tags}',
                    COALESCE(fields->'tags', '[]'::jsonb) || to_jsonb($3::text), true),
                updated_at = NOW()
            WHERE kind = $1 AND id = $2
              AND NOT jsonb_exists(COALESCE(fields->'tags', '[]'::jsonb), $3)
            "#,
        )
        .bind(kind.as_str())
        .bind(id)
        .bind(tag)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Reference reminder store backed by the `reminders` table.
pub struct PgReminderStore {
    pool: PgPool,
}

impl PgReminderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReminderStore for PgReminderStore {
    async fn create(&self, reminder: NewReminder) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reminders (title, description, due_at, entity_kind, entity_id)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&reminder.title)
        .bind(&reminder.description)
        .bind(reminder.due_at)
        .bind(reminder.entity_kind.as_str())
        .bind(reminder.entity_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
