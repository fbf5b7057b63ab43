// Action executor - applies one step's action batch to an entity.
//
// Actions run strictly in declared order; the first failure aborts the rest
// of the batch. Side effects already applied are not rolled back
// (at-least-once semantics); idempotent actions like tag-adds make replays
// harmless.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use super::actions::{ActionBatchResult, ActionConfig, ActionOutcome};
use crate::entities::EntitySnapshot;
use crate::error::{EngineError, EngineResult};
use crate::ports::{EmailSender, EntityStore, NewReminder, ReminderStore};

pub struct ActionExecutor {
    entities: Arc<dyn EntityStore>,
    email: Arc<dyn EmailSender>,
    reminders: Arc<dyn ReminderStore>,
    template_re: Regex,
}

impl ActionExecutor {
    pub fn new(
        entities: Arc<dyn EntityStore>,
        email: Arc<dyn EmailSender>,
        reminders: Arc<dyn ReminderStore>,
    ) -> Self {
        Self {
            entities,
            email,
            reminders,
            // the pattern is a literal, compile once
            template_re: Regex::new(r"\{\{([^}]+)\}\}").unwrap(),
        }
    }

    /// Execute an ordered batch against the given snapshot.
    pub async fn execute_batch(
        &self,
        actions: &[ActionConfig],
        snapshot: &EntitySnapshot,
        now: DateTime<Utc>,
    ) -> ActionBatchResult {
        let mut result = ActionBatchResult::default();

        for action in actions {
            debug!(action = action.kind(), entity = %snapshot.id, "executing action");

            match self.execute_one(action, snapshot, now).await {
                Ok(()) => result.outcomes.push(ActionOutcome::success(action)),
                Err(e) => {
                    let message = e.to_string();
                    warn!(action = action.kind(), entity = %snapshot.id, "action failed: {message}");
                    result.outcomes.push(ActionOutcome::failure(action, &message));
                    result.failed = Some(message);
                    break; // abort the remaining actions in this batch
                }
            }
        }

        result
    }

    async fn execute_one(
        &self,
        action: &ActionConfig,
        snapshot: &EntitySnapshot,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        match action {
            ActionConfig::UpdateContactField { field, value }
            | ActionConfig::UpdateDealField { field, value } => {
                self.entities
                    .update_field(snapshot.kind, snapshot.id, field, value)
                    .await
            }
            ActionConfig::AddContactTag { tag } => {
                let added = self.entities.add_tag(snapshot.kind, snapshot.id, tag).await?;
                if !added {
                    debug!(tag, entity = %snapshot.id, "tag already present");
                }
                Ok(())
            }
            ActionConfig::MoveDealStage { stage } => {
                self.entities
                    .update_field(snapshot.kind, snapshot.id, "stage", &Value::String(stage.clone()))
                    .await
            }
            ActionConfig::CreateReminder {
                title,
                description,
                due_in_days,
            } => {
                self.reminders
                    .create(NewReminder {
                        title: self.render(title, snapshot),
                        description: self.render(description, snapshot),
                        due_at: now + Duration::days(*due_in_days),
                        entity_kind: snapshot.kind,
                        entity_id: snapshot.id,
                    })
                    .await
            }
            ActionConfig::SendEmail { subject, body, to } => {
                let recipient = match to {
                    Some(to) => self.render(to, snapshot),
                    None => snapshot.email().ok_or_else(|| {
                        EngineError::ActionExecution(format!(
                            "{} {} has no email address",
                            snapshot.kind, snapshot.id
                        ))
                    })?,
                };
                self.email
                    .send(
                        &recipient,
                        &self.render(subject, snapshot),
                        &self.render(body, snapshot),
                    )
                    .await
            }
            ActionConfig::UpdateCandidateStatus { status } => {
                self.entities
                    .update_field(
                        snapshot.kind,
                        snapshot.id,
                        "candidate_status",
                        &Value::String(status.clone()),
                    )
                    .await
            }
            ActionConfig::MoveCandidateStage { stage } => {
                self.entities
                    .update_field(
                        snapshot.kind,
                        snapshot.id,
                        "recruiting_stage",
                        &Value::String(stage.clone()),
                    )
                    .await
            }
            ActionConfig::Unsupported => {
                // Silent skip: action types from newer definitions do
                // nothing on this engine version.
                warn!(entity = %snapshot.id, "skipping unsupported action type");
                Ok(())
            }
        }
    }

    /// Replace `{{dotted.path}}` template variables with snapshot values.
    /// Unresolved variables are left in place.
    fn render(&self, template: &str, snapshot: &EntitySnapshot) -> String {
        let mut result = template.to_string();

        for cap in self.template_re.captures_iter(template) {
            let path = cap[1].trim();
            let value = snapshot.value_at(path);
            if value.is_null() {
                continue;
            }

            let replacement = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            result = result.replace(&cap[0], &replacement);
        }

        result
    }
}
