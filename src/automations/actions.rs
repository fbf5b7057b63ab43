// Action configs - the side-effecting operations a step can apply.
//
// Configs arrive as heterogeneous JSON blobs; they deserialize into a tagged
// union so every known action type gets an exhaustive match in the executor.
// Action types this engine does not know yet deserialize to `Unsupported`
// and are silently skipped at execution time (forward compatibility).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfig {
    UpdateContactField {
        field: String,
        value: Value,
    },
    UpdateDealField {
        field: String,
        value: Value,
    },
    /// Canonical field name is `tag`; the legacy plural `tags` spelling is
    /// rejected at save time (see `definition::validate_action_payload`).
    AddContactTag {
        tag: String,
    },
    MoveDealStage {
        stage: String,
    },
    CreateReminder {
        title: String,
        #[serde(default)]
        description: String,
        due_in_days: i64,
    },
    SendEmail {
        subject: String,
        body: String,
        /// Defaults to the entity's own email field.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    // Recruiting pipeline mutations
    UpdateCandidateStatus {
        status: String,
    },
    MoveCandidateStage {
        stage: String,
    },
    #[serde(other)]
    Unsupported,
}

impl ActionConfig {
    /// Stable label used in logs and outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UpdateContactField { .. } => "update_contact_field",
            Self::UpdateDealField { .. } => "update_deal_field",
            Self::AddContactTag { .. } => "add_contact_tag",
            Self::MoveDealStage { .. } => "move_deal_stage",
            Self::CreateReminder { .. } => "create_reminder",
            Self::SendEmail { .. } => "send_email",
            Self::UpdateCandidateStatus { .. } => "update_candidate_status",
            Self::MoveCandidateStage { .. } => "move_candidate_stage",
            Self::Unsupported => "unsupported",
        }
    }
}

/// Result of executing a single action, recorded in the automation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn success(action: &ActionConfig) -> Self {
        Self {
            action: action.kind().to_string(),
            success: true,
            error: None,
        }
    }

    pub fn failure(action: &ActionConfig, error: &str) -> Self {
        Self {
            action: action.kind().to_string(),
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Outcome of one ordered action batch. Already-applied side effects are not
/// rolled back on failure: execution is at-least-once, not atomic.
#[derive(Debug, Clone, Default)]
pub struct ActionBatchResult {
    pub outcomes: Vec<ActionOutcome>,
    /// First error, if the batch aborted. Actions after it were not run.
    pub failed: Option<String>,
}

impl ActionBatchResult {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_none()
    }

    pub fn outcomes_json(&self) -> Value {
        serde_json::to_value(&self.outcomes).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tagged_union_round_trip() {
        let action: ActionConfig = serde_json::from_value(json!({
            "type": "add_contact_tag",
            "tag": "lead"
        }))
        .unwrap();

        assert_eq!(action, ActionConfig::AddContactTag { tag: "lead".into() });
        assert_eq!(action.kind(), "add_contact_tag");
    }

    #[test]
    fn unknown_action_type_deserializes_to_unsupported() {
        let action: ActionConfig = serde_json::from_value(json!({
            "type": "post_to_slack",
            "channel": "#sales"
        }))
        .unwrap();

        assert_eq!(action, ActionConfig::Unsupported);
    }

    #[test]
    fn send_email_recipient_defaults_to_none() {
        let action: ActionConfig = serde_json::from_value(json!({
            "type": "send_email",
            "subject": "hi",
            "body": "there"
        }))
        .unwrap();

        match action {
            ActionConfig::SendEmail { to, .. } => assert!(to.is_none()),
            other => panic!("unexpected action: {other:?}"),
        }
    }
}
