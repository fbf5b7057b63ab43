// Exit criteria evaluator - goal/time/safety based early termination.
//
// Checked on every processing tick. Order is safety -> goals -> time-based;
// the first match wins and its reason is recorded verbatim on the
// enrollment. Safety checks run even when goal/time criteria are disabled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::conditions::{self, Condition, ConditionOperator};
use super::enrollment::Enrollment;
use crate::entities::EntitySnapshot;

/// Per-automation exit configuration. Everything is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitCriteria {
    #[serde(default)]
    pub goals_enabled: bool,
    #[serde(default)]
    pub goals: Vec<GoalCriterion>,
    #[serde(default)]
    pub time_limits_enabled: bool,
    /// Exit once the enrollment is older than this many days.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_enrollment_days: Option<i64>,
    /// Exit once the entity's activity counter exceeds this threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_activity_count: Option<i64>,
    #[serde(default)]
    pub safety: SafetyCriteria,
}

/// Independent safety net, applied before any other criterion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyCriteria {
    /// Master switch for the safety net on this automation.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Absolute cutoff regardless of goals or other time limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_consecutive_errors: Option<i64>,
    /// Force an exit when the entity has unsubscribed or bounced.
    #[serde(default)]
    pub exit_on_unsubscribe: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for SafetyCriteria {
    fn default() -> Self {
        Self {
            enabled: true,
            max_duration_days: None,
            max_consecutive_errors: None,
            exit_on_unsubscribe: false,
        }
    }
}

/// Goal conditions: the entity reached the state the automation was driving
/// it toward.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GoalCriterion {
    FieldValue {
        field: String,
        operator: ConditionOperator,
        value: Value,
    },
    /// Tag presence/absence with any/all semantics.
    TagMatch {
        tags: Vec<String>,
        #[serde(default)]
        match_all: bool,
        #[serde(default = "default_enabled")]
        present: bool,
    },
    DealValueAbove {
        threshold: f64,
    },
    CustomField {
        field: String,
        operator: ConditionOperator,
        value: Value,
    },
}

impl GoalCriterion {
    fn is_met(&self, snapshot: &EntitySnapshot) -> bool {
        match self {
            Self::FieldValue {
                field,
                operator,
                value,
            } => conditions::evaluate(
                &[Condition::new(field, *operator, value.clone())],
                snapshot,
            ),
            Self::TagMatch {
                tags,
                match_all,
                present,
            } => {
                if tags.is_empty() {
                    return false;
                }
                let matched = if *match_all {
                    tags.iter().all(|t| snapshot.has_tag(t))
                } else {
                    tags.iter().any(|t| snapshot.has_tag(t))
                };
                matched == *present
            }
            Self::DealValueAbove { threshold } => snapshot
                .value_at("value")
                .as_f64()
                .map(|v| v > *threshold)
                .unwrap_or(false),
            Self::CustomField {
                field,
                operator,
                value,
            } => {
                let path = format!("custom_fields.{field}");
                conditions::evaluate(&[Condition::new(&path, *operator, value.clone())], snapshot)
            }
        }
    }
}

/// Evaluate all exit criteria for one enrollment. Returns the exit reason of
/// the first matching criterion, or `None` to keep processing.
pub fn check(
    criteria: &ExitCriteria,
    enrollment: &Enrollment,
    snapshot: &EntitySnapshot,
    now: DateTime<Utc>,
) -> Option<String> {
    // Safety net first, independent of the goal/time switches.
    if criteria.safety.enabled {
        if let Some(max_days) = criteria.safety.max_duration_days {
            if enrollment.age_days(now) >= max_days {
                return Some(format!(
                    "safety: enrollment exceeded absolute maximum of {max_days} days"
                ));
            }
        }
        if let Some(max_errors) = criteria.safety.max_consecutive_errors {
            if max_errors > 0 && enrollment.consecutive_errors() >= max_errors {
                return Some(format!("safety: {max_errors} consecutive step errors"));
            }
        }
        if criteria.safety.exit_on_unsubscribe && entity_opted_out(snapshot) {
            return Some("safety: entity unsubscribed or bounced".to_string());
        }
    }

    if criteria.goals_enabled && criteria.goals.iter().any(|g| g.is_met(snapshot)) {
        return Some("goal met".to_string());
    }

    if criteria.time_limits_enabled {
        if let Some(max_days) = criteria.max_enrollment_days {
            if enrollment.age_days(now) >= max_days {
                return Some(format!("time limit: enrolled longer than {max_days} days"));
            }
        }
        if let Some(max_activity) = criteria.max_activity_count {
            let activity = snapshot.value_at("activity_count").as_i64().unwrap_or(0);
            if activity > max_activity {
                return Some(format!("time limit: activity count exceeded {max_activity}"));
            }
        }
    }

    None
}

fn entity_opted_out(snapshot: &EntitySnapshot) -> bool {
    snapshot
        .value_at("unsubscribed")
        .as_bool()
        .unwrap_or(false)
        || snapshot.value_at("email_bounced").as_bool().unwrap_or(false)
}
