// Condition evaluator - pure predicate evaluation against an entity snapshot.
//
// The evaluator is total: unknown operators and malformed values evaluate to
// false, never to an error. A misconfigured automation must not be able to
// crash the scheduler.

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::EntitySnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    IsEmpty,
    IsNotEmpty,
    GreaterThan,
    LessThan,
    HasTag,
    NotHasTag,
    /// Operators this engine does not know. Evaluate to false, never throw.
    Unsupported,
}

impl ConditionOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::IsEmpty => "is_empty",
            Self::IsNotEmpty => "is_not_empty",
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
            Self::HasTag => "has_tag",
            Self::NotHasTag => "not_has_tag",
            Self::Unsupported => "unsupported",
        }
    }
}

// Unknown operator strings map to Unsupported instead of failing the load.
impl<'de> Deserialize<'de> for ConditionOperator {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "equals" => Self::Equals,
            "not_equals" => Self::NotEquals,
            "contains" => Self::Contains,
            "not_contains" => Self::NotContains,
            "is_empty" => Self::IsEmpty,
            "is_not_empty" => Self::IsNotEmpty,
            "greater_than" => Self::GreaterThan,
            "less_than" => Self::LessThan,
            "has_tag" => Self::HasTag,
            "not_has_tag" => Self::NotHasTag,
            _ => Self::Unsupported,
        })
    }
}

/// How a condition combines with the *next* condition in the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionLogic {
    And,
    Or,
}

/// A single condition to evaluate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Field name to evaluate (supports dot notation for nested fields)
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
    /// Chaining with the following condition. Defaults to AND.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic: Option<ConditionLogic>,
}

impl Condition {
    pub fn new(field: &str, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
            logic: None,
        }
    }

    pub fn with_logic(mut self, logic: ConditionLogic) -> Self {
        self.logic = Some(logic);
        self
    }

    pub fn equals(field: &str, value: Value) -> Self {
        Self::new(field, ConditionOperator::Equals, value)
    }

    pub fn not_equals(field: &str, value: Value) -> Self {
        Self::new(field, ConditionOperator::NotEquals, value)
    }

    pub fn has_tag(tag: &str) -> Self {
        Self::new("tags", ConditionOperator::HasTag, Value::String(tag.into()))
    }

    pub fn greater_than(field: &str, value: f64) -> Self {
        Self::new(field, ConditionOperator::GreaterThan, serde_json::json!(value))
    }
}

/// One evaluated condition, recorded in the automation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionTrace {
    pub field: String,
    pub operator: String,
    pub passed: bool,
}

/// Evaluate an ordered condition list against a snapshot.
///
/// The first condition seeds the result; each following condition combines
/// per the *previous* condition's logic. An AND pair whose left side already
/// failed (or an OR pair whose left side already passed) short-circuits:
/// the right-hand condition is not evaluated and the accumulated value
/// carries forward. `[C1(AND), C2(OR), C3]` therefore evaluates as
/// `(C1 && C2) || C3`, left to right. An empty list is vacuously true.
pub fn evaluate(conditions: &[Condition], snapshot: &EntitySnapshot) -> bool {
    evaluate_traced(conditions, snapshot).0
}

/// Like [`evaluate`], also returning a trace of the conditions actually
/// evaluated (short-circuited ones are omitted).
pub fn evaluate_traced(
    conditions: &[Condition],
    snapshot: &EntitySnapshot,
) -> (bool, Vec<ConditionTrace>) {
    let mut trace = Vec::with_capacity(conditions.len());

    let Some(first) = conditions.first() else {
        return (true, trace);
    };

    let mut acc = evaluate_one(first, snapshot);
    trace.push(trace_entry(first, acc));
    let mut prev_logic = first.logic.unwrap_or(ConditionLogic::And);

    for condition in &conditions[1..] {
        match prev_logic {
            ConditionLogic::And if !acc => {} // pair is false without looking right
            ConditionLogic::Or if acc => {}   // pair is true without looking right
            _ => {
                acc = evaluate_one(condition, snapshot);
                trace.push(trace_entry(condition, acc));
            }
        }
        prev_logic = condition.logic.unwrap_or(ConditionLogic::And);
    }

    (acc, trace)
}

fn trace_entry(condition: &Condition, passed: bool) -> ConditionTrace {
    ConditionTrace {
        field: condition.field.clone(),
        operator: condition.operator.as_str().to_string(),
        passed,
    }
}

fn evaluate_one(condition: &Condition, snapshot: &EntitySnapshot) -> bool {
    let field_value = snapshot.value_at(&condition.field);

    match condition.operator {
        ConditionOperator::Equals => stringify(&field_value) == stringify(&condition.value),
        ConditionOperator::NotEquals => stringify(&field_value) != stringify(&condition.value),
        ConditionOperator::Contains => stringify(&field_value)
            .to_lowercase()
            .contains(&stringify(&condition.value).to_lowercase()),
        ConditionOperator::NotContains => !stringify(&field_value)
            .to_lowercase()
            .contains(&stringify(&condition.value).to_lowercase()),
        ConditionOperator::IsEmpty => field_value.is_null() || stringify(&field_value).is_empty(),
        ConditionOperator::IsNotEmpty => {
            !field_value.is_null() && !stringify(&field_value).is_empty()
        }
        ConditionOperator::GreaterThan => match (numeric(&field_value), numeric(&condition.value)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        ConditionOperator::LessThan => match (numeric(&field_value), numeric(&condition.value)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        ConditionOperator::HasTag => snapshot.has_tag(&stringify(&condition.value)),
        ConditionOperator::NotHasTag => !snapshot.has_tag(&stringify(&condition.value)),
        ConditionOperator::Unsupported => false,
    }
}

/// Loose stringification: null becomes the empty string, strings are taken
/// as-is, everything else uses its JSON rendering.
fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numeric coercion for greater_than / less_than.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
