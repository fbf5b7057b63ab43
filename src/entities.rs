// Entity snapshots - the engine's read view of contacts and deals.
//
// The CRUD stores that own these records live outside the engine; all the
// engine sees is a point-in-time JSON snapshot of the entity's fields.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Contact,
    Deal,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contact => "contact",
            Self::Deal => "deal",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contact" => Ok(Self::Contact),
            "deal" => Ok(Self::Deal),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// Point-in-time view of one entity's fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub kind: EntityKind,
    pub id: Uuid,
    /// Flat-ish JSON object; nested objects are reachable via dotted paths.
    pub fields: Value,
}

impl EntitySnapshot {
    pub fn new(kind: EntityKind, id: Uuid, fields: Value) -> Self {
        Self { kind, id, fields }
    }

    /// Resolve a dotted path (e.g. `deal.value`) against the snapshot.
    /// Missing path segments yield `Value::Null`.
    pub fn value_at(&self, path: &str) -> Value {
        lookup_path(&self.fields, path)
    }

    /// The entity's tag set. Non-string entries are ignored.
    pub fn tags(&self) -> Vec<String> {
        self.fields
            .get("tags")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags().iter().any(|t| t == tag)
    }

    /// Convenience accessor for the entity's email address, used when a
    /// send_email action has no explicit recipient.
    pub fn email(&self) -> Option<String> {
        self.fields
            .get("email")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// Walk a dotted path through nested JSON objects.
pub fn lookup_path(root: &Value, path: &str) -> Value {
    let mut current = root;
    for part in path.split('.') {
        match current.get(part) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}
