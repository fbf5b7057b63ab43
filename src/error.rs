// Engine error taxonomy.
//
// Per-enrollment faults are caught at the top of step processing and turned
// into terminal enrollment states; they never escape the scheduler loop.
// Condition evaluation deliberately has no error variant: the evaluator is
// total and treats any misconfiguration as `false`.

use thiserror::Error;
use uuid::Uuid;

use crate::entities::EntityKind;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{kind} {id} not found")]
    EntityNotFound { kind: EntityKind, id: Uuid },

    #[error("action execution failed: {0}")]
    ActionExecution(String),

    #[error("an active enrollment already exists for this entity")]
    EnrollmentConflict,

    #[error("automation {0} not found")]
    AutomationNotFound(Uuid),

    #[error("automation {0} is not active")]
    AutomationInactive(Uuid),

    #[error("invalid automation definition: {0}")]
    Validation(String),

    #[error("email delivery failed: {0}")]
    Email(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
