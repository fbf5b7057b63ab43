// Automation engine modules.

pub mod actions;
pub mod branching;
pub mod conditions;
pub mod definition;
pub mod engine;
pub mod enrollment;
pub mod executor;
pub mod exits;
pub mod log;
pub mod steps;

pub use actions::{ActionBatchResult, ActionConfig, ActionOutcome};
pub use conditions::{Condition, ConditionLogic, ConditionOperator, ConditionTrace};
pub use definition::{validate, validate_action_payload, Automation};
pub use engine::{AutomationEngine, EnrollOutcome};
pub use enrollment::{Enrollment, EnrollmentStats, EnrollmentStatus};
pub use executor::ActionExecutor;
pub use exits::{ExitCriteria, GoalCriterion, SafetyCriteria};
pub use log::{AutomationLog, LogStatus};
pub use steps::{AutomationStep, BranchArm, StepArena, StepConfig};
