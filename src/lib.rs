// Cadence - rule-driven CRM automation engine.
//
// Entities (contacts and deals) enroll into automations when trigger events
// match; multi-step automations advance through delay, condition, branch and
// action steps driven by a polling scheduler; exit criteria can end a run
// early. See the `automations` module for the state machine itself.

pub mod automations;
pub mod clock;
pub mod config;
pub mod database;
pub mod entities;
pub mod error;
pub mod events;
pub mod jobs;
pub mod ports;
pub mod services;
pub mod storage;

pub use automations::{Automation, AutomationEngine, EnrollOutcome, EnrollmentStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{EngineError, EngineResult};
pub use events::{EventBus, TriggerEvent, TriggerType};
