// Storage adapters for the engine's ports.

pub mod memory;
pub mod postgres;

pub use postgres::{
    PgAutomationStore, PgEnrollmentStore, PgEntityStore, PgLogStore, PgReminderStore,
};
