use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadence_engine::automations::AutomationEngine;
use cadence_engine::clock::SystemClock;
use cadence_engine::config::Config;
use cadence_engine::database;
use cadence_engine::events::{spawn_listener, EventBus};
use cadence_engine::jobs::StepScheduler;
use cadence_engine::ports::EmailSender;
use cadence_engine::services::{LogOnlyMailer, SmtpMailer};
use cadence_engine::storage::{
    PgAutomationStore, PgEnrollmentStore, PgEntityStore, PgLogStore, PgReminderStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    let mailer: Arc<dyn EmailSender> = if config.smtp.is_configured() {
        Arc::new(SmtpMailer::new(&config.smtp)?)
    } else {
        warn!("SMTP not configured, send_email actions will be logged and dropped");
        Arc::new(LogOnlyMailer)
    };

    let engine = Arc::new(AutomationEngine::new(
        Arc::new(PgAutomationStore::new(db_pool.clone())),
        Arc::new(PgEnrollmentStore::new(db_pool.clone())),
        Arc::new(PgLogStore::new(db_pool.clone())),
        Arc::new(PgEntityStore::new(db_pool.clone())),
        mailer,
        Arc::new(PgReminderStore::new(db_pool.clone())),
        Arc::new(SystemClock),
    ));

    let bus = EventBus::default();
    let listener = spawn_listener(&bus, engine.clone());

    let scheduler = Arc::new(StepScheduler::new(
        engine,
        Duration::from_secs(config.scheduler.poll_interval_secs),
    ));
    let scheduler_handle = scheduler.start();

    info!("cadence engine running");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    scheduler_handle.shutdown().await;
    listener.abort();
    db_pool.close().await;

    Ok(())
}
