// Step scheduler - polls for due enrollments on a fixed interval.
//
// A tick that takes longer than the interval is not queued up behind itself:
// the in-flight guard makes the overlapping tick a no-op, and
// `MissedTickBehavior::Skip` drops the backlog instead of firing a burst.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::automations::AutomationEngine;

pub struct StepScheduler {
    engine: Arc<AutomationEngine>,
    poll_interval: Duration,
    in_flight: AtomicBool,
}

/// Handle to a running scheduler loop.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the loop to stop and wait for the current tick to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

impl StepScheduler {
    pub fn new(engine: Arc<AutomationEngine>, poll_interval: Duration) -> Self {
        Self {
            engine,
            poll_interval,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Spawn the polling loop.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        info!(interval_secs = self.poll_interval.as_secs(), "starting step scheduler");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(&self);

        let task = tokio::spawn(async move {
            let mut ticker = interval(scheduler.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.tick().await;
                    }
                    _ = shutdown_rx.changed() => {
                        info!("step scheduler shutting down");
                        break;
                    }
                }
            }
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Run one sweep. Public so operators and tests can force a sweep
    /// without waiting out the interval.
    pub async fn tick(&self) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("previous sweep still running, skipping tick");
            return;
        }

        match self.engine.process_due().await {
            Ok(0) => debug!("no due enrollments"),
            Ok(count) => info!(count, "processed due enrollments"),
            Err(e) => error!("enrollment sweep failed: {e}"),
        }

        self.in_flight.store(false, Ordering::SeqCst);
    }
}
