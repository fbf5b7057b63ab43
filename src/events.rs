// Trigger events - entity mutations that can start enrollments.
//
// The entity CRUD layer (external to this crate) publishes an event on every
// relevant mutation; the engine subscribes and runs trigger matching,
// condition evaluation and enrollment creation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::automations::engine::AutomationEngine;
use crate::entities::EntitySnapshot;

/// Event types that can trigger an automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    ContactCreated,
    ContactUpdated,
    ContactTagAdded,
    DealCreated,
    DealUpdated,
    DealStageChanged,
    Manual,
}

/// One entity mutation, carrying the post-mutation snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub trigger_type: TriggerType,
    pub snapshot: EntitySnapshot,
    pub user_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn new(trigger_type: TriggerType, snapshot: EntitySnapshot, user_id: Option<Uuid>) -> Self {
        Self {
            trigger_type,
            snapshot,
            user_id,
            occurred_at: Utc::now(),
        }
    }
}

/// In-process event bus backed by a tokio broadcast channel.
///
/// Publishing succeeds even when there are no active subscribers
/// (the event is simply dropped).
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TriggerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: TriggerEvent) {
        // send fails only when there are zero receivers
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TriggerEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Subscribe the engine to the bus. Runs until the bus is dropped.
///
/// A fault while handling one event is logged and does not stop the listener.
pub fn spawn_listener(bus: &EventBus, engine: Arc<AutomationEngine>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    debug!(trigger = ?event.trigger_type, entity = %event.snapshot.id, "handling trigger event");
                    if let Err(e) = engine.handle_event(&event).await {
                        warn!("trigger event handling failed: {e}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("event listener lagged, {missed} events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntityKind;
    use serde_json::json;

    #[tokio::test]
    async fn bus_delivers_to_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let snapshot = EntitySnapshot::new(EntityKind::Contact, Uuid::new_v4(), json!({}));
        bus.publish(TriggerEvent::new(TriggerType::ContactCreated, snapshot, None));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.trigger_type, TriggerType::ContactCreated);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        let snapshot = EntitySnapshot::new(EntityKind::Deal, Uuid::new_v4(), json!({}));
        bus.publish(TriggerEvent::new(TriggerType::DealCreated, snapshot, None));
    }
}
