use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entities::order::OrderStatus;

/// Payload handed to the notification sink whenever an order changes status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusNotification {
    pub order_id: Uuid,
    pub order_number: String,
    pub customer_id: Uuid,
    pub old_status: OrderStatus,
    pub new_status: OrderStatus,
    pub comment: String,
    pub tracking_number: Option<String>,
    pub changed_at: DateTime<Utc>,
}

// Define the various events that can occur in the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    // Order events
    OrderCreated {
        order_id: Uuid,
        order_number: String,
        customer_id: Uuid,
        total_amount: Decimal,
    },
    OrderStatusChanged(OrderStatusNotification),

    // Material events
    MaterialReserved {
        material_id: Uuid,
        reservation_id: Uuid,
        order_item_id: Option<Uuid>,
        quantity: Decimal,
    },
    MaterialConsumed {
        material_id: Uuid,
        reservation_id: Uuid,
        quantity: Decimal,
    },
    MaterialReleased {
        material_id: Uuid,
        reservation_id: Uuid,
        quantity: Decimal,
    },
    MaterialStockAdjusted {
        material_id: Uuid,
        old_quantity: Decimal,
        new_quantity: Decimal,
        reason: String,
    },
    LowStock {
        material_id: Uuid,
        maker_id: Uuid,
        material_name: String,
        current_quantity: Decimal,
        min_quantity: Decimal,
    },
}

impl Event {
    /// Short stable name used for logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::OrderStatusChanged(_) => "order_status_changed",
            Event::MaterialReserved { .. } => "material_reserved",
            Event::MaterialConsumed { .. } => "material_consumed",
            Event::MaterialReleased { .. } => "material_released",
            Event::MaterialStockAdjusted { .. } => "material_stock_adjusted",
            Event::LowStock { .. } => "low_stock",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a bounded channel and returns both ends.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Queues an event without waiting. A full or closed channel drops the
    /// event with a warning; callers never see an error.
    pub fn publish(&self, event: Event) {
        let name = event.name();
        match self.sender.try_send(event) {
            Ok(()) => {
                counter!("masterskaya_events.published", 1, "event" => name);
            }
            Err(TrySendError::Full(_)) => {
                warn!(event = name, "Event channel full, dropping event");
                counter!("masterskaya_events.dropped", 1, "event" => name, "reason" => "full");
            }
            Err(TrySendError::Closed(_)) => {
                warn!(event = name, "Event channel closed, dropping event");
                counter!("masterskaya_events.dropped", 1, "event" => name, "reason" => "closed");
            }
        }
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.publish(event);
        }
    }
}

// Handlers implementing this trait process events asynchronously.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: Event) -> Result<(), String>;
}

/// Sink that writes every event to the tracing subscriber.
#[derive(Debug, Default, Clone)]
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle_event(&self, event: Event) -> Result<(), String> {
        match &event {
            Event::OrderStatusChanged(n) => info!(
                order_id = %n.order_id,
                order_number = %n.order_number,
                old_status = %n.old_status,
                new_status = %n.new_status,
                tracking_number = ?n.tracking_number,
                "Order status changed"
            ),
            Event::LowStock {
                material_id,
                material_name,
                current_quantity,
                min_quantity,
                ..
            } => warn!(
                material_id = %material_id,
                material = %material_name,
                current = %current_quantity,
                min = %min_quantity,
                "Material stock is low"
            ),
            other => debug!(event = other.name(), "Event: {:?}", other),
        }
        Ok(())
    }
}

/// Fans every received event out to all handlers until the channel closes.
/// A failing handler is logged and does not affect the others.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        let name = event.name();
        let results = join_all(
            handlers
                .iter()
                .map(|handler| handler.handle_event(event.clone())),
        )
        .await;

        for err in results.into_iter().filter_map(Result::err) {
            error!(event = name, error = %err, "Event handler failed");
            counter!("masterskaya_events.handler_failures", 1, "event" => name);
        }
    }

    warn!("Event processing loop has ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Event>>);

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle_event(&self, event: Event) -> Result<(), String> {
            self.0.lock().await.push(event);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle_event(&self, _event: Event) -> Result<(), String> {
            Err("smtp unreachable".into())
        }
    }

    fn released() -> Event {
        Event::MaterialReleased {
            material_id: Uuid::new_v4(),
            reservation_id: Uuid::new_v4(),
            quantity: Decimal::from(3),
        }
    }

    #[test]
    fn publish_never_blocks_on_full_channel() {
        let (sender, mut rx) = EventSender::channel(1);
        sender.publish(released());
        sender.publish(released());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publish_to_closed_channel_is_silent() {
        let (sender, rx) = EventSender::channel(4);
        drop(rx);
        sender.publish(released());
    }

    #[tokio::test]
    async fn failing_handler_does_not_starve_others() {
        let (sender, rx) = EventSender::channel(8);
        let recorder = Arc::new(Recorder::default());
        let handlers: Vec<Arc<dyn EventHandler>> =
            vec![Arc::new(Failing), recorder.clone(), Arc::new(LoggingEventHandler)];

        sender.publish(released());
        sender.publish(released());
        drop(sender);

        process_events(rx, handlers).await;
        assert_eq!(recorder.0.lock().await.len(), 2);
    }
}
