use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::order::OrderStatus;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is gone.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Dropping domain event");
        }
    }
}

/// State changes other parts of the system may react to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
        total: i64,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderCancelled(Uuid),
    PaymentSettled {
        order_id: Uuid,
        transaction_id: Option<String>,
        at: DateTime<Utc>,
    },
    PaymentFailed {
        order_id: Uuid,
        response_code: String,
    },
}

/// Drains the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::OrderCreated {
                order_id,
                order_number,
                total,
            } => {
                info!(%order_id, %order_number, total, "order created");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(%order_id, %old_status, %new_status, "order status changed");
            }
            Event::OrderCancelled(order_id) => {
                info!(%order_id, "order cancelled");
            }
            Event::PaymentSettled {
                order_id,
                transaction_id,
                at,
            } => {
                info!(%order_id, ?transaction_id, %at, "payment settled");
            }
            Event::PaymentFailed {
                order_id,
                response_code,
            } => {
                warn!(%order_id, %response_code, "payment failed");
            }
        }
    }

    warn!("Event processing loop has ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        let id = Uuid::new_v4();

        sender.send(Event::OrderCancelled(id)).await.unwrap();
        assert_eq!(rx.recv().await, Some(Event::OrderCancelled(id)));
    }

    #[tokio::test]
    async fn closed_channel_is_not_fatal() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);

        assert!(sender.send(Event::OrderCancelled(Uuid::nil())).await.is_err());
        sender.send_or_log(Event::OrderCancelled(Uuid::nil())).await;
    }

    #[tokio::test]
    async fn processing_loop_ends_when_senders_drop() {
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(process_events(rx));
        EventSender::new(tx)
            .send(Event::PaymentFailed {
                order_id: Uuid::new_v4(),
                response_code: "24".into(),
            })
            .await
            .unwrap();
        handle.await.unwrap();
    }
}
