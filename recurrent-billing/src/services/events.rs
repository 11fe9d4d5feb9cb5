//! Downstream notifications for effective transitions.
//!
//! `EventSink` carries in-process domain events (invoicing, messaging
//! subscribe to these). `MessageQueue` carries the cross-process message
//! that tells other workers a payment changed.

use crate::models::{PaymentStatus, RecurrentChargeState};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BillingEvent {
    PaymentStatusChanged {
        payment_id: Uuid,
        old_status: PaymentStatus,
        new_status: PaymentStatus,
        notify_user: bool,
    },
    ChargeStateChanged {
        charge_id: Uuid,
        old_state: RecurrentChargeState,
        new_state: RecurrentChargeState,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentStatusMessage {
    pub payment_id: Uuid,
    pub notify_user: bool,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: BillingEvent) -> Result<(), anyhow::Error>;
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, message: &PaymentStatusMessage) -> Result<(), anyhow::Error>;
}

/// Writes every event to the structured log.
#[derive(Debug, Clone, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: BillingEvent) -> Result<(), anyhow::Error> {
        match &event {
            BillingEvent::PaymentStatusChanged {
                payment_id,
                old_status,
                new_status,
                notify_user,
            } => tracing::info!(
                payment_id = %payment_id,
                old_status = %old_status,
                new_status = %new_status,
                notify_user = notify_user,
                "Payment status changed"
            ),
            BillingEvent::ChargeStateChanged {
                charge_id,
                old_state,
                new_state,
            } => tracing::info!(
                charge_id = %charge_id,
                old_state = %old_state,
                new_state = %new_state,
                "Recurrent charge state changed"
            ),
        }
        Ok(())
    }
}

/// Fans events out to in-process subscribers.
#[derive(Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<BillingEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BillingEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn emit(&self, event: BillingEvent) -> Result<(), anyhow::Error> {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Pushes JSON messages onto a Redis list consumed by other workers.
#[derive(Clone)]
pub struct RedisMessageQueue {
    manager: ConnectionManager,
    queue: String,
}

impl RedisMessageQueue {
    pub async fn new(url: &str, queue: impl Into<String>) -> Result<Self, anyhow::Error> {
        let queue = queue.into();
        tracing::info!(queue = %queue, "Connecting to Redis message queue");
        let client = Client::open(url)?;
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;
        Ok(Self { manager, queue })
    }
}

#[async_trait]
impl MessageQueue for RedisMessageQueue {
    async fn publish(&self, message: &PaymentStatusMessage) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let payload = serde_json::to_string(message)?;
        redis::cmd("RPUSH")
            .arg(&self.queue)
            .arg(payload)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to publish payment message: {}", e))?;
        Ok(())
    }
}

/// Queue used when no cross-process consumer is deployed.
#[derive(Debug, Clone, Default)]
pub struct LogMessageQueue;

#[async_trait]
impl MessageQueue for LogMessageQueue {
    async fn publish(&self, message: &PaymentStatusMessage) -> Result<(), anyhow::Error> {
        tracing::debug!(
            payment_id = %message.payment_id,
            notify_user = message.notify_user,
            "Payment status message"
        );
        Ok(())
    }
}

/// Keeps everything it receives. Used by tests to count side effects.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<BillingEvent>>,
    messages: Mutex<Vec<PaymentStatusMessage>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BillingEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<PaymentStatusMessage> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn payment_events(&self, payment_id: Uuid) -> Vec<BillingEvent> {
        self.events()
            .into_iter()
            .filter(|e| {
                matches!(e, BillingEvent::PaymentStatusChanged { payment_id: id, .. } if *id == payment_id)
            })
            .collect()
    }

    pub fn charge_events(&self, charge_id: Uuid) -> Vec<BillingEvent> {
        self.events()
            .into_iter()
            .filter(|e| {
                matches!(e, BillingEvent::ChargeStateChanged { charge_id: id, .. } if *id == charge_id)
            })
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn emit(&self, event: BillingEvent) -> Result<(), anyhow::Error> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("Event recorder poisoned"))?
            .push(event);
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for RecordingEvents {
    async fn publish(&self, message: &PaymentStatusMessage) -> Result<(), anyhow::Error> {
        self.messages
            .lock()
            .map_err(|_| anyhow::anyhow!("Event recorder poisoned"))?
            .push(message.clone());
        Ok(())
    }
}
