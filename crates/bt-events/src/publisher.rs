//! Topic-exchange event publisher with a supervised reconnect loop.
//!
//! `LapinPublisher::connect` spawns one long-running background task (the
//! same single-task-per-connection shape as a daemon's heartbeat loop) that
//! owns the AMQP connection and channel. `publish` never drives the
//! connection itself — it reads the current channel handle and, if none is
//! available, returns `EventError::Disconnected` rather than blocking the
//! caller on a reconnect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bt_core::Envelope;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::error::EventError;
use crate::reconnect::{Backoff, ConnectionState, StateCell};

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, envelope: &Envelope) -> Result<(), EventError>;
}

/// Publisher backed by a real AMQP broker via `lapin`.
pub struct LapinPublisher {
    amqp_url: String,
    exchange: String,
    state: Arc<StateCell>,
    channel: Arc<RwLock<Option<Channel>>>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl LapinPublisher {
    /// Builds the publisher and spawns its reconnect-supervisor task. The
    /// first connection attempt happens in the background; callers that
    /// publish before it completes get `EventError::Disconnected`.
    pub fn connect(amqp_url: impl Into<String>, exchange: impl Into<String>) -> Self {
        let publisher = Self {
            amqp_url: amqp_url.into(),
            exchange: exchange.into(),
            state: Arc::new(StateCell::new(ConnectionState::Disconnected)),
            channel: Arc::new(RwLock::new(None)),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        };
        publisher.spawn_supervisor();
        publisher
    }

    fn spawn_supervisor(&self) {
        let amqp_url = self.amqp_url.clone();
        let exchange = self.exchange.clone();
        let state = self.state.clone();
        let channel_cell = self.channel.clone();
        let mut backoff = Backoff::new(self.initial_backoff, self.max_backoff);

        tokio::spawn(async move {
            loop {
                state.set(ConnectionState::Connecting);
                match dial(&amqp_url, &exchange).await {
                    Ok((connection, channel)) => {
                        info!(exchange = %exchange, "event publisher connected");
                        backoff.reset();
                        *channel_cell.write() = Some(channel);
                        state.set(ConnectionState::Connected);

                        // Poll connection health rather than block on a
                        // close future — keeps the supervisor resilient to
                        // whatever shape the broker's disconnect takes.
                        while connection.status().connected() {
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        warn!(exchange = %exchange, "event publisher connection lost");
                        *channel_cell.write() = None;
                        state.set(ConnectionState::Disconnected);
                    }
                    Err(e) => {
                        error!(error = %e, "event publisher failed to connect");
                        state.set(ConnectionState::Disconnected);
                    }
                }

                tokio::time::sleep(backoff.next_delay()).await;
            }
        });
    }
}

async fn dial(amqp_url: &str, exchange: &str) -> Result<(Connection, Channel), lapin::Error> {
    let connection =
        Connection::connect(amqp_url, ConnectionProperties::default().with_connection_name("bt-events-publisher".into())).await?;
    let channel = connection.create_channel().await?;
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;
    Ok((connection, channel))
}

#[async_trait]
impl Publisher for LapinPublisher {
    async fn publish(&self, envelope: &Envelope) -> Result<(), EventError> {
        if self.state.get() != ConnectionState::Connected {
            return Err(EventError::Disconnected);
        }
        let channel = self.channel.read().clone();
        let Some(channel) = channel else { return Err(EventError::Disconnected) };

        let payload = serde_json::to_vec(envelope).map_err(|e| EventError::Encoding(e.to_string()))?;
        let routing_key = envelope.routing_key();

        channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await?
            .await?;
        Ok(())
    }
}

/// In-process fake used by tests and by callers that want event publishing
/// without standing up a broker. Every envelope is recorded in arrival
/// order; nothing is ever dropped or reordered.
#[derive(Default, Clone)]
pub struct FakePublisher {
    published: Arc<RwLock<Vec<Envelope>>>,
}

impl FakePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Envelope> {
        self.published.read().clone()
    }
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn publish(&self, envelope: &Envelope) -> Result<(), EventError> {
        self.published.write().push(envelope.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bt_core::event::TaskCreated;
    use bt_core::Event;
    use chrono::Utc;
    use uuid::Uuid;

    fn envelope() -> Envelope {
        Envelope::new(
            Event::TaskCreated(TaskCreated {
                job_id: Uuid::new_v4(),
                strategy_id: Uuid::new_v4(),
                priority: 0,
            }),
            "bt-events-test",
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn fake_publisher_records_in_order() {
        let publisher = FakePublisher::new();
        let first = envelope();
        let second = envelope();
        publisher.publish(&first).await.unwrap();
        publisher.publish(&second).await.unwrap();

        let recorded = publisher.published();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].event_id, first.event_id);
        assert_eq!(recorded[1].event_id, second.event_id);
    }
}
