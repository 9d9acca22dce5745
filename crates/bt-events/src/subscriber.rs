//! Per-queue consumer: binds a queue to the topic exchange with one or more
//! routing-key patterns, then dispatches each delivery to a handler with
//! manual ack/nack. A handler that returns an error, or panics, nacks with
//! `requeue = true` — the message goes back to the broker rather than
//! being lost, and one misbehaving handler never brings down the consumer
//! loop or its siblings.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use bt_core::Envelope;
use futures_util::{FutureExt, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties};
use tracing::{error, warn};

use crate::error::EventError;

pub type Handler =
    Arc<dyn Fn(Envelope) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send + Sync>;

#[derive(Clone)]
pub struct SubscriberConfig {
    pub amqp_url: String,
    pub exchange: String,
    pub queue_name: String,
    pub routing_keys: Vec<String>,
    pub prefetch: u16,
}

/// Runs one consumer loop to completion (i.e. until the connection drops).
/// Callers that want resilience across disconnects wrap this in their own
/// retry loop, matching the worker-pool's retry-at-the-caller convention
/// elsewhere in this workspace.
pub async fn run_subscriber(config: SubscriberConfig, handler: Handler) -> Result<(), EventError> {
    let connection = Connection::connect(
        &config.amqp_url,
        ConnectionProperties::default().with_connection_name("bt-events-subscriber".into()),
    )
    .await?;
    let channel = connection.create_channel().await?;
    channel
        .basic_qos(config.prefetch, BasicQosOptions::default())
        .await?;

    channel
        .queue_declare(
            &config.queue_name,
            QueueDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;

    for routing_key in &config.routing_keys {
        channel
            .queue_bind(
                &config.queue_name,
                &config.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    let mut consumer = channel
        .basic_consume(
            &config.queue_name,
            "bt-events-subscriber",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "subscriber delivery error");
                continue;
            }
        };

        let envelope: Envelope = match serde_json::from_slice(&delivery.data) {
            Ok(e) => e,
            Err(e) => {
                error!(error = %e, "undecodable event payload, dropping without requeue");
                delivery.ack(BasicAckOptions::default()).await?;
                continue;
            }
        };

        let handler = handler.clone();
        let outcome = AssertUnwindSafe(handler(envelope)).catch_unwind().await;

        match outcome {
            Ok(Ok(())) => {
                delivery.ack(BasicAckOptions::default()).await?;
            }
            Ok(Err(msg)) => {
                warn!(error = %msg, "event handler failed, nacking with requeue");
                delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await?;
            }
            Err(_) => {
                error!("event handler panicked, nacking with requeue");
                delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await?;
            }
        }
    }

    Ok(())
}

/// Test double standing in for a `Channel`-backed consumer: delivers
/// envelopes from an in-memory queue straight to the handler and records
/// ack/nack/requeue outcomes instead of talking to a broker.
#[cfg(test)]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Outcome {
        Acked,
        NackedRequeued,
    }

    #[derive(Default)]
    pub struct FakeConsumer {
        pub outcomes: Mutex<Vec<Outcome>>,
    }

    impl FakeConsumer {
        pub async fn deliver(&self, envelope: Envelope, handler: &Handler) {
            let outcome = AssertUnwindSafe(handler(envelope)).catch_unwind().await;
            let recorded = match outcome {
                Ok(Ok(())) => Outcome::Acked,
                _ => Outcome::NackedRequeued,
            };
            self.outcomes.lock().push(recorded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeConsumer, Outcome};
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
    async fn successful_handler_acks() {
        let consumer = FakeConsumer::default();
        let handler: Handler = Arc::new(|_env| Box::pin(async { Ok(()) }));
        consumer.deliver(envelope(), &handler).await;
        assert_eq!(consumer.outcomes.lock().as_slice(), &[Outcome::Acked]);
    }

    #[tokio::test]
    async fn failing_handler_nacks_with_requeue() {
        let consumer = FakeConsumer::default();
        let handler: Handler = Arc::new(|_env| Box::pin(async { Err("boom".to_string()) }));
        consumer.deliver(envelope(), &handler).await;
        assert_eq!(consumer.outcomes.lock().as_slice(), &[Outcome::NackedRequeued]);
    }

    #[tokio::test]
    async fn panicking_handler_nacks_with_requeue_and_does_not_abort() {
        let consumer = FakeConsumer::default();
        let handler: Handler = Arc::new(|_env| Box::pin(async { panic!("handler bug") }));
        consumer.deliver(envelope(), &handler).await;
        // A second delivery after a panic still gets processed normally.
        let ok_handler: Handler = Arc::new(|_env| Box::pin(async { Ok(()) }));
        consumer.deliver(envelope(), &ok_handler).await;
        assert_eq!(
            consumer.outcomes.lock().as_slice(),
            &[Outcome::NackedRequeued, Outcome::Acked]
        );
    }
}
