//! Topic-routed publish/subscribe transport.
//!
//! Every component talks to every other component through a [`MessageBus`].
//! A topic is an exchange; a subscription binds one queue to a
//! `(topic, routing_key)` pair and receives every envelope published with
//! exactly that key. There is no wildcard matching and no broadcast: the
//! broker exchange has a single well-known key, the supervisor exchange has
//! one key per job and the worker exchange has one key per connected worker.
//!
//! Handlers run inside the actor that owns the [`Subscription`], which keeps
//! all state mutation for that actor on a single task.

pub mod address;
pub mod envelope;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

pub use address::{
    JobAddress, BROKER_EXCHANGE, BROKER_ROUTING_KEY, SUPERVISOR_EXCHANGE, WORKER_EXCHANGE,
};
pub use envelope::{Envelope, Headers, HEADER_JOB_ID, HEADER_WORKER_ID};

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Topic '{0}' has not been declared")]
    UnknownTopic(String),

    #[error("Bus is closed")]
    Closed,

    #[error("Payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

type Queue = mpsc::UnboundedSender<Envelope>;

#[derive(Debug, Default)]
struct BusState {
    closed: bool,
    /// topic -> routing key -> bound queues
    topics: HashMap<String, HashMap<String, Vec<Queue>>>,
}

/// In-process topic exchange.
///
/// Cheap to clone; all clones share the same exchanges and bindings.
/// Queues are unbounded so that two actors publishing to each other can
/// never block on one another.
#[derive(Debug, Clone, Default)]
pub struct MessageBus {
    state: Arc<Mutex<BusState>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus with the three exchanges the farm uses already declared.
    pub async fn with_farm_topics() -> Result<Self, BusError> {
        let bus = Self::new();
        for topic in [BROKER_EXCHANGE, SUPERVISOR_EXCHANGE, WORKER_EXCHANGE] {
            bus.declare_topic(topic).await?;
        }
        Ok(bus)
    }

    /// Declare an exchange. Declaring an existing one is a no-op.
    pub async fn declare_topic(&self, name: &str) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BusError::Closed);
        }
        state.topics.entry(name.to_string()).or_default();
        Ok(())
    }

    /// Publish `message` to every queue bound to `(topic, routing_key)`.
    ///
    /// Returns the number of queues the envelope was delivered to. Zero is
    /// not an error: the message is simply dropped.
    pub async fn publish<M: Serialize>(
        &self,
        topic: &str,
        routing_key: &str,
        message: &M,
        headers: Headers,
    ) -> Result<usize, BusError> {
        let payload = serde_json::to_value(message)?;
        let envelope = Envelope {
            topic: topic.to_string(),
            routing_key: routing_key.to_string(),
            headers,
            payload,
        };

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BusError::Closed);
        }
        let bindings = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;

        let Some(queues) = bindings.get_mut(routing_key) else {
            tracing::debug!(topic, routing_key, "No subscriber bound, message dropped");
            return Ok(0);
        };

        // Prune queues whose subscription has been dropped.
        queues.retain(|queue| !queue.is_closed());
        let mut delivered = 0;
        for queue in queues.iter() {
            if queue.send(envelope.clone()).is_ok() {
                delivered += 1;
            }
        }
        if queues.is_empty() {
            bindings.remove(routing_key);
        }
        Ok(delivered)
    }

    /// Bind a new queue to `(topic, routing_key)`.
    pub async fn subscribe(&self, topic: &str, routing_key: &str) -> Result<Subscription, BusError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BusError::Closed);
        }
        let bindings = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        bindings.entry(routing_key.to_string()).or_default().push(tx);
        tracing::debug!(topic, routing_key, "Queue bound");

        Ok(Subscription {
            topic: topic.to_string(),
            routing_key: routing_key.to_string(),
            rx,
        })
    }

    /// Close the bus. Every subscription drains what it already holds and
    /// then yields `None`; further publishes fail with [`BusError::Closed`].
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.topics.clear();
        tracing::info!("Message bus closed");
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

/// One bound queue. Dropping it unbinds the queue on the next publish.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    routing_key: String,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(tag = "topic", content = "data", rename_all = "kebab-case")]
    enum Ping {
        Ping { n: u32 },
    }

    #[tokio::test]
    async fn routes_by_exact_key() {
        let bus = MessageBus::new();
        bus.declare_topic("t").await.unwrap();
        let mut a = bus.subscribe("t", "a").await.unwrap();
        let mut b = bus.subscribe("t", "b").await.unwrap();

        let delivered = bus
            .publish("t", "a", &Ping::Ping { n: 1 }, Headers::new())
            .await
            .unwrap();
        assert_eq!(delivered, 1);

        let env = a.recv().await.unwrap();
        assert_eq!(env.decode::<Ping>().unwrap(), Ping::Ping { n: 1 });
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn payload_has_topic_and_data_shape() {
        let bus = MessageBus::new();
        bus.declare_topic("t").await.unwrap();
        let mut sub = bus.subscribe("t", "k").await.unwrap();
        bus.publish("t", "k", &Ping::Ping { n: 7 }, Headers::new())
            .await
            .unwrap();

        let env = sub.recv().await.unwrap();
        assert_eq!(env.payload["topic"], "ping");
        assert_eq!(env.payload["data"]["n"], 7);
    }

    #[tokio::test]
    async fn unknown_topic_is_an_error() {
        let bus = MessageBus::new();
        let err = bus
            .publish("nope", "k", &Ping::Ping { n: 1 }, Headers::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::UnknownTopic(t) if t == "nope"));
        assert!(bus.subscribe("nope", "k").await.is_err());
    }

    #[tokio::test]
    async fn publish_without_subscriber_is_dropped() {
        let bus = MessageBus::new();
        bus.declare_topic("t").await.unwrap();
        let delivered = bus
            .publish("t", "k", &Ping::Ping { n: 1 }, Headers::new())
            .await
            .unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let bus = MessageBus::new();
        bus.declare_topic("t").await.unwrap();
        let sub = bus.subscribe("t", "k").await.unwrap();
        drop(sub);
        let delivered = bus
            .publish("t", "k", &Ping::Ping { n: 1 }, Headers::new())
            .await
            .unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let bus = MessageBus::new();
        bus.declare_topic("t").await.unwrap();
        let mut sub = bus.subscribe("t", "k").await.unwrap();
        bus.close().await;

        assert!(sub.recv().await.is_none());
        assert!(bus.is_closed().await);
        assert!(matches!(
            bus.publish("t", "k", &Ping::Ping { n: 1 }, Headers::new())
                .await
                .unwrap_err(),
            BusError::Closed
        ));
    }
}
