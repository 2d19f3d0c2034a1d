//! In-process typed pub/sub event bus ("exchange").
//!
//! Every lifecycle transition publishes an `Envelope`; subscribers filter by
//! a topic prefix (e.g. `"tasks/"` or `"images/"`). Built directly on
//! `tokio::sync::broadcast`, the same primitive a container lifecycle event
//! broadcaster built on.

use std::sync::Arc;
use taskshim_proto::{Envelope, EventPayload};
use tokio::sync::broadcast;

use crate::types::now_ns;

#[derive(Clone)]
pub struct Exchange {
    sender: broadcast::Sender<Envelope>,
}

impl Exchange {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter: None,
        }
    }

    /// Subscribe to topics starting with the given prefix, e.g. `"tasks/"`.
    pub fn subscribe_topic(&self, prefix: impl Into<String>) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter: Some(prefix.into()),
        }
    }

    pub fn publish(&self, namespace: impl Into<String>, payload: EventPayload) {
        let envelope = Envelope {
            namespace: namespace.into(),
            topic: payload.topic().to_string(),
            timestamp_ns: now_ns(),
            payload,
        };
        // No receivers is not an error: the bus has no durability guarantee.
        let _ = self.sender.send(envelope);
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub struct Subscription {
    receiver: broadcast::Receiver<Envelope>,
    filter: Option<String>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => {
                    if self
                        .filter
                        .as_ref()
                        .map(|p| envelope.topic.starts_with(p.as_str()))
                        .unwrap_or(true)
                    {
                        return Some(envelope);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

static GLOBAL_EXCHANGE: std::sync::OnceLock<Arc<Exchange>> = std::sync::OnceLock::new();

/// Process-wide exchange instance, a global event broadcaster singleton.
pub fn global_exchange() -> Arc<Exchange> {
    init_global_exchange(1024)
}

/// Initializes the global exchange with `capacity` if it hasn't been
/// initialized yet; otherwise returns the existing instance untouched.
/// Call this once, early (e.g. from `bootstrap`), before anything else in
/// the process has a chance to call `global_exchange()` with the default
/// capacity.
pub fn init_global_exchange(capacity: usize) -> Arc<Exchange> {
    GLOBAL_EXCHANGE
        .get_or_init(|| Arc::new(Exchange::new(capacity)))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn subscribers_see_published_events_in_order() {
        let exchange = Exchange::new(16);
        let mut sub = exchange.subscribe();

        exchange.publish(
            "default",
            EventPayload::TaskCreate {
                container_id: "c1".into(),
                pid: 1,
                bundle: "/tmp/c1".into(),
            },
        );
        exchange.publish(
            "default",
            EventPayload::TaskStart {
                container_id: "c1".into(),
                pid: 1,
            },
        );

        let first = sub.recv().await.unwrap();
        assert_eq!(first.topic, "tasks/create");
        let second = sub.recv().await.unwrap();
        assert_eq!(second.topic, "tasks/start");
    }

    #[tokio::test]
    async fn topic_filter_drops_nonmatching_events() {
        let exchange = Exchange::new(16);
        let mut sub = exchange.subscribe_topic("images/");

        exchange.publish(
            "default",
            EventPayload::TaskOom {
                container_id: "c1".into(),
            },
        );
        exchange.publish(
            "default",
            EventPayload::ImageCreate {
                name: "alpine".into(),
                labels: HashMap::new(),
            },
        );

        let only = sub.recv().await.unwrap();
        assert_eq!(only.topic, "images/create");
    }
}
