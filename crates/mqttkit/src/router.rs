//! Routes inbound PUBLISH messages to handlers by topic filter.

use bytes::Bytes;
use mqttkit_protocol::packet::PublishPacket;
use mqttkit_protocol::{Properties, QoS, Result, TopicFilter};
use parking_lot::RwLock;
use std::sync::Arc;

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub duplicate: bool,
    pub packet_id: Option<u16>,
    pub properties: Properties,
}

impl Message {
    /// Payload as UTF-8, replacing invalid sequences.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl From<PublishPacket> for Message {
    fn from(publish: PublishPacket) -> Self {
        Self {
            topic: publish.topic_name,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            duplicate: publish.dup,
            packet_id: publish.packet_id,
            properties: publish.properties,
        }
    }
}

pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

#[derive(Clone)]
struct Route {
    filter: TopicFilter,
    handler: MessageHandler,
}

#[derive(Default)]
pub struct Router {
    routes: RwLock<Vec<Route>>,
    default_handler: RwLock<Option<MessageHandler>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let filters: Vec<String> = self
            .routes
            .read()
            .iter()
            .map(|r| r.filter.as_str().to_string())
            .collect();
        f.debug_struct("Router")
            .field("filters", &filters)
            .field("default_handler", &self.default_handler.read().is_some())
            .finish()
    }
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `filter`. Registering the same filter again
    /// replaces its handler and keeps its position.
    pub fn add_route(&self, filter: &str, handler: MessageHandler) -> Result<()> {
        let filter = TopicFilter::new(filter)?;
        let mut routes = self.routes.write();
        if let Some(existing) = routes.iter_mut().find(|r| r.filter == filter) {
            existing.handler = handler;
        } else {
            routes.push(Route { filter, handler });
        }
        Ok(())
    }

    /// Returns whether a route was removed.
    pub fn delete_route(&self, filter: &str) -> bool {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|r| r.filter.as_str() != filter);
        routes.len() < before
    }

    pub fn set_default_handler(&self, handler: Option<MessageHandler>) {
        *self.default_handler.write() = handler;
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    /// Handlers for `topic` in registration order, or the default handler
    /// when no route matches.
    pub fn matching_handlers(&self, topic: &str) -> Vec<MessageHandler> {
        let matched: Vec<MessageHandler> = self
            .routes
            .read()
            .iter()
            .filter(|r| r.filter.matches(topic))
            .map(|r| Arc::clone(&r.handler))
            .collect();
        if matched.is_empty() {
            self.default_handler.read().iter().cloned().collect()
        } else {
            matched
        }
    }

    /// With `order_matters`, handlers run inline and have returned by the
    /// time this does, so the caller may acknowledge afterwards. Otherwise
    /// they run on a spawned task. Returns whether any handler was found.
    pub fn dispatch(&self, message: Message, order_matters: bool) -> bool {
        let handlers = self.matching_handlers(&message.topic);
        if handlers.is_empty() {
            tracing::debug!(topic = %message.topic, "No handler for message");
            return false;
        }

        if order_matters {
            for handler in &handlers {
                handler(message.clone());
            }
        } else {
            tokio::spawn(async move {
                for handler in handlers {
                    handler(message.clone());
                }
            });
        }
        true
    }
}
