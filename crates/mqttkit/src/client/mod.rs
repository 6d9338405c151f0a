//! The client handle.
//!
//! [`MqttClient`] is cheap to clone; every clone drives the same
//! connection. Operations never block on the network: they hand work to
//! the session tasks and return a token that completes when the broker
//! has answered.

mod connect;
pub(crate) mod inner;
mod resume;
pub(crate) mod session;

use crate::message_ids::PendingToken;
use crate::options::ClientOptions;
use crate::router::MessageHandler;
use crate::status::Status;
use crate::store::outbound_key;
use crate::token::{
    ConnectToken, DisconnectToken, PublishToken, SubscribeToken, UnsubscribeToken,
};
use bytes::Bytes;
use inner::ClientInner;
use mqttkit_protocol::packet::{PublishPacket, SubscribePacket, UnsubscribePacket};
use mqttkit_protocol::{
    validate_topic_filter, validate_topic_name, MqttError, Packet, Properties, QoS, Result,
};
use session::Envelope;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

#[derive(Clone)]
pub struct MqttClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("client_id", &self.inner.options.read().client_id)
            .field("status", &self.inner.status.status())
            .finish()
    }
}

/// Where a new outbound flow goes, given the connection status.
enum Disposition {
    Send(session::Links),
    Park,
    Refuse,
}

impl MqttClient {
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        Self {
            inner: ClientInner::new(options),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    pub fn status(&self) -> Status {
        self.inner.status.status()
    }

    /// True only while a connection is up. See also
    /// [`is_connection_open`](Self::is_connection_open).
    pub fn is_connected(&self) -> bool {
        self.inner.status.is_connected()
    }

    pub fn is_connection_open(&self) -> bool {
        self.inner.status.is_connection_open()
    }

    /// A watch over status changes.
    pub fn status_updates(&self) -> tokio::sync::watch::Receiver<Status> {
        self.inner.status.subscribe()
    }

    /// A snapshot of the current options. Reconnect handlers may have
    /// changed them since the client was built.
    pub fn options(&self) -> ClientOptions {
        self.inner.options()
    }

    /// Starts connecting in the background. The token completes with the
    /// CONNACK outcome, or with the error that ended the attempt. With
    /// `connect_retry` the attempt keeps going until it succeeds or
    /// [`disconnect`](Self::disconnect) is called.
    #[instrument(skip(self))]
    pub fn connect(&self) -> ConnectToken {
        let completion = match self.inner.status.connecting() {
            Ok(completion) => completion,
            Err(e) => {
                tracing::debug!(error = %e, "Connect refused");
                return ConnectToken::failed(e);
            }
        };
        let token = ConnectToken::new();
        tokio::spawn(connect::run_connect(
            Arc::clone(&self.inner),
            completion,
            token.clone(),
        ));
        token
    }

    /// Sends DISCONNECT after giving queued publishes up to `quiesce` to be
    /// written, then closes the connection. Returns immediately.
    pub fn disconnect(&self, quiesce: Duration) -> DisconnectToken {
        self.spawn_shutdown(Some(quiesce))
    }

    /// Closes the connection without DISCONNECT, so the broker publishes
    /// the will message.
    pub fn force_disconnect(&self) -> DisconnectToken {
        self.spawn_shutdown(None)
    }

    fn spawn_shutdown(&self, quiesce: Option<Duration>) -> DisconnectToken {
        let token = DisconnectToken::new();
        let inner = Arc::clone(&self.inner);
        let completed = token.clone();
        tokio::spawn(async move {
            let result = connect::shutdown(inner, quiesce).await;
            if let Err(e) = &result {
                tracing::debug!(error = %e, "Disconnect refused");
            }
            completed.complete(result);
        });
        token
    }

    fn route(&self, qos: QoS, parkable: bool) -> Disposition {
        match self.inner.status.status() {
            Status::Connected => self.inner.links().map_or(Disposition::Park, Disposition::Send),
            Status::Reconnecting if qos != QoS::AtMostOnce && parkable => Disposition::Park,
            Status::Connecting
                if qos != QoS::AtMostOnce && parkable && self.inner.options.read().connect_retry =>
            {
                Disposition::Park
            }
            _ => Disposition::Refuse,
        }
    }

    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
    ) -> PublishToken {
        self.publish_with_properties(topic, qos, retain, payload, Properties::new())
            .await
    }

    /// Queues a publish. QoS 0 tokens complete once the packet is written,
    /// QoS 1 on PUBACK and QoS 2 on PUBCOMP. While reconnecting, QoS 1/2
    /// messages are stored and sent once the connection is back.
    #[instrument(skip(self, payload, properties))]
    pub async fn publish_with_properties(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
        properties: Properties,
    ) -> PublishToken {
        let token = PublishToken::new();
        if let Err(e) = validate_topic_name(topic) {
            token.fail(e);
            return token;
        }
        let publish = PublishPacket::new(topic, payload, qos)
            .with_retain(retain)
            .with_properties(properties);
        let envelope = Envelope {
            publish,
            token: token.clone(),
        };

        match self.route(qos, true) {
            Disposition::Send(links) => {
                if let Err(envelope) = links.send_publish(envelope).await {
                    self.inner.park(envelope).await;
                }
            }
            Disposition::Park => self.inner.park(envelope).await,
            Disposition::Refuse => {
                token.fail(MqttError::NotConnected);
            }
        }
        token
    }

    /// Subscribes to one filter. A `handler` is routed messages matching
    /// `filter`; without one they go to the default handler.
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Option<MessageHandler>,
    ) -> SubscribeToken {
        self.subscribe_multiple(&[(filter, qos)], handler).await
    }

    /// Subscribes to several filters in one SUBSCRIBE. The handler, if any,
    /// is registered for each filter before the packet is sent.
    #[instrument(skip(self, filters, handler), fields(count = filters.len()))]
    pub async fn subscribe_multiple(
        &self,
        filters: &[(&str, QoS)],
        handler: Option<MessageHandler>,
    ) -> SubscribeToken {
        let token = SubscribeToken::new();
        if filters.is_empty() {
            token.fail(MqttError::InvalidTopicFilter(
                "no topic filters given".to_string(),
            ));
            return token;
        }
        for (filter, _) in filters {
            if let Err(e) = validate_topic_filter(filter) {
                token.fail(e);
                return token;
            }
        }
        if let Some(handler) = &handler {
            for (filter, _) in filters {
                if let Err(e) = self.inner.router.add_route(filter, Arc::clone(handler)) {
                    token.fail(e);
                    return token;
                }
            }
        }

        let options = self.inner.options();
        let parkable = options.resume_subs && !options.clean_session;
        let route = self.route(QoS::AtLeastOnce, parkable);
        if matches!(route, Disposition::Refuse) {
            token.fail(MqttError::NotConnected);
            return token;
        }

        let requested: Vec<(String, QoS)> = filters
            .iter()
            .map(|(filter, qos)| ((*filter).to_string(), *qos))
            .collect();
        let pending = PendingToken::Subscribe {
            token: token.clone(),
            filters: requested.clone(),
        };
        let packet_id = match self.inner.message_ids.acquire(pending) {
            Ok(packet_id) => packet_id,
            Err(e) => {
                token.fail(e);
                return token;
            }
        };
        let mut subscribe = SubscribePacket::new(packet_id);
        for (filter, qos) in requested {
            subscribe.add_filter(filter, qos);
        }
        self.send_control(packet_id, Packet::Subscribe(subscribe), route)
            .await;
        token
    }

    /// Unsubscribes and removes the routes for `filters` straight away.
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, filters: &[&str]) -> UnsubscribeToken {
        let token = UnsubscribeToken::new();
        if filters.is_empty() {
            token.fail(MqttError::InvalidTopicFilter(
                "no topic filters given".to_string(),
            ));
            return token;
        }
        for filter in filters {
            if let Err(e) = validate_topic_filter(filter) {
                token.fail(e);
                return token;
            }
        }

        let options = self.inner.options();
        let parkable = options.resume_subs && !options.clean_session;
        let route = self.route(QoS::AtLeastOnce, parkable);
        if matches!(route, Disposition::Refuse) {
            token.fail(MqttError::NotConnected);
            return token;
        }

        {
            let mut subscriptions = self.inner.subscriptions.lock();
            for filter in filters {
                self.inner.router.delete_route(filter);
                subscriptions.remove(*filter);
            }
        }

        let packet_id = match self
            .inner
            .message_ids
            .acquire(PendingToken::Unsubscribe(token.clone()))
        {
            Ok(packet_id) => packet_id,
            Err(e) => {
                token.fail(e);
                return token;
            }
        };
        let unsubscribe = UnsubscribePacket::new(
            packet_id,
            filters.iter().map(|f| (*f).to_string()).collect(),
        );
        self.send_control(packet_id, Packet::Unsubscribe(unsubscribe), route)
            .await;
        token
    }

    /// Stores a SUBSCRIBE/UNSUBSCRIBE and sends it if connected. A parked
    /// packet goes out when the session resumes.
    async fn send_control(&self, packet_id: u16, packet: Packet, route: Disposition) {
        self.inner.persist(&outbound_key(packet_id), &packet).await;
        match route {
            Disposition::Send(links) => {
                if !links.send_priority(packet).await {
                    tracing::debug!(packet_id, "Session closed before packet was queued");
                }
            }
            Disposition::Park => {
                tracing::debug!(packet_id, "Packet stored for a later session");
            }
            Disposition::Refuse => {}
        }
    }

    /// Routes messages on `filter` to `handler` without subscribing.
    pub fn add_route(&self, filter: &str, handler: MessageHandler) -> Result<()> {
        self.inner.router.add_route(filter, handler)
    }

    /// Returns whether a route existed.
    pub fn remove_route(&self, filter: &str) -> bool {
        self.inner.router.delete_route(filter)
    }

    /// Replaces the handler for messages that match no route.
    pub fn set_default_handler(&self, handler: Option<MessageHandler>) {
        self.inner.router.set_default_handler(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> MqttClient {
        MqttClient::new(
            ClientOptions::new("unit")
                .add_broker("tcp://127.0.0.1:1")
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_publish_when_disconnected() {
        let client = client();
        let token = client.publish("a/b", QoS::AtLeastOnce, false, "x").await;
        assert_eq!(token.error(), Some(MqttError::NotConnected));
    }

    #[tokio::test]
    async fn test_invalid_topic_rejected_before_status_check() {
        let client = client();
        let token = client.publish("a/+", QoS::AtMostOnce, false, "x").await;
        assert!(matches!(token.error(), Some(MqttError::InvalidTopicName(_))));

        let token = client.subscribe("a/#/b", QoS::AtMostOnce, None).await;
        assert!(matches!(token.error(), Some(MqttError::InvalidTopicFilter(_))));

        let token = client.unsubscribe(&[]).await;
        assert!(matches!(token.error(), Some(MqttError::InvalidTopicFilter(_))));
    }

    #[tokio::test]
    async fn test_subscribe_registers_route_even_when_refused() {
        let client = client();
        let handler: MessageHandler = Arc::new(|_| {});
        let token = client
            .subscribe("sensors/+", QoS::AtLeastOnce, Some(handler))
            .await;
        assert_eq!(token.error(), Some(MqttError::NotConnected));
        assert!(client.remove_route("sensors/+"));
    }

    #[tokio::test]
    async fn test_disconnect_when_disconnected() {
        let client = client();
        let token = client.disconnect(Duration::ZERO);
        assert!(token.wait().await);
        assert_eq!(token.error(), Some(MqttError::AlreadyDisconnected));
    }

    #[tokio::test]
    async fn test_connect_twice() {
        let client = client();
        let _first = client.connect();
        let second = client.connect();
        assert!(matches!(second.error(), Some(MqttError::InvalidState(_))));
        client.force_disconnect().wait().await;
    }
}
