use super::session::{Envelope, Links, Session};
use crate::backoff::Backoff;
use crate::message_ids::{MessageIds, PendingToken};
use crate::options::ClientOptions;
use crate::router::Router;
use crate::status::ConnectionStatus;
use crate::store::{outbound_key, Store};
use crate::token::PublishToken;
use mqttkit_protocol::packet::PublishPacket;
use mqttkit_protocol::{MqttError, Packet, QoS};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

/// State shared by the client handle, the connect/reconnect orchestration
/// and the session tasks.
pub(crate) struct ClientInner {
    pub(crate) options: RwLock<ClientOptions>,
    pub(crate) status: Arc<ConnectionStatus>,
    pub(crate) message_ids: MessageIds,
    pub(crate) router: Router,
    pub(crate) backoff: Backoff,
    pub(crate) store: Arc<dyn Store>,
    /// Filters the broker has granted, re-sent after a reconnect that did
    /// not resume the session.
    pub(crate) subscriptions: Mutex<BTreeMap<String, QoS>>,
    pub(crate) session: Mutex<Option<Session>>,
}

impl std::fmt::Debug for ClientInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInner")
            .field("status", &self.status.status())
            .field("pending", &self.message_ids.len())
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl ClientInner {
    pub(crate) fn new(options: ClientOptions) -> Arc<Self> {
        let router = Router::new();
        router.set_default_handler(options.default_publish_handler.clone());
        Arc::new(Self {
            store: Arc::clone(&options.store),
            options: RwLock::new(options),
            status: ConnectionStatus::new(),
            message_ids: MessageIds::new(),
            router,
            backoff: Backoff::new(),
            subscriptions: Mutex::new(BTreeMap::new()),
            session: Mutex::new(None),
        })
    }

    pub(crate) fn options(&self) -> ClientOptions {
        self.options.read().clone()
    }

    pub(crate) fn links(&self) -> Option<Links> {
        self.session.lock().as_ref().map(|s| s.links.clone())
    }

    pub(crate) fn take_session(&self) -> Option<Session> {
        self.session.lock().take()
    }

    /// Store failures are logged rather than failing the flow; the packet
    /// still goes out, it just would not survive a restart.
    pub(crate) async fn persist(&self, key: &str, packet: &Packet) {
        if let Err(e) = self.store.put(key, packet).await {
            tracing::warn!(key, error = %e, "Failed to persist packet");
        }
    }

    pub(crate) async fn forget(&self, key: &str) {
        if let Err(e) = self.store.del(key).await {
            tracing::warn!(key, error = %e, "Failed to delete stored packet");
        }
    }

    /// Gives a QoS 1/2 publish its packet identifier (unless resume already
    /// did) and writes it to the store. Returns `None` after failing the
    /// token if no identifier is free.
    pub(crate) async fn register_publish(
        &self,
        publish: &mut PublishPacket,
        token: &PublishToken,
    ) -> Option<u16> {
        let packet_id = if let Some(packet_id) = publish.packet_id {
            packet_id
        } else {
            match self
                .message_ids
                .acquire(PendingToken::Publish(token.clone()))
            {
                Ok(packet_id) => packet_id,
                Err(e) => {
                    tracing::warn!(topic = %publish.topic_name, error = %e, "No packet identifier for publish");
                    token.fail(e);
                    return None;
                }
            }
        };
        publish.packet_id = Some(packet_id);
        self.persist(&outbound_key(packet_id), &Packet::Publish(publish.clone()))
            .await;
        Some(packet_id)
    }

    /// Holds a publish that cannot be written now. QoS 1/2 messages go to
    /// the store and their token stays pending until a later session sends
    /// them; QoS 0 messages are failed.
    pub(crate) async fn park(&self, envelope: Envelope) {
        let Envelope { mut publish, token } = envelope;
        if publish.qos == QoS::AtMostOnce {
            token.fail(MqttError::NotConnected);
            return;
        }
        if let Some(packet_id) = self.register_publish(&mut publish, &token).await {
            tracing::debug!(packet_id, topic = %publish.topic_name, "Publish stored for a later session");
        }
    }
}
