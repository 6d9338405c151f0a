//! Inbound packet handling: the QoS 1 and 2 state machines for both
//! directions, SUBACK/UNSUBACK completion and PINGRESP.
//!
//! Store writes happen before the matching ACK is queued, so a crash
//! between the two leaves enough state to finish the flow on reconnect.

use super::{ErrorSink, KeepaliveState};
use crate::client::inner::ClientInner;
use crate::message_ids::PendingToken;
use crate::router::Message;
use crate::store::{inbound_key, outbound_key};
use mqttkit_protocol::packet::{
    PubAckPacket, PubCompPacket, PubRecPacket, PubRelPacket, PublishPacket, SubAckPacket,
};
use mqttkit_protocol::{MqttError, Packet, QoS, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(super) struct Logic {
    pub(super) inner: Arc<ClientInner>,
    pub(super) priority: mpsc::Sender<Packet>,
    pub(super) keepalive: Arc<Mutex<KeepaliveState>>,
    pub(super) order_matters: bool,
    pub(super) cancel: CancellationToken,
}

pub(super) async fn logic_task(
    logic: Logic,
    mut inbound: mpsc::Receiver<Packet>,
    errors: ErrorSink,
) {
    loop {
        let packet = tokio::select! {
            biased;
            () = logic.cancel.cancelled() => break,
            packet = inbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        if let Err(e) = logic.handle(packet).await {
            if !logic.cancel.is_cancelled() {
                errors.report(e);
            }
            break;
        }
    }
    tracing::debug!("Logic task stopped");
}

impl Logic {
    pub(super) async fn handle(&self, packet: Packet) -> Result<()> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(publish).await,
            Packet::PubAck(puback) => {
                let outcome = if puback.is_error() {
                    Err(MqttError::PublishFailed(puback.reason_code))
                } else {
                    Ok(())
                };
                self.finish_outbound(puback.packet_id, outcome).await;
                Ok(())
            }
            Packet::PubRec(pubrec) => self.handle_pubrec(&pubrec).await,
            Packet::PubRel(pubrel) => self.handle_pubrel(&pubrel).await,
            Packet::PubComp(pubcomp) => {
                let outcome = if pubcomp.is_error() {
                    Err(MqttError::PublishFailed(pubcomp.reason_code))
                } else {
                    Ok(())
                };
                self.finish_outbound(pubcomp.packet_id, outcome).await;
                Ok(())
            }
            Packet::SubAck(suback) => {
                self.handle_suback(&suback).await;
                Ok(())
            }
            Packet::UnsubAck(unsuback) => {
                self.finish_outbound(unsuback.packet_id, Ok(())).await;
                Ok(())
            }
            Packet::PingResp => {
                tracing::trace!("PINGRESP received");
                self.keepalive.lock().record_pong_received();
                Ok(())
            }
            Packet::Disconnect(disconnect) => {
                tracing::info!(reason_code = disconnect.reason_code, "Server sent DISCONNECT");
                Err(MqttError::ServerDisconnected(disconnect.reason_code))
            }
            Packet::Auth(auth) => {
                tracing::debug!(reason_code = auth.reason_code, "Ignoring AUTH packet");
                Ok(())
            }
            other => Err(MqttError::UnexpectedPacket(format!(
                "{:?} is not valid from a server",
                other.packet_type()
            ))),
        }
    }

    async fn acknowledge(&self, packet: Packet) -> Result<()> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(MqttError::NotConnected),
            sent = self.priority.send(packet) => sent.map_err(|_| MqttError::NotConnected),
        }
    }

    fn dispatch(&self, publish: PublishPacket) {
        self.inner
            .router
            .dispatch(Message::from(publish), self.order_matters);
    }

    async fn handle_publish(&self, publish: PublishPacket) -> Result<()> {
        if publish.qos == QoS::AtMostOnce {
            self.dispatch(publish);
            return Ok(());
        }
        let Some(packet_id) = publish.packet_id else {
            return Err(MqttError::MalformedPacket(
                "QoS > 0 PUBLISH without packet identifier".to_string(),
            ));
        };

        if publish.qos == QoS::AtLeastOnce {
            self.dispatch(publish);
            return self
                .acknowledge(Packet::PubAck(PubAckPacket::new(packet_id)))
                .await;
        }

        let key = inbound_key(packet_id);
        let seen = match self.inner.store.get(&key).await {
            Ok(entry) => entry.is_some(),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to look up inbound flow");
                false
            }
        };
        if seen {
            tracing::debug!(packet_id, "Duplicate QoS 2 publish, not delivering again");
        } else {
            self.inner
                .persist(&key, &Packet::Publish(publish.clone()))
                .await;
            self.dispatch(publish);
        }
        self.acknowledge(Packet::PubRec(PubRecPacket::new(packet_id)))
            .await
    }

    async fn handle_pubrec(&self, pubrec: &PubRecPacket) -> Result<()> {
        let packet_id = pubrec.packet_id;
        if pubrec.is_error() {
            tracing::debug!(packet_id, reason_code = pubrec.reason_code, "Publish refused");
            self.finish_outbound(packet_id, Err(MqttError::PublishFailed(pubrec.reason_code)))
                .await;
            return Ok(());
        }
        let pubrel = Packet::PubRel(PubRelPacket::new(packet_id));
        self.inner.persist(&outbound_key(packet_id), &pubrel).await;
        self.acknowledge(pubrel).await
    }

    async fn handle_pubrel(&self, pubrel: &PubRelPacket) -> Result<()> {
        let packet_id = pubrel.packet_id;
        self.inner
            .persist(&inbound_key(packet_id), &Packet::PubRel(PubRelPacket::new(packet_id)))
            .await;
        self.acknowledge(Packet::PubComp(PubCompPacket::new(packet_id)))
            .await
    }

    async fn handle_suback(&self, suback: &SubAckPacket) {
        self.inner.forget(&outbound_key(suback.packet_id)).await;
        let Some(pending) = self.inner.message_ids.take(suback.packet_id) else {
            tracing::debug!(packet_id = suback.packet_id, "SUBACK for unknown packet id");
            return;
        };
        let PendingToken::Subscribe { filters, .. } = &pending else {
            tracing::warn!(packet_id = suback.packet_id, "SUBACK for a non-subscribe flow");
            pending.fail(MqttError::UnexpectedPacket("SUBACK".to_string()));
            return;
        };

        {
            let mut subscriptions = self.inner.subscriptions.lock();
            for (index, (filter, _)) in filters.iter().enumerate() {
                if let Some(qos) = suback.granted_qos(index) {
                    subscriptions.insert(filter.clone(), qos);
                }
            }
        }
        pending.succeed(&suback.return_codes);
    }

    /// Ends an outbound flow: the store entry goes first, then the
    /// identifier is freed and the token completed.
    async fn finish_outbound(&self, packet_id: u16, outcome: Result<()>) {
        self.inner.forget(&outbound_key(packet_id)).await;
        let Some(pending) = self.inner.message_ids.take(packet_id) else {
            tracing::debug!(packet_id, "ACK for unknown packet id");
            return;
        };
        match outcome {
            Ok(()) => pending.succeed(&[]),
            Err(e) => pending.fail(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ClientOptions;
    use crate::store::Store;
    use crate::token::{PublishToken, SubscribeToken};
    use bytes::Bytes;
    use mqttkit_protocol::packet::SubscribePacket;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        logic: Logic,
        acks: mpsc::Receiver<Packet>,
        delivered: Arc<AtomicUsize>,
    }

    async fn harness() -> Harness {
        let inner = ClientInner::new(ClientOptions::new("logic-test"));
        inner.store.open().await.unwrap();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        inner.router.set_default_handler(Some(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        let (priority, acks) = mpsc::channel(8);
        Harness {
            logic: Logic {
                inner,
                priority,
                keepalive: Arc::new(Mutex::new(KeepaliveState::default())),
                order_matters: true,
                cancel: CancellationToken::new(),
            },
            acks,
            delivered,
        }
    }

    fn qos2_publish(packet_id: u16) -> Packet {
        Packet::Publish(
            PublishPacket::new("a/b", Bytes::from_static(b"x"), QoS::ExactlyOnce)
                .with_packet_id(packet_id),
        )
    }

    #[tokio::test]
    async fn test_inbound_qos2_delivered_once() {
        let mut h = harness().await;
        h.logic.handle(qos2_publish(7)).await.unwrap();
        assert_eq!(h.acks.recv().await, Some(Packet::PubRec(PubRecPacket::new(7))));
        assert!(h.logic.inner.store.get("i.7").await.unwrap().is_some());

        h.logic.handle(qos2_publish(7)).await.unwrap();
        assert_eq!(h.acks.recv().await, Some(Packet::PubRec(PubRecPacket::new(7))));
        assert_eq!(h.delivered.load(Ordering::SeqCst), 1);

        h.logic
            .handle(Packet::PubRel(PubRelPacket::new(7)))
            .await
            .unwrap();
        assert_eq!(h.acks.recv().await, Some(Packet::PubComp(PubCompPacket::new(7))));
        assert_eq!(
            h.logic.inner.store.get("i.7").await.unwrap(),
            Some(Packet::PubRel(PubRelPacket::new(7)))
        );
    }

    #[tokio::test]
    async fn test_inbound_qos1_acked_after_delivery() {
        let mut h = harness().await;
        let publish = PublishPacket::new("a/b", Bytes::from_static(b"x"), QoS::AtLeastOnce)
            .with_packet_id(3);
        h.logic.handle(Packet::Publish(publish)).await.unwrap();
        assert_eq!(h.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(h.acks.recv().await, Some(Packet::PubAck(PubAckPacket::new(3))));
    }

    #[tokio::test]
    async fn test_outbound_qos2_flow() {
        let mut h = harness().await;
        let token = PublishToken::new();
        let id = h
            .logic
            .inner
            .message_ids
            .acquire(PendingToken::Publish(token.clone()))
            .unwrap();
        h.logic
            .inner
            .persist(&outbound_key(id), &qos2_publish(id))
            .await;

        h.logic
            .handle(Packet::PubRec(PubRecPacket::new(id)))
            .await
            .unwrap();
        assert_eq!(h.acks.recv().await, Some(Packet::PubRel(PubRelPacket::new(id))));
        assert_eq!(
            h.logic.inner.store.get(&outbound_key(id)).await.unwrap(),
            Some(Packet::PubRel(PubRelPacket::new(id)))
        );
        assert!(!token.is_complete());

        h.logic
            .handle(Packet::PubComp(PubCompPacket::new(id)))
            .await
            .unwrap();
        assert!(token.is_complete());
        assert!(token.error().is_none());
        assert!(h.logic.inner.store.all().await.unwrap().is_empty());
        assert!(h.logic.inner.message_ids.is_empty());
    }

    #[tokio::test]
    async fn test_refused_publish_fails_token() {
        let h = harness().await;
        let token = PublishToken::new();
        let id = h
            .logic
            .inner
            .message_ids
            .acquire(PendingToken::Publish(token.clone()))
            .unwrap();
        h.logic
            .handle(Packet::PubAck(PubAckPacket::new_with_reason(id, 0x87)))
            .await
            .unwrap();
        assert_eq!(token.error(), Some(MqttError::PublishFailed(0x87)));
        assert!(!h.logic.inner.message_ids.contains(id));
    }

    #[tokio::test]
    async fn test_suback_records_granted_subscriptions() {
        let h = harness().await;
        let token = SubscribeToken::new();
        let filters = vec![
            ("a/#".to_string(), QoS::ExactlyOnce),
            ("b/+".to_string(), QoS::AtLeastOnce),
        ];
        let id = h
            .logic
            .inner
            .message_ids
            .acquire(PendingToken::Subscribe {
                token: token.clone(),
                filters,
            })
            .unwrap();
        h.logic.inner.persist(
            &outbound_key(id),
            &Packet::Subscribe(SubscribePacket::new(id).with_filter("a/#", QoS::ExactlyOnce)),
        )
        .await;

        h.logic
            .handle(Packet::SubAck(SubAckPacket::new(id, vec![0x01, 0x80])))
            .await
            .unwrap();

        let granted = token.granted_qos();
        assert_eq!(granted.get("a/#"), Some(&0x01));
        assert_eq!(granted.get("b/+"), Some(&0x80));
        let subscriptions = h.logic.inner.subscriptions.lock().clone();
        assert_eq!(subscriptions.get("a/#"), Some(&QoS::AtLeastOnce));
        assert!(!subscriptions.contains_key("b/+"));
        assert!(h.logic.inner.store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_disconnect_is_an_error() {
        let h = harness().await;
        let result = h
            .logic
            .handle(Packet::Disconnect(
                mqttkit_protocol::packet::DisconnectPacket::with_reason(0x8B),
            ))
            .await;
        assert_eq!(result, Err(MqttError::ServerDisconnected(0x8B)));
    }

    #[tokio::test]
    async fn test_unexpected_packet() {
        let h = harness().await;
        assert!(matches!(
            h.logic.handle(Packet::PingReq).await,
            Err(MqttError::UnexpectedPacket(_))
        ));
    }
}
