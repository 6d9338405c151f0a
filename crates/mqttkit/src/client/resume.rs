//! Replays stored in-flight state on a new session.
//!
//! Runs as a session task right after CONNACK. Outbound entries are
//! re-sent in the order they were issued, which is recovered from the
//! packet identifiers; inbound QoS 2 flows that already saw PUBREL get
//! their PUBCOMP again.

use super::inner::ClientInner;
use super::session::{Envelope, Links};
use crate::message_ids::PendingToken;
use crate::store::{inbound_key, outbound_key, parse_key, Direction};
use crate::token::{PublishToken, SubscribeToken, UnsubscribeToken};
use mqttkit_protocol::packet::{PubCompPacket, SubscribePacket};
use mqttkit_protocol::{MqttError, Packet};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ResumePolicy {
    pub(crate) clean_session: bool,
    pub(crate) resume_subs: bool,
    pub(crate) max_publish_in_flight: usize,
}

impl ResumePolicy {
    fn resend_subscriptions(self) -> bool {
        self.resume_subs && !self.clean_session
    }
}

/// Orders outbound identifiers by issue time. Identifiers are handed out
/// lowest-free-first and wrap around, so the oldest entry is the one just
/// after the widest gap, counting the gap across the wrap.
pub(crate) fn replay_order(mut ids: Vec<u16>) -> Vec<u16> {
    ids.sort_unstable();
    ids.dedup();
    let (Some(&first), Some(&last)) = (ids.first(), ids.last()) else {
        return ids;
    };

    let mut start = 0;
    let mut widest = u32::from(first) + u32::from(u16::MAX) - u32::from(last);
    for (index, pair) in ids.windows(2).enumerate() {
        let gap = u32::from(pair[1] - pair[0]);
        if gap > widest {
            widest = gap;
            start = index + 1;
        }
    }
    ids.rotate_left(start);
    ids
}

pub(crate) async fn resume(inner: Arc<ClientInner>, links: Links, policy: ResumePolicy) {
    let keys = match inner.store.all().await {
        Ok(keys) => keys,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot list stored packets, skipping resume");
            return;
        }
    };

    let mut inbound = Vec::new();
    let mut outbound = Vec::new();
    for key in keys {
        match parse_key(&key) {
            Some((Direction::Inbound, id)) => inbound.push(id),
            Some((Direction::Outbound, id)) => outbound.push(id),
            None => {
                tracing::warn!(key = %key, "Discarding unrecognised store entry");
                inner.forget(&key).await;
            }
        }
    }
    tracing::debug!(
        inbound = inbound.len(),
        outbound = outbound.len(),
        "Resuming stored flows"
    );

    for packet_id in inbound {
        if links.cancel.is_cancelled() {
            return;
        }
        resume_inbound(&inner, &links, policy, packet_id).await;
    }

    let limiter = (policy.max_publish_in_flight > 0)
        .then(|| Arc::new(Semaphore::new(policy.max_publish_in_flight)));
    for packet_id in replay_order(outbound) {
        if links.cancel.is_cancelled() {
            return;
        }
        resume_outbound(&inner, &links, policy, limiter.as_ref(), packet_id).await;
    }
}

async fn load(inner: &ClientInner, key: &str) -> Option<Packet> {
    match inner.store.get(key).await {
        Ok(packet) => packet,
        Err(e) => {
            tracing::warn!(key, error = %e, "Discarding unreadable store entry");
            inner.forget(key).await;
            None
        }
    }
}

async fn resume_inbound(inner: &ClientInner, links: &Links, policy: ResumePolicy, packet_id: u16) {
    let key = inbound_key(packet_id);
    if policy.clean_session {
        inner.forget(&key).await;
        return;
    }
    match load(inner, &key).await {
        // The broker already has our PUBREC; answering its PUBREL with
        // PUBCOMP is all that is left of this receive flow. The entry is
        // deleted once the PUBCOMP is written.
        Some(Packet::PubRel(_)) => {
            links
                .send_priority(Packet::PubComp(PubCompPacket::new(packet_id)))
                .await;
        }
        Some(Packet::Publish(_)) | None => {}
        Some(other) => {
            tracing::warn!(key = %key, packet_type = ?other.packet_type(), "Unexpected inbound entry");
            inner.forget(&key).await;
        }
    }
}

/// The token already waiting on `packet_id`, or a fresh one registered
/// under it.
fn publish_token(inner: &ClientInner, packet_id: u16) -> PublishToken {
    if let Some(PendingToken::Publish(token)) = inner.message_ids.get(packet_id) {
        return token;
    }
    let token = PublishToken::new();
    inner
        .message_ids
        .claim(packet_id, PendingToken::Publish(token.clone()));
    token
}

async fn resume_outbound(
    inner: &ClientInner,
    links: &Links,
    policy: ResumePolicy,
    limiter: Option<&Arc<Semaphore>>,
    packet_id: u16,
) {
    let key = outbound_key(packet_id);
    let Some(packet) = load(inner, &key).await else {
        return;
    };

    match packet {
        Packet::Publish(mut publish) => {
            let token = publish_token(inner, packet_id);
            publish.packet_id = Some(packet_id);
            publish.dup = true;

            if let Some(limiter) = limiter {
                let permit = tokio::select! {
                    biased;
                    () = links.cancel.cancelled() => return,
                    permit = Arc::clone(limiter).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };
                let waiter = token.clone();
                tokio::spawn(async move {
                    waiter.wait().await;
                    drop(permit);
                });
            }

            tracing::debug!(packet_id, topic = %publish.topic_name, "Resending stored publish");
            if let Err(envelope) = links.send_publish(Envelope { publish, token }).await {
                inner.park(envelope).await;
            }
        }
        Packet::PubRel(pubrel) => {
            publish_token(inner, packet_id);
            tracing::debug!(packet_id, "Resending stored PUBREL");
            links.send_priority(Packet::PubRel(pubrel)).await;
        }
        Packet::Subscribe(subscribe) if policy.resend_subscriptions() => {
            if inner.message_ids.get(packet_id).is_none() {
                let filters = subscribe
                    .filters
                    .iter()
                    .map(|f| (f.filter.clone(), f.options.qos))
                    .collect();
                inner.message_ids.claim(
                    packet_id,
                    PendingToken::Subscribe {
                        token: SubscribeToken::new(),
                        filters,
                    },
                );
            }
            links.send_priority(Packet::Subscribe(subscribe)).await;
        }
        Packet::Unsubscribe(unsubscribe) if policy.resend_subscriptions() => {
            if inner.message_ids.get(packet_id).is_none() {
                inner.message_ids.claim(
                    packet_id,
                    PendingToken::Unsubscribe(UnsubscribeToken::new()),
                );
            }
            links.send_priority(Packet::Unsubscribe(unsubscribe)).await;
        }
        Packet::Subscribe(_) | Packet::Unsubscribe(_) => {
            inner.forget(&key).await;
            if let Some(pending) = inner.message_ids.take(packet_id) {
                pending.fail(MqttError::NotConnected);
            }
        }
        other => {
            tracing::warn!(key = %key, packet_type = ?other.packet_type(), "Unexpected outbound entry");
            inner.forget(&key).await;
        }
    }
}

/// Re-sends every granted subscription in one SUBSCRIBE.
pub(crate) async fn resubscribe(inner: Arc<ClientInner>, links: Links) {
    let filters: Vec<_> = inner
        .subscriptions
        .lock()
        .iter()
        .map(|(filter, qos)| (filter.clone(), *qos))
        .collect();
    if filters.is_empty() {
        return;
    }

    let pending = PendingToken::Subscribe {
        token: SubscribeToken::new(),
        filters: filters.clone(),
    };
    let packet_id = match inner.message_ids.acquire(pending) {
        Ok(packet_id) => packet_id,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot resubscribe");
            return;
        }
    };
    let mut subscribe = SubscribePacket::new(packet_id);
    for (filter, qos) in filters {
        subscribe.add_filter(filter, qos);
    }
    tracing::info!(count = subscribe.filters.len(), "Restoring subscriptions");
    let packet = Packet::Subscribe(subscribe);
    inner.persist(&outbound_key(packet_id), &packet).await;
    links.send_priority(packet).await;
}
