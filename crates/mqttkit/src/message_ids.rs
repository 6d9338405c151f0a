//! Packet identifier allocation.
//!
//! An identifier is in use exactly as long as a pending token is registered
//! under it; the terminal ACK of the flow removes both at once.

use crate::token::{PublishToken, SubscribeOutcome, SubscribeToken, UnsubscribeToken};
use mqttkit_protocol::{MqttError, QoS, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

/// What the logic task needs to finish an outbound flow when its ACK arrives.
#[derive(Debug, Clone)]
pub(crate) enum PendingToken {
    Publish(PublishToken),
    Subscribe {
        token: SubscribeToken,
        filters: Vec<(String, QoS)>,
    },
    Unsubscribe(UnsubscribeToken),
}

impl PendingToken {
    pub(crate) fn fail(&self, err: MqttError) {
        match self {
            Self::Publish(token) | Self::Unsubscribe(token) => {
                token.fail(err);
            }
            Self::Subscribe { token, .. } => {
                token.fail(err);
            }
        }
    }

    fn set_packet_id(&self, packet_id: u16) {
        match self {
            Self::Publish(token) | Self::Unsubscribe(token) => token.set_packet_id(packet_id),
            Self::Subscribe { token, .. } => token.set_packet_id(packet_id),
        }
    }

    /// Completes the flow successfully. SUBACK codes are paired with the
    /// filters in request order.
    pub(crate) fn succeed(self, suback_codes: &[u8]) {
        match self {
            Self::Publish(token) | Self::Unsubscribe(token) => {
                token.complete(Ok(()));
            }
            Self::Subscribe { token, filters } => {
                let granted = filters
                    .into_iter()
                    .zip(suback_codes.iter().copied())
                    .map(|((filter, _), code)| (filter, code))
                    .collect();
                token.complete(Ok(SubscribeOutcome { granted }));
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MessageIds {
    index: Mutex<HashMap<u16, PendingToken>>,
}

impl MessageIds {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `token` under the lowest free identifier.
    pub(crate) fn acquire(&self, token: PendingToken) -> Result<u16> {
        let mut index = self.index.lock();
        let packet_id = (1..u16::MAX)
            .find(|id| !index.contains_key(id))
            .ok_or(MqttError::PacketIdExhausted)?;
        token.set_packet_id(packet_id);
        index.insert(packet_id, token);
        Ok(packet_id)
    }

    /// Registers `token` under a caller-chosen identifier. A different flow
    /// already holding the identifier is failed.
    pub(crate) fn claim(&self, packet_id: u16, token: PendingToken) {
        token.set_packet_id(packet_id);
        if let Some(previous) = self.index.lock().insert(packet_id, token) {
            tracing::warn!(packet_id, "Packet identifier reused while still pending");
            previous.fail(MqttError::InvalidState(format!(
                "packet identifier {packet_id} was reassigned"
            )));
        }
    }

    pub(crate) fn get(&self, packet_id: u16) -> Option<PendingToken> {
        self.index.lock().get(&packet_id).cloned()
    }

    pub(crate) fn take(&self, packet_id: u16) -> Option<PendingToken> {
        self.index.lock().remove(&packet_id)
    }

    pub fn release(&self, packet_id: u16) {
        self.index.lock().remove(&packet_id);
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.index.lock().contains_key(&packet_id)
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }

    /// Frees every identifier and fails the pending tokens with `err`.
    pub fn fail_all(&self, err: &MqttError) {
        let drained: Vec<PendingToken> = self.index.lock().drain().map(|(_, t)| t).collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), error = %err, "Failing pending tokens");
        }
        for token in drained {
            token.fail(err.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish_token() -> (PublishToken, PendingToken) {
        let token = PublishToken::new();
        (token.clone(), PendingToken::Publish(token))
    }

    #[test]
    fn test_acquire_lowest_free() {
        let ids = MessageIds::new();
        let (first, pending) = publish_token();
        assert_eq!(ids.acquire(pending).unwrap(), 1);
        assert_eq!(first.packet_id(), 1);
        assert_eq!(ids.acquire(publish_token().1).unwrap(), 2);
        assert_eq!(ids.acquire(publish_token().1).unwrap(), 3);

        ids.release(2);
        assert_eq!(ids.acquire(publish_token().1).unwrap(), 2);
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_exhaustion() {
        let ids = MessageIds::new();
        for expected in 1..u16::MAX {
            assert_eq!(ids.acquire(publish_token().1).unwrap(), expected);
        }
        assert_eq!(
            ids.acquire(publish_token().1),
            Err(MqttError::PacketIdExhausted)
        );
        ids.release(500);
        assert_eq!(ids.acquire(publish_token().1).unwrap(), 500);
    }

    #[test]
    fn test_claim_fails_previous_holder() {
        let ids = MessageIds::new();
        let (old, pending) = publish_token();
        ids.claim(7, pending);
        let (new, pending) = publish_token();
        ids.claim(7, pending);

        assert!(matches!(old.error(), Some(MqttError::InvalidState(_))));
        assert!(!new.is_complete());
        assert_eq!(new.packet_id(), 7);
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_take_and_succeed_subscribe() {
        let ids = MessageIds::new();
        let token = SubscribeToken::new();
        let id = ids
            .acquire(PendingToken::Subscribe {
                token: token.clone(),
                filters: vec![
                    ("a/+".to_string(), QoS::AtLeastOnce),
                    ("b".to_string(), QoS::ExactlyOnce),
                ],
            })
            .unwrap();

        ids.take(id).unwrap().succeed(&[1, 0x80]);
        assert!(!ids.contains(id));
        let granted = token.granted_qos();
        assert_eq!(granted.get("a/+"), Some(&1));
        assert_eq!(granted.get("b"), Some(&0x80));
    }

    #[test]
    fn test_fail_all() {
        let ids = MessageIds::new();
        let (a, pending_a) = publish_token();
        let (b, pending_b) = publish_token();
        ids.acquire(pending_a).unwrap();
        ids.acquire(pending_b).unwrap();

        ids.fail_all(&MqttError::NotConnected);
        assert!(ids.is_empty());
        assert_eq!(a.error(), Some(MqttError::NotConnected));
        assert_eq!(b.error(), Some(MqttError::NotConnected));
    }
}
