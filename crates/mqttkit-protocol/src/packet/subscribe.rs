use crate::encoding::{decode_string, decode_u16, decode_u8, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::properties::{Properties, PropertyContext};
use crate::types::{ProtocolVersion, QoS};
use bytes::{Buf, BufMut};

const SUBSCRIBE: PropertyContext = PropertyContext::Packet(PacketType::Subscribe);

/// Per-filter options byte. Only `qos` exists before MQTT 5; the other
/// fields are written as zero bits for older protocol levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
}

impl SubscriptionOptions {
    #[must_use]
    pub fn new(qos: QoS) -> Self {
        Self {
            qos,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn to_byte(self, version: ProtocolVersion) -> u8 {
        let mut byte = u8::from(self.qos);
        if version.is_v5() {
            if self.no_local {
                byte |= 0x04;
            }
            if self.retain_as_published {
                byte |= 0x08;
            }
            byte |= (self.retain_handling & 0x03) << 4;
        }
        byte
    }

    /// # Errors
    /// Rejects reserved bits and invalid QoS or retain handling values.
    pub fn from_byte(byte: u8, version: ProtocolVersion) -> Result<Self> {
        let reserved = if version.is_v5() { 0xC0 } else { 0xFC };
        if byte & reserved != 0 {
            return Err(MqttError::MalformedPacket(format!(
                "subscription options 0x{byte:02X} use reserved bits"
            )));
        }
        let retain_handling = (byte >> 4) & 0x03;
        if retain_handling == 3 {
            return Err(MqttError::MalformedPacket(
                "retain handling 3 is reserved".to_string(),
            ));
        }
        Ok(Self {
            qos: QoS::try_from(byte & 0x03)?,
            no_local: byte & 0x04 != 0,
            retain_as_published: byte & 0x08 != 0,
            retain_handling,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSubscription {
    pub filter: String,
    pub options: SubscriptionOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<TopicSubscription>,
    pub properties: Properties,
}

impl SubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            filters: Vec::new(),
            properties: Properties::new(),
        }
    }

    pub fn add_filter(&mut self, filter: impl Into<String>, qos: QoS) {
        self.filters.push(TopicSubscription {
            filter: filter.into(),
            options: SubscriptionOptions::new(qos),
        });
    }

    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>, qos: QoS) -> Self {
        self.add_filter(filter, qos);
        self
    }
}

impl MqttPacket for SubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Subscribe
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        if self.filters.is_empty() {
            return Err(MqttError::MalformedPacket(
                "SUBSCRIBE must carry at least one filter".to_string(),
            ));
        }
        buf.put_u16(self.packet_id);
        if version.is_v5() {
            self.properties.encode(buf, SUBSCRIBE)?;
        }
        for subscription in &self.filters {
            encode_string(buf, &subscription.filter)?;
            buf.put_u8(subscription.options.to_byte(version));
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let packet_id = decode_u16(buf, "packet identifier")?;
        let properties = if version.is_v5() {
            Properties::decode(buf, SUBSCRIBE)?
        } else {
            Properties::new()
        };

        let mut filters = Vec::new();
        while buf.has_remaining() {
            let filter = decode_string(buf)?;
            let options =
                SubscriptionOptions::from_byte(decode_u8(buf, "subscription options")?, version)?;
            filters.push(TopicSubscription { filter, options });
        }
        if filters.is_empty() {
            return Err(MqttError::MalformedPacket(
                "SUBSCRIBE must carry at least one filter".to_string(),
            ));
        }

        Ok(Self {
            packet_id,
            filters,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use bytes::{Bytes, BytesMut};

    #[test]
    fn test_subscribe_layout() {
        let packet = SubscribePacket::new(1).with_filter("a", QoS::AtLeastOnce);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V311).unwrap();
        assert_eq!(&buf[..], &[0x82, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x01]);
    }

    #[test]
    fn test_subscribe_requires_filter() {
        let mut buf = BytesMut::new();
        assert!(SubscribePacket::new(1)
            .encode(&mut buf, ProtocolVersion::V311)
            .is_err());
        let mut buf = Bytes::from_static(&[0x82, 0x02, 0x00, 0x01]);
        assert!(Packet::decode(&mut buf, ProtocolVersion::V311).is_err());
    }

    #[test]
    fn test_subscribe_wrong_flags_rejected() {
        let mut buf = Bytes::from_static(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x01]);
        assert!(Packet::decode(&mut buf, ProtocolVersion::V311).is_err());
    }

    #[test]
    fn test_v5_options_round_trip() {
        let mut packet = SubscribePacket::new(2);
        packet.filters.push(TopicSubscription {
            filter: "x/#".into(),
            options: SubscriptionOptions {
                qos: QoS::ExactlyOnce,
                no_local: true,
                retain_as_published: true,
                retain_handling: 2,
            },
        });
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V5).unwrap();
        let decoded = Packet::decode(&mut buf, ProtocolVersion::V5).unwrap();
        assert_eq!(decoded, Packet::Subscribe(packet));
    }

    #[test]
    fn test_v311_reserved_option_bits() {
        assert!(SubscriptionOptions::from_byte(0x04, ProtocolVersion::V311).is_err());
        assert!(SubscriptionOptions::from_byte(0x04, ProtocolVersion::V5).is_ok());
        assert!(SubscriptionOptions::from_byte(0x30, ProtocolVersion::V5).is_err());
    }
}
