use crate::error::Result;
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::properties::{Properties, PropertyContext};
use crate::types::ProtocolVersion;
use bytes::{Buf, BufMut};

const AUTH: PropertyContext = PropertyContext::Packet(PacketType::Auth);

/// MQTT 5 enhanced authentication exchange. Only framed; the client does
/// not drive an authentication method.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthPacket {
    pub reason_code: u8,
    pub properties: Properties,
}

impl MqttPacket for AuthPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Auth
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, _version: ProtocolVersion) -> Result<()> {
        let has_properties = !self.properties.filtered(AUTH).is_empty();
        if self.reason_code != 0 || has_properties {
            buf.put_u8(self.reason_code);
            self.properties.encode(buf, AUTH)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _header: &FixedHeader,
        _version: ProtocolVersion,
    ) -> Result<Self> {
        let mut packet = Self::default();
        if buf.has_remaining() {
            packet.reason_code = buf.get_u8();
        }
        if buf.has_remaining() {
            packet.properties = Properties::decode(buf, AUTH)?;
        }
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use crate::properties::{PropertyId, PropertyValue};
    use bytes::BytesMut;

    #[test]
    fn test_auth_flags_are_zero() {
        let mut buf = BytesMut::new();
        AuthPacket::default()
            .encode(&mut buf, ProtocolVersion::V5)
            .unwrap();
        assert_eq!(&buf[..], &[0xF0, 0x00]);
    }

    #[test]
    fn test_auth_round_trip() {
        let mut packet = AuthPacket {
            reason_code: 0x18,
            properties: Properties::new(),
        };
        packet
            .properties
            .add(
                PropertyId::AuthenticationMethod,
                PropertyValue::Utf8String("SCRAM-SHA-1".into()),
            )
            .unwrap();
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V5).unwrap();
        assert_eq!(
            Packet::decode(&mut buf, ProtocolVersion::V5).unwrap(),
            Packet::Auth(packet)
        );
    }
}
