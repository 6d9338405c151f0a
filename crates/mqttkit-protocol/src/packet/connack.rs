use crate::encoding::decode_u8;
use crate::error::Result;
use crate::flags::ConnAckFlags;
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::properties::{Properties, PropertyContext};
use crate::types::{ConnectReturnCode, ProtocolVersion};
use bytes::{Buf, BufMut};

const CONNACK: PropertyContext = PropertyContext::Packet(PacketType::ConnAck);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
    pub properties: Properties,
}

impl ConnAckPacket {
    #[must_use]
    pub fn new(session_present: bool, return_code: ConnectReturnCode) -> Self {
        Self {
            session_present,
            return_code,
            properties: Properties::new(),
        }
    }
}

impl MqttPacket for ConnAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::ConnAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        let flags = ConnAckFlags {
            session_present: self.session_present,
        };
        buf.put_u8(flags.to_byte());
        buf.put_u8(self.return_code.to_u8(version));
        if version.is_v5() {
            self.properties.encode(buf, CONNACK)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let flags = ConnAckFlags::from_byte(decode_u8(buf, "CONNACK flags")?)?;
        let return_code = ConnectReturnCode::from_u8(decode_u8(buf, "return code")?, version);
        let properties = if version.is_v5() && buf.has_remaining() {
            Properties::decode(buf, CONNACK)?
        } else {
            Properties::new()
        };
        Ok(Self {
            session_present: flags.session_present,
            return_code,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use crate::properties::{PropertyId, PropertyValue};
    use bytes::{Bytes, BytesMut};

    #[test]
    fn test_connack_v311() {
        let mut buf = Bytes::from_static(&[0x20, 0x02, 0x01, 0x05]);
        let packet = Packet::decode(&mut buf, ProtocolVersion::V311).unwrap();
        assert_eq!(
            packet,
            Packet::ConnAck(ConnAckPacket::new(true, ConnectReturnCode::NotAuthorized))
        );
    }

    #[test]
    fn test_connack_v5_reason_codes() {
        let mut buf = Bytes::from_static(&[0x20, 0x03, 0x00, 0x86, 0x00]);
        let Packet::ConnAck(connack) = Packet::decode(&mut buf, ProtocolVersion::V5).unwrap()
        else {
            panic!("expected CONNACK");
        };
        assert_eq!(connack.return_code, ConnectReturnCode::BadUsernameOrPassword);
    }

    #[test]
    fn test_connack_v5_properties() {
        let mut packet = ConnAckPacket::new(false, ConnectReturnCode::Accepted);
        packet
            .properties
            .add(PropertyId::ServerKeepAlive, PropertyValue::TwoByteInteger(20))
            .unwrap();
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V5).unwrap();
        let decoded = Packet::decode(&mut buf, ProtocolVersion::V5).unwrap();
        assert_eq!(decoded, Packet::ConnAck(packet));
    }
}
