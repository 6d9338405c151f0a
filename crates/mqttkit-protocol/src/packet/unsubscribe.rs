use crate::encoding::{decode_string, decode_u16, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::properties::{Properties, PropertyContext};
use crate::types::ProtocolVersion;
use bytes::{Buf, BufMut};

const UNSUBSCRIBE: PropertyContext = PropertyContext::Packet(PacketType::Unsubscribe);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<String>,
    pub properties: Properties,
}

impl UnsubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16, filters: Vec<String>) -> Self {
        Self {
            packet_id,
            filters,
            properties: Properties::new(),
        }
    }
}

impl MqttPacket for UnsubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Unsubscribe
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        if self.filters.is_empty() {
            return Err(MqttError::MalformedPacket(
                "UNSUBSCRIBE must carry at least one filter".to_string(),
            ));
        }
        buf.put_u16(self.packet_id);
        if version.is_v5() {
            self.properties.encode(buf, UNSUBSCRIBE)?;
        }
        for filter in &self.filters {
            encode_string(buf, filter)?;
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
            Properties::decode(buf, UNSUBSCRIBE)?
        } else {
            Properties::new()
        };
        let mut filters = Vec::new();
        while buf.has_remaining() {
            filters.push(decode_string(buf)?);
        }
        if filters.is_empty() {
            return Err(MqttError::MalformedPacket(
                "UNSUBSCRIBE must carry at least one filter".to_string(),
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
    use bytes::BytesMut;

    #[test]
    fn test_unsubscribe_layout() {
        let packet = UnsubscribePacket::new(3, vec!["a".into(), "b/c".into()]);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V311).unwrap();
        assert_eq!(
            &buf[..],
            &[0xA2, 0x0A, 0x00, 0x03, 0x00, 0x01, b'a', 0x00, 0x03, b'b', b'/', b'c']
        );
    }
}
