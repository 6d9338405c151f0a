use crate::encoding::decode_u16;
use crate::error::Result;
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::properties::{Properties, PropertyContext};
use crate::types::ProtocolVersion;
use bytes::{Buf, BufMut};

const UNSUBACK: PropertyContext = PropertyContext::Packet(PacketType::UnsubAck);

/// Before MQTT 5 an UNSUBACK is just the packet identifier; reason codes and
/// properties only exist at level 5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAckPacket {
    pub packet_id: u16,
    pub reason_codes: Vec<u8>,
    pub properties: Properties,
}

impl UnsubAckPacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_codes: Vec::new(),
            properties: Properties::new(),
        }
    }
}

impl MqttPacket for UnsubAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::UnsubAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        buf.put_u16(self.packet_id);
        if version.is_v5() {
            self.properties.encode(buf, UNSUBACK)?;
            buf.put_slice(&self.reason_codes);
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let packet_id = decode_u16(buf, "packet identifier")?;
        let mut packet = Self::new(packet_id);
        if version.is_v5() {
            packet.properties = Properties::decode(buf, UNSUBACK)?;
            packet.reason_codes = buf.copy_to_bytes(buf.remaining()).to_vec();
        }
        Ok(packet)
    }
}
