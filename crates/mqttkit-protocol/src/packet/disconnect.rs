use crate::error::Result;
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::properties::{Properties, PropertyContext};
use crate::types::ProtocolVersion;
use bytes::{Buf, BufMut};

const DISCONNECT: PropertyContext = PropertyContext::Packet(PacketType::Disconnect);

/// Empty before MQTT 5. At level 5 the reason code and properties are both
/// optional on the wire and default to "normal disconnection".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisconnectPacket {
    pub reason_code: u8,
    pub properties: Properties,
}

impl DisconnectPacket {
    #[must_use]
    pub fn with_reason(reason_code: u8) -> Self {
        Self {
            reason_code,
            properties: Properties::new(),
        }
    }
}

impl MqttPacket for DisconnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Disconnect
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        if !version.is_v5() {
            return Ok(());
        }
        let has_properties = !self.properties.filtered(DISCONNECT).is_empty();
        if self.reason_code != 0 || has_properties {
            buf.put_u8(self.reason_code);
        }
        if has_properties {
            self.properties.encode(buf, DISCONNECT)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let mut packet = Self::default();
        if version.is_v5() {
            if buf.has_remaining() {
                packet.reason_code = buf.get_u8();
            }
            if buf.has_remaining() {
                packet.properties = Properties::decode(buf, DISCONNECT)?;
            }
        }
        Ok(packet)
    }
}
