use crate::encoding::decode_u16;
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::properties::{Properties, PropertyContext};
use crate::types::{ProtocolVersion, QoS};
use bytes::{Buf, BufMut};

const SUBACK: PropertyContext = PropertyContext::Packet(PacketType::SubAck);

/// SUBACK failure code shared by every protocol level.
pub const SUBACK_FAILURE: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: u16,
    /// One code per requested filter, in request order: the granted QoS, or
    /// a value of 0x80 and above on failure.
    pub return_codes: Vec<u8>,
    pub properties: Properties,
}

impl SubAckPacket {
    #[must_use]
    pub fn new(packet_id: u16, return_codes: Vec<u8>) -> Self {
        Self {
            packet_id,
            return_codes,
            properties: Properties::new(),
        }
    }

    /// Granted QoS for the filter at `index`, `None` if the broker refused it.
    #[must_use]
    pub fn granted_qos(&self, index: usize) -> Option<QoS> {
        self.return_codes
            .get(index)
            .and_then(|code| QoS::try_from(*code).ok())
    }
}

impl MqttPacket for SubAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::SubAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        buf.put_u16(self.packet_id);
        if version.is_v5() {
            self.properties.encode(buf, SUBACK)?;
        }
        buf.put_slice(&self.return_codes);
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let packet_id = decode_u16(buf, "packet identifier")?;
        let properties = if version.is_v5() {
            Properties::decode(buf, SUBACK)?
        } else {
            Properties::new()
        };
        let return_codes = buf.copy_to_bytes(buf.remaining()).to_vec();
        if return_codes.is_empty() {
            return Err(MqttError::MalformedPacket(
                "SUBACK carries no return codes".to_string(),
            ));
        }
        Ok(Self {
            packet_id,
            return_codes,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use bytes::Bytes;

    #[test]
    fn test_suback_decode() {
        let mut buf = Bytes::from_static(&[0x90, 0x04, 0x00, 0x07, 0x01, 0x80]);
        let Packet::SubAck(suback) = Packet::decode(&mut buf, ProtocolVersion::V311).unwrap()
        else {
            panic!("expected SUBACK");
        };
        assert_eq!(suback.packet_id, 7);
        assert_eq!(suback.granted_qos(0), Some(QoS::AtLeastOnce));
        assert_eq!(suback.granted_qos(1), None);
    }

    #[test]
    fn test_suback_v5_has_properties() {
        let mut buf = Bytes::from_static(&[0x90, 0x04, 0x00, 0x07, 0x00, 0x02]);
        let Packet::SubAck(suback) = Packet::decode(&mut buf, ProtocolVersion::V5).unwrap() else {
            panic!("expected SUBACK");
        };
        assert_eq!(suback.return_codes, vec![0x02]);
    }

    #[test]
    fn test_suback_empty_rejected() {
        let mut buf = Bytes::from_static(&[0x90, 0x02, 0x00, 0x07]);
        assert!(Packet::decode(&mut buf, ProtocolVersion::V311).is_err());
    }
}
