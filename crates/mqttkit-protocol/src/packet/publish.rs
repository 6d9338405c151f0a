use crate::encoding::{decode_string, decode_u16, encode_string};
use crate::error::{MqttError, Result};
use crate::flags::PublishFlags;
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::properties::{Properties, PropertyContext};
use crate::types::{ProtocolVersion, QoS};
use bytes::{Buf, BufMut, Bytes};

const PUBLISH: PropertyContext = PropertyContext::Packet(PacketType::Publish);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub topic_name: String,
    /// `None` for QoS 0, and for QoS 1/2 until the writer assigns one.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub properties: Properties,
}

impl PublishPacket {
    #[must_use]
    pub fn new(topic_name: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic_name: topic_name.into(),
            packet_id: None,
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
            properties: Properties::new(),
        }
    }

    #[must_use]
    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = Some(packet_id);
        self
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }

    #[must_use]
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }
}

impl MqttPacket for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish
    }

    fn flags(&self) -> u8 {
        PublishFlags {
            dup: self.dup,
            qos: self.qos,
            retain: self.retain,
        }
        .to_nibble()
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        encode_string(buf, &self.topic_name)?;
        if self.qos != QoS::AtMostOnce {
            let packet_id = self.packet_id.filter(|id| *id != 0).ok_or_else(|| {
                MqttError::MalformedPacket(format!(
                    "QoS {} PUBLISH to {} has no packet identifier",
                    self.qos as u8, self.topic_name
                ))
            })?;
            buf.put_u16(packet_id);
        }
        if version.is_v5() {
            self.properties.encode(buf, PUBLISH)?;
        }
        buf.put_slice(&self.payload);
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let flags = PublishFlags::from_nibble(header.flags)?;
        let topic_name = decode_string(buf)?;

        let packet_id = if flags.qos == QoS::AtMostOnce {
            None
        } else {
            let id = decode_u16(buf, "packet identifier")?;
            if id == 0 {
                return Err(MqttError::MalformedPacket(
                    "PUBLISH packet identifier must be non-zero".to_string(),
                ));
            }
            Some(id)
        };

        let properties = if version.is_v5() {
            Properties::decode(buf, PUBLISH)?
        } else {
            Properties::new()
        };

        let payload = buf.copy_to_bytes(buf.remaining());

        Ok(Self {
            topic_name,
            packet_id,
            payload,
            qos: flags.qos,
            retain: flags.retain,
            dup: flags.dup,
            properties,
        })
    }
}
