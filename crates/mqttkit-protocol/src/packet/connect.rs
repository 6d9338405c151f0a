use crate::encoding::{
    decode_binary, decode_string, decode_u16, decode_u8, encode_binary, encode_string,
};
use crate::error::{MqttError, Result};
use crate::flags::ConnectFlags;
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::properties::{Properties, PropertyContext};
use crate::types::{ProtocolVersion, QoS};
use bytes::{Buf, BufMut, Bytes};

const CONNECT: PropertyContext = PropertyContext::Packet(PacketType::Connect);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

impl LastWill {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            properties: Properties::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    /// Drives both the protocol name and level written to the wire.
    pub protocol_version: ProtocolVersion,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub properties: Properties,
}

impl ConnectPacket {
    #[must_use]
    pub fn new(client_id: impl Into<String>, protocol_version: ProtocolVersion) -> Self {
        Self {
            protocol_version,
            clean_session: true,
            keep_alive: 60,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
            properties: Properties::new(),
        }
    }

    #[must_use]
    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    #[must_use]
    pub fn with_will(mut self, will: LastWill) -> Self {
        self.will = Some(will);
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: Option<String>, password: Option<Bytes>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    #[must_use]
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    fn connect_flags(&self) -> ConnectFlags {
        ConnectFlags {
            username: self.username.is_some(),
            password: self.password.is_some(),
            will_retain: self.will.as_ref().is_some_and(|w| w.retain),
            will_qos: self.will.as_ref().map_or(QoS::AtMostOnce, |w| w.qos),
            will: self.will.is_some(),
            clean_session: self.clean_session,
        }
    }
}

impl MqttPacket for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }

    /// The packet's own `protocol_version` wins over `_version`; CONNECT is
    /// what establishes the version in the first place.
    fn encode_body<B: BufMut>(&self, buf: &mut B, _version: ProtocolVersion) -> Result<()> {
        let version = self.protocol_version;
        encode_string(buf, version.protocol_name())?;
        buf.put_u8(version.as_u8());
        buf.put_u8(self.connect_flags().to_byte());
        buf.put_u16(self.keep_alive);
        if version.is_v5() {
            self.properties.encode(buf, CONNECT)?;
        }

        encode_string(buf, &self.client_id)?;

        if let Some(will) = &self.will {
            if version.is_v5() {
                will.properties.encode(buf, PropertyContext::Will)?;
            }
            encode_string(buf, &will.topic)?;
            encode_binary(buf, &will.payload)?;
        }
        if let Some(username) = &self.username {
            encode_string(buf, username)?;
        }
        if let Some(password) = &self.password {
            encode_binary(buf, password)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _header: &FixedHeader,
        _version: ProtocolVersion,
    ) -> Result<Self> {
        let name = decode_string(buf)?;
        let level = decode_u8(buf, "protocol level")?;
        let protocol_version = ProtocolVersion::try_from(level)?;
        if name != protocol_version.protocol_name() {
            return Err(MqttError::ProtocolError(format!(
                "protocol name {name:?} does not match level {level}"
            )));
        }

        let flags = ConnectFlags::from_byte(decode_u8(buf, "connect flags")?)?;
        let keep_alive = decode_u16(buf, "keep alive")?;
        let properties = if protocol_version.is_v5() {
            Properties::decode(buf, CONNECT)?
        } else {
            Properties::new()
        };

        let client_id = decode_string(buf)?;

        let will = if flags.will {
            let will_properties = if protocol_version.is_v5() {
                Properties::decode(buf, PropertyContext::Will)?
            } else {
                Properties::new()
            };
            let topic = decode_string(buf)?;
            let payload = decode_binary(buf)?;
            Some(LastWill {
                topic,
                payload,
                qos: flags.will_qos,
                retain: flags.will_retain,
                properties: will_properties,
            })
        } else {
            if flags.will_retain || flags.will_qos != QoS::AtMostOnce {
                return Err(MqttError::MalformedPacket(
                    "will QoS/retain set without will flag".to_string(),
                ));
            }
            None
        };

        let username = if flags.username {
            Some(decode_string(buf)?)
        } else {
            None
        };
        let password = if flags.password {
            Some(decode_binary(buf)?)
        } else {
            None
        };

        Ok(Self {
            protocol_version,
            clean_session: flags.clean_session,
            keep_alive,
            client_id,
            will,
            username,
            password,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use crate::properties::{PropertyId, PropertyValue};
    use bytes::BytesMut;

    #[test]
    fn test_connect_v31_header() {
        let packet = ConnectPacket::new("c", ProtocolVersion::V31).with_keep_alive(10);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V31).unwrap();
        assert_eq!(
            &buf[..],
            &[
                0x10, 0x0F, 0x00, 0x06, b'M', b'Q', b'I', b's', b'd', b'p', 0x03, 0x02, 0x00,
                0x0A, 0x00, 0x01, b'c'
            ]
        );
    }

    #[test]
    fn test_connect_v311_header() {
        let packet = ConnectPacket::new("", ProtocolVersion::V311)
            .with_clean_session(false)
            .with_keep_alive(0);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V311).unwrap();
        assert_eq!(
            &buf[..],
            &[0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_connect_v5_with_will_properties() {
        let mut will = LastWill::new("w", Bytes::from_static(b"gone"), QoS::ExactlyOnce, false);
        will.properties
            .add(PropertyId::WillDelayInterval, PropertyValue::FourByteInteger(5))
            .unwrap();
        let mut props = Properties::new();
        props
            .add(PropertyId::SessionExpiryInterval, PropertyValue::FourByteInteger(3600))
            .unwrap();
        let packet = ConnectPacket::new("v5", ProtocolVersion::V5)
            .with_will(will)
            .with_properties(props)
            .with_credentials(Some("u".into()), None);

        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V5).unwrap();
        let decoded = Packet::decode(&mut buf, ProtocolVersion::V5).unwrap();
        assert_eq!(decoded, Packet::Connect(Box::new(packet)));
    }

    #[test]
    fn test_connect_name_level_mismatch() {
        let mut buf = BytesMut::new();
        encode_string(&mut buf, "MQIsdp").unwrap();
        buf.put_u8(4);
        buf.put_u8(0x02);
        buf.put_u16(0);
        encode_string(&mut buf, "x").unwrap();
        let header = FixedHeader::new(PacketType::Connect, 0, 0);
        assert!(ConnectPacket::decode_body(&mut buf, &header, ProtocolVersion::V311).is_err());
    }
}
