pub mod ack;
pub mod auth;
pub mod connack;
pub mod connect;
pub mod disconnect;
pub mod publish;
pub mod suback;
pub mod subscribe;
pub mod unsuback;
pub mod unsubscribe;

pub use ack::{PubAckPacket, PubCompPacket, PubRecPacket, PubRelPacket};
pub use auth::AuthPacket;
pub use connack::ConnAckPacket;
pub use connect::{ConnectPacket, LastWill};
pub use disconnect::DisconnectPacket;
pub use publish::PublishPacket;
pub use suback::SubAckPacket;
pub use subscribe::{SubscribePacket, SubscriptionOptions, TopicSubscription};
pub use unsuback::UnsubAckPacket;
pub use unsubscribe::UnsubscribePacket;

use crate::constants::fixed_header::RESERVED_0010;
use crate::encoding::{decode_variable_int, encode_variable_int, peek_variable_int};
use crate::error::{MqttError, Result};
use crate::types::ProtocolVersion;
use bytes::{Buf, BufMut, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl PacketType {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Connect),
            2 => Some(Self::ConnAck),
            3 => Some(Self::Publish),
            4 => Some(Self::PubAck),
            5 => Some(Self::PubRec),
            6 => Some(Self::PubRel),
            7 => Some(Self::PubComp),
            8 => Some(Self::Subscribe),
            9 => Some(Self::SubAck),
            10 => Some(Self::Unsubscribe),
            11 => Some(Self::UnsubAck),
            12 => Some(Self::PingReq),
            13 => Some(Self::PingResp),
            14 => Some(Self::Disconnect),
            15 => Some(Self::Auth),
            _ => None,
        }
    }

    /// Flag nibble every packet of this type must carry. `None` for PUBLISH,
    /// whose flags are meaningful.
    #[must_use]
    pub fn required_flags(self) -> Option<u8> {
        match self {
            Self::Publish => None,
            Self::PubRel | Self::Subscribe | Self::Unsubscribe => Some(RESERVED_0010),
            _ => Some(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
}

impl FixedHeader {
    #[must_use]
    pub fn new(packet_type: PacketType, flags: u8, remaining_length: u32) -> Self {
        Self {
            packet_type,
            flags,
            remaining_length,
        }
    }

    /// # Errors
    /// Returns error if the remaining length cannot be represented.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u8(((self.packet_type as u8) << 4) | (self.flags & 0x0F));
        encode_variable_int(buf, self.remaining_length)
    }

    /// # Errors
    /// Returns error on an unknown type, illegal flags for the type, or a
    /// malformed remaining length.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "Missing fixed header".to_string(),
            ));
        }
        let first = buf.get_u8();
        Self::from_first_byte(first, decode_variable_int(buf)?)
    }

    fn from_first_byte(first: u8, remaining_length: u32) -> Result<Self> {
        let packet_type =
            PacketType::from_u8(first >> 4).ok_or(MqttError::InvalidPacketType(first >> 4))?;
        let flags = first & 0x0F;
        if let Some(required) = packet_type.required_flags() {
            if flags != required {
                return Err(MqttError::MalformedPacket(format!(
                    "{packet_type:?} fixed header flags must be 0x{required:X}, got 0x{flags:X}"
                )));
            }
        }
        Ok(Self::new(packet_type, flags, remaining_length))
    }
}

/// Shared shape of every control packet body.
pub trait MqttPacket: Sized {
    fn packet_type(&self) -> PacketType;

    fn flags(&self) -> u8 {
        self.packet_type().required_flags().unwrap_or(0)
    }

    /// # Errors
    /// Returns error if a field cannot be represented on the wire.
    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()>;

    /// # Errors
    /// Returns error if the body is malformed.
    fn decode_body<B: Buf>(
        buf: &mut B,
        header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self>;

    /// Writes the fixed header followed by the body.
    ///
    /// # Errors
    /// Returns error if the body cannot be encoded or is too large.
    fn encode<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        let mut body = BytesMut::new();
        self.encode_body(&mut body, version)?;
        let len = u32::try_from(body.len()).map_err(|_| MqttError::PacketTooLarge {
            size: body.len(),
            max: crate::constants::VARIABLE_BYTE_INT_MAX as usize,
        })?;
        FixedHeader::new(self.packet_type(), self.flags(), len).encode(buf)?;
        buf.put_slice(&body);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<ConnectPacket>),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(PubAckPacket),
    PubRec(PubRecPacket),
    PubRel(PubRelPacket),
    PubComp(PubCompPacket),
    Subscribe(SubscribePacket),
    SubAck(SubAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck(UnsubAckPacket),
    PingReq,
    PingResp,
    Disconnect(DisconnectPacket),
    Auth(AuthPacket),
}

impl Packet {
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnAck(_) => PacketType::ConnAck,
            Self::Publish(_) => PacketType::Publish,
            Self::PubAck(_) => PacketType::PubAck,
            Self::PubRec(_) => PacketType::PubRec,
            Self::PubRel(_) => PacketType::PubRel,
            Self::PubComp(_) => PacketType::PubComp,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubAck(_) => PacketType::SubAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubAck(_) => PacketType::UnsubAck,
            Self::PingReq => PacketType::PingReq,
            Self::PingResp => PacketType::PingResp,
            Self::Disconnect(_) => PacketType::Disconnect,
            Self::Auth(_) => PacketType::Auth,
        }
    }

    /// Packet identifier for the id-bearing variants. A QoS 0 publish has none.
    #[must_use]
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Self::Publish(p) => p.packet_id,
            Self::PubAck(p) => Some(p.packet_id),
            Self::PubRec(p) => Some(p.packet_id),
            Self::PubRel(p) => Some(p.packet_id),
            Self::PubComp(p) => Some(p.packet_id),
            Self::Subscribe(p) => Some(p.packet_id),
            Self::SubAck(p) => Some(p.packet_id),
            Self::Unsubscribe(p) => Some(p.packet_id),
            Self::UnsubAck(p) => Some(p.packet_id),
            _ => None,
        }
    }

    /// # Errors
    /// Returns error if the packet cannot be encoded for `version`.
    pub fn encode<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        match self {
            Self::Connect(p) => p.encode(buf, version),
            Self::ConnAck(p) => p.encode(buf, version),
            Self::Publish(p) => p.encode(buf, version),
            Self::PubAck(p) => p.encode(buf, version),
            Self::PubRec(p) => p.encode(buf, version),
            Self::PubRel(p) => p.encode(buf, version),
            Self::PubComp(p) => p.encode(buf, version),
            Self::Subscribe(p) => p.encode(buf, version),
            Self::SubAck(p) => p.encode(buf, version),
            Self::Unsubscribe(p) => p.encode(buf, version),
            Self::UnsubAck(p) => p.encode(buf, version),
            Self::PingReq => FixedHeader::new(PacketType::PingReq, 0, 0).encode(buf),
            Self::PingResp => FixedHeader::new(PacketType::PingResp, 0, 0).encode(buf),
            Self::Disconnect(p) => p.encode(buf, version),
            Self::Auth(p) => {
                if !version.is_v5() {
                    return Err(MqttError::ProtocolError(
                        "AUTH requires MQTT 5".to_string(),
                    ));
                }
                p.encode(buf, version)
            }
        }
    }

    /// # Errors
    /// Returns error if the packet cannot be encoded for `version`.
    pub fn to_bytes(&self, version: ProtocolVersion) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf, version)?;
        Ok(buf)
    }

    /// Decodes one complete frame from `buf`.
    ///
    /// # Errors
    /// Returns error on a short read or a malformed packet.
    pub fn decode<B: Buf>(buf: &mut B, version: ProtocolVersion) -> Result<Self> {
        let header = FixedHeader::decode(buf)?;
        let len = header.remaining_length as usize;
        if buf.remaining() < len {
            return Err(MqttError::MalformedPacket(format!(
                "{:?} declares {len} bytes, only {} available",
                header.packet_type,
                buf.remaining()
            )));
        }
        let mut body = buf.copy_to_bytes(len);
        Self::decode_from_body(&mut body, &header, version)
    }

    /// Decodes a single frame from the front of `buf` if one is complete.
    /// Returns `Ok(None)` without consuming anything when more bytes are
    /// needed.
    ///
    /// # Errors
    /// `PacketTooLarge` if the declared size exceeds `max_packet_size`, and
    /// any decode error of the frame itself.
    pub fn try_decode(
        buf: &mut BytesMut,
        version: ProtocolVersion,
        max_packet_size: usize,
    ) -> Result<Option<Self>> {
        if buf.is_empty() {
            return Ok(None);
        }
        let Some((remaining_length, len_bytes)) = peek_variable_int(&buf[1..])? else {
            return Ok(None);
        };
        let frame_len = 1 + len_bytes + remaining_length as usize;
        if frame_len > max_packet_size {
            return Err(MqttError::PacketTooLarge {
                size: frame_len,
                max: max_packet_size,
            });
        }
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let header = FixedHeader::from_first_byte(buf[0], remaining_length)?;
        let mut frame = buf.split_to(frame_len).freeze();
        frame.advance(1 + len_bytes);
        Self::decode_from_body(&mut frame, &header, version).map(Some)
    }

    /// # Errors
    /// Returns error if the body is malformed for `header.packet_type`.
    pub fn decode_from_body<B: Buf>(
        body: &mut B,
        header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let packet = match header.packet_type {
            PacketType::Connect => {
                Self::Connect(Box::new(ConnectPacket::decode_body(body, header, version)?))
            }
            PacketType::ConnAck => Self::ConnAck(ConnAckPacket::decode_body(body, header, version)?),
            PacketType::Publish => Self::Publish(PublishPacket::decode_body(body, header, version)?),
            PacketType::PubAck => Self::PubAck(PubAckPacket::decode_body(body, header, version)?),
            PacketType::PubRec => Self::PubRec(PubRecPacket::decode_body(body, header, version)?),
            PacketType::PubRel => Self::PubRel(PubRelPacket::decode_body(body, header, version)?),
            PacketType::PubComp => {
                Self::PubComp(PubCompPacket::decode_body(body, header, version)?)
            }
            PacketType::Subscribe => {
                Self::Subscribe(SubscribePacket::decode_body(body, header, version)?)
            }
            PacketType::SubAck => Self::SubAck(SubAckPacket::decode_body(body, header, version)?),
            PacketType::Unsubscribe => {
                Self::Unsubscribe(UnsubscribePacket::decode_body(body, header, version)?)
            }
            PacketType::UnsubAck => {
                Self::UnsubAck(UnsubAckPacket::decode_body(body, header, version)?)
            }
            PacketType::PingReq => Self::PingReq,
            PacketType::PingResp => Self::PingResp,
            PacketType::Disconnect => {
                Self::Disconnect(DisconnectPacket::decode_body(body, header, version)?)
            }
            PacketType::Auth => {
                if !version.is_v5() {
                    return Err(MqttError::InvalidPacketType(PacketType::Auth as u8));
                }
                Self::Auth(AuthPacket::decode_body(body, header, version)?)
            }
        };
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QoS;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn round_trip(packet: &Packet, version: ProtocolVersion) -> Packet {
        let mut buf = packet.to_bytes(version).unwrap();
        let decoded = Packet::decode(&mut buf, version).unwrap();
        assert!(buf.is_empty(), "decoder left {} bytes", buf.len());
        decoded
    }

    #[test]
    fn test_fixed_header_flags_enforced() {
        let mut buf = Bytes::from_static(&[0x60, 0x02, 0x00, 0x01]);
        assert!(FixedHeader::decode(&mut buf).is_err());

        let mut buf = Bytes::from_static(&[0x62, 0x02, 0x00, 0x01]);
        let header = FixedHeader::decode(&mut buf).unwrap();
        assert_eq!(header.packet_type, PacketType::PubRel);
        assert_eq!(header.remaining_length, 2);
    }

    #[test]
    fn test_unknown_packet_type() {
        let mut buf = Bytes::from_static(&[0x00, 0x00]);
        assert_eq!(
            FixedHeader::decode(&mut buf),
            Err(MqttError::InvalidPacketType(0))
        );
    }

    #[test]
    fn test_ping_encoding() {
        let buf = Packet::PingReq.to_bytes(ProtocolVersion::V311).unwrap();
        assert_eq!(&buf[..], &[0xC0, 0x00]);
        let buf = Packet::PingResp.to_bytes(ProtocolVersion::V311).unwrap();
        assert_eq!(&buf[..], &[0xD0, 0x00]);
    }

    #[test]
    fn test_short_read() {
        let mut buf = Bytes::from_static(&[0x40, 0x02, 0x00]);
        assert!(Packet::decode(&mut buf, ProtocolVersion::V311).is_err());
    }

    #[test]
    fn test_try_decode_incremental() {
        let packet = Packet::Publish(
            PublishPacket::new("a/b", Bytes::from_static(b"payload"), QoS::AtLeastOnce)
                .with_packet_id(7),
        );
        let encoded = packet.to_bytes(ProtocolVersion::V311).unwrap();

        let mut buf = BytesMut::new();
        for (i, byte) in encoded.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let result = Packet::try_decode(&mut buf, ProtocolVersion::V311, 1024).unwrap();
            if i + 1 < encoded.len() {
                assert!(result.is_none());
            } else {
                assert_eq!(result, Some(packet.clone()));
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_try_decode_two_frames() {
        let mut buf = BytesMut::new();
        Packet::PingResp.encode(&mut buf, ProtocolVersion::V311).unwrap();
        Packet::PubAck(PubAckPacket::new(3))
            .encode(&mut buf, ProtocolVersion::V311)
            .unwrap();

        let first = Packet::try_decode(&mut buf, ProtocolVersion::V311, 1024).unwrap();
        assert_eq!(first, Some(Packet::PingResp));
        let second = Packet::try_decode(&mut buf, ProtocolVersion::V311, 1024).unwrap();
        assert_eq!(second, Some(Packet::PubAck(PubAckPacket::new(3))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_try_decode_too_large() {
        let mut buf = BytesMut::from(&[0x30, 0xFF, 0x7F][..]);
        assert!(matches!(
            Packet::try_decode(&mut buf, ProtocolVersion::V311, 1024),
            Err(MqttError::PacketTooLarge { .. })
        ));
    }

    #[test]
    fn test_auth_rejected_before_v5() {
        let mut buf = Bytes::from_static(&[0xF0, 0x00]);
        assert!(Packet::decode(&mut buf, ProtocolVersion::V311).is_err());
    }

    #[test]
    fn test_every_packet_round_trips() {
        let connect = ConnectPacket::new("client-1", ProtocolVersion::V311)
            .with_keep_alive(30)
            .with_credentials(Some("user".into()), Some(Bytes::from_static(b"pw")))
            .with_will(LastWill::new("will/t", Bytes::from_static(b"bye"), QoS::AtLeastOnce, true));

        let mut subscribe = SubscribePacket::new(10);
        subscribe.add_filter("a/+", QoS::ExactlyOnce);
        subscribe.add_filter("b/#", QoS::AtMostOnce);

        let packets = vec![
            Packet::Connect(Box::new(connect)),
            Packet::ConnAck(ConnAckPacket::new(true, crate::types::ConnectReturnCode::Accepted)),
            Packet::Publish(PublishPacket::new("t", Bytes::from_static(b"x"), QoS::AtMostOnce)),
            Packet::Publish(
                PublishPacket::new("t", Bytes::new(), QoS::ExactlyOnce)
                    .with_packet_id(65535)
                    .with_dup(true)
                    .with_retain(true),
            ),
            Packet::PubAck(PubAckPacket::new(1)),
            Packet::PubRec(PubRecPacket::new(2)),
            Packet::PubRel(PubRelPacket::new(3)),
            Packet::PubComp(PubCompPacket::new(4)),
            Packet::Subscribe(subscribe),
            Packet::SubAck(SubAckPacket::new(10, vec![0x02, 0x80])),
            Packet::Unsubscribe(UnsubscribePacket::new(11, vec!["a/+".to_string()])),
            Packet::UnsubAck(UnsubAckPacket::new(11)),
            Packet::PingReq,
            Packet::PingResp,
            Packet::Disconnect(DisconnectPacket::default()),
        ];

        for version in [ProtocolVersion::V31, ProtocolVersion::V311, ProtocolVersion::V5] {
            for packet in &packets {
                let mut expected = packet.clone();
                if let Packet::Connect(c) = &mut expected {
                    c.protocol_version = version;
                }
                let decoded = round_trip(&expected, version);
                assert_eq!(decoded, expected, "{version:?}");
            }
        }
    }

    proptest! {
        #[test]
        fn prop_publish_round_trip(
            topic in "[a-z]{1,8}(/[a-z0-9]{1,8}){0,4}",
            payload in proptest::collection::vec(any::<u8>(), 0..512),
            qos in 0u8..=2,
            packet_id in 1u16..=u16::MAX,
            retain in any::<bool>(),
            v5 in any::<bool>(),
        ) {
            let qos = QoS::try_from(qos).unwrap();
            let version = if v5 { ProtocolVersion::V5 } else { ProtocolVersion::V311 };
            let mut publish = PublishPacket::new(topic, Bytes::from(payload), qos).with_retain(retain);
            if qos != QoS::AtMostOnce {
                publish = publish.with_packet_id(packet_id);
            }
            let packet = Packet::Publish(publish);
            let mut buf = packet.to_bytes(version).unwrap();
            let decoded = Packet::decode(&mut buf, version).unwrap();
            prop_assert_eq!(decoded, packet);
        }
    }
}
