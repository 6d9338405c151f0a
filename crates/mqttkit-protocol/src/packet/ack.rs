//! PUBACK, PUBREC, PUBREL and PUBCOMP share one layout: a packet identifier,
//! then (MQTT 5 only) an optional reason code and an optional property block.

use crate::encoding::decode_u16;
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::properties::{Properties, PropertyContext};
use crate::types::ProtocolVersion;
use bytes::{Buf, BufMut};

macro_rules! define_ack_packet {
    (
        $(#[$meta:meta])*
        pub struct $name:ident;
        packet_type = $packet_type:expr;
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub packet_id: u16,
            pub reason_code: u8,
            pub properties: Properties,
        }

        impl $name {
            #[must_use]
            pub fn new(packet_id: u16) -> Self {
                Self {
                    packet_id,
                    reason_code: 0,
                    properties: Properties::new(),
                }
            }

            #[must_use]
            pub fn new_with_reason(packet_id: u16, reason_code: u8) -> Self {
                Self {
                    packet_id,
                    reason_code,
                    properties: Properties::new(),
                }
            }

            /// MQTT 5 reason codes of 0x80 and above signal failure.
            #[must_use]
            pub fn is_error(&self) -> bool {
                self.reason_code >= 0x80
            }
        }

        impl MqttPacket for $name {
            fn packet_type(&self) -> PacketType {
                $packet_type
            }

            fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
                buf.put_u16(self.packet_id);
                if !version.is_v5() {
                    return Ok(());
                }
                let context = PropertyContext::Packet($packet_type);
                let has_properties = !self.properties.filtered(context).is_empty();
                if self.reason_code != 0 || has_properties {
                    buf.put_u8(self.reason_code);
                }
                if has_properties {
                    self.properties.encode(buf, context)?;
                }
                Ok(())
            }

            fn decode_body<B: Buf>(
                buf: &mut B,
                _header: &FixedHeader,
                version: ProtocolVersion,
            ) -> Result<Self> {
                let packet_id = decode_u16(buf, "packet identifier")?;
                if packet_id == 0 {
                    return Err(MqttError::MalformedPacket(format!(
                        "{:?} packet identifier must be non-zero",
                        $packet_type
                    )));
                }
                let mut packet = Self::new(packet_id);
                if version.is_v5() {
                    if buf.has_remaining() {
                        packet.reason_code = buf.get_u8();
                    }
                    if buf.has_remaining() {
                        packet.properties =
                            Properties::decode(buf, PropertyContext::Packet($packet_type))?;
                    }
                }
                Ok(packet)
            }
        }
    };
}

define_ack_packet! {
    /// QoS 1 publish acknowledgement.
    pub struct PubAckPacket;
    packet_type = PacketType::PubAck;
}

define_ack_packet! {
    /// First QoS 2 acknowledgement, sent by the receiver of a PUBLISH.
    pub struct PubRecPacket;
    packet_type = PacketType::PubRec;
}

define_ack_packet! {
    /// Second QoS 2 step, sent by the original publisher. Fixed header
    /// flags are always 0x2.
    pub struct PubRelPacket;
    packet_type = PacketType::PubRel;
}

define_ack_packet! {
    pub struct PubCompPacket;
    packet_type = PacketType::PubComp;
}
