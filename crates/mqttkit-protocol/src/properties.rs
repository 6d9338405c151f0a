//! MQTT 5 property table.
//!
//! Properties are stored per identifier in a sorted map so that encoding is
//! deterministic. Each identifier is only legal inside a fixed set of packets
//! (plus the will-properties block of CONNECT); [`PropertyId::allowed_in`]
//! holds that table. Decoding rejects out-of-place properties, encoding
//! silently omits them.

use crate::encoding::{
    binary_len, decode_binary, decode_string, decode_variable_int, encode_binary, encode_string,
    encode_variable_int, string_len, variable_int_len,
};
use crate::error::{MqttError, Result};
use crate::packet::PacketType;
use bytes::{Buf, BufMut, Bytes};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

/// Where a property block sits: inside a packet's variable header, or in
/// the will-properties block of CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyContext {
    Packet(PacketType),
    Will,
}

impl fmt::Display for PropertyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Packet(packet_type) => write!(f, "{packet_type:?}"),
            Self::Will => write!(f, "will properties"),
        }
    }
}

/// Set of contexts a property may appear in: bit `n` for packet type `n`,
/// bit 0 for will properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Scope(u16);

impl Scope {
    const WILL: Self = Self(1);

    const fn of(packet_type: PacketType) -> Self {
        Self(1 << packet_type as u8)
    }

    const fn and(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    const fn except(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    const fn contains(self, context: PropertyContext) -> bool {
        let bit = match context {
            PropertyContext::Will => Self::WILL,
            PropertyContext::Packet(packet_type) => Self::of(packet_type),
        };
        self.0 & bit.0 != 0
    }
}

const CONNECT: Scope = Scope::of(PacketType::Connect);
const CONNACK: Scope = Scope::of(PacketType::ConnAck);
const PUBLISH: Scope = Scope::of(PacketType::Publish);
const SUBSCRIBE: Scope = Scope::of(PacketType::Subscribe);
const DISCONNECT: Scope = Scope::of(PacketType::Disconnect);
const AUTH: Scope = Scope::of(PacketType::Auth);
/// Application message metadata, carried by PUBLISH and by the will.
const MESSAGE: Scope = PUBLISH.and(Scope::WILL);
const HANDSHAKE: Scope = CONNECT.and(CONNACK);
/// Packets that carry a reason code.
const REASONED: Scope = CONNACK
    .and(Scope::of(PacketType::PubAck))
    .and(Scope::of(PacketType::PubRec))
    .and(Scope::of(PacketType::PubRel))
    .and(Scope::of(PacketType::PubComp))
    .and(Scope::of(PacketType::SubAck))
    .and(Scope::of(PacketType::UnsubAck))
    .and(DISCONNECT)
    .and(AUTH);
/// Everything with a property block.
const ANYWHERE: Scope = Scope(0xFFFF)
    .except(Scope::of(PacketType::PingReq))
    .except(Scope::of(PacketType::PingResp));

impl PropertyId {
    pub const ALL: [Self; 27] = [
        Self::PayloadFormatIndicator,
        Self::MessageExpiryInterval,
        Self::ContentType,
        Self::ResponseTopic,
        Self::CorrelationData,
        Self::SubscriptionIdentifier,
        Self::SessionExpiryInterval,
        Self::AssignedClientIdentifier,
        Self::ServerKeepAlive,
        Self::AuthenticationMethod,
        Self::AuthenticationData,
        Self::RequestProblemInformation,
        Self::WillDelayInterval,
        Self::RequestResponseInformation,
        Self::ResponseInformation,
        Self::ServerReference,
        Self::ReasonString,
        Self::ReceiveMaximum,
        Self::TopicAliasMaximum,
        Self::TopicAlias,
        Self::MaximumQoS,
        Self::RetainAvailable,
        Self::UserProperty,
        Self::MaximumPacketSize,
        Self::WildcardSubscriptionAvailable,
        Self::SubscriptionIdentifierAvailable,
        Self::SharedSubscriptionAvailable,
    ];

    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|id| *id as u8 == value)
    }

    /// Wire type and legal contexts, one row per identifier.
    const fn shape(self) -> (PropertyValueType, Scope) {
        use PropertyValueType as T;
        match self {
            Self::PayloadFormatIndicator => (T::Byte, MESSAGE),
            Self::MessageExpiryInterval => (T::FourByteInteger, MESSAGE),
            Self::ContentType => (T::Utf8String, MESSAGE),
            Self::ResponseTopic => (T::Utf8String, MESSAGE),
            Self::CorrelationData => (T::BinaryData, MESSAGE),
            Self::SubscriptionIdentifier => (T::VariableByteInteger, PUBLISH.and(SUBSCRIBE)),
            Self::SessionExpiryInterval => (T::FourByteInteger, HANDSHAKE.and(DISCONNECT)),
            Self::AssignedClientIdentifier => (T::Utf8String, CONNACK),
            Self::ServerKeepAlive => (T::TwoByteInteger, CONNACK),
            Self::AuthenticationMethod => (T::Utf8String, HANDSHAKE.and(AUTH)),
            Self::AuthenticationData => (T::BinaryData, HANDSHAKE.and(AUTH)),
            Self::RequestProblemInformation => (T::Byte, CONNECT),
            Self::WillDelayInterval => (T::FourByteInteger, Scope::WILL),
            Self::RequestResponseInformation => (T::Byte, CONNECT),
            Self::ResponseInformation => (T::Utf8String, CONNACK),
            Self::ServerReference => (T::Utf8String, CONNACK.and(DISCONNECT)),
            Self::ReasonString => (T::Utf8String, REASONED),
            Self::ReceiveMaximum => (T::TwoByteInteger, HANDSHAKE),
            Self::TopicAliasMaximum => (T::TwoByteInteger, HANDSHAKE),
            Self::TopicAlias => (T::TwoByteInteger, PUBLISH),
            Self::MaximumQoS => (T::Byte, CONNACK),
            Self::RetainAvailable => (T::Byte, CONNACK),
            Self::UserProperty => (T::Utf8StringPair, ANYWHERE),
            Self::MaximumPacketSize => (T::FourByteInteger, HANDSHAKE),
            Self::WildcardSubscriptionAvailable => (T::Byte, CONNACK),
            Self::SubscriptionIdentifierAvailable => (T::Byte, CONNACK),
            Self::SharedSubscriptionAvailable => (T::Byte, CONNACK),
        }
    }

    #[must_use]
    pub fn allows_multiple(&self) -> bool {
        matches!(self, Self::UserProperty | Self::SubscriptionIdentifier)
    }

    #[must_use]
    pub fn value_type(&self) -> PropertyValueType {
        self.shape().0
    }

    #[must_use]
    pub fn allowed_in(&self, context: PropertyContext) -> bool {
        self.shape().1.contains(context)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyValueType {
    Byte,
    TwoByteInteger,
    FourByteInteger,
    VariableByteInteger,
    BinaryData,
    Utf8String,
    Utf8StringPair,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Byte(u8),
    TwoByteInteger(u16),
    FourByteInteger(u32),
    VariableByteInteger(u32),
    BinaryData(Bytes),
    Utf8String(String),
    Utf8StringPair(String, String),
}

impl PropertyValue {
    #[must_use]
    pub fn value_type(&self) -> PropertyValueType {
        match self {
            Self::Byte(_) => PropertyValueType::Byte,
            Self::TwoByteInteger(_) => PropertyValueType::TwoByteInteger,
            Self::FourByteInteger(_) => PropertyValueType::FourByteInteger,
            Self::VariableByteInteger(_) => PropertyValueType::VariableByteInteger,
            Self::BinaryData(_) => PropertyValueType::BinaryData,
            Self::Utf8String(_) => PropertyValueType::Utf8String,
            Self::Utf8StringPair(_, _) => PropertyValueType::Utf8StringPair,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::Byte(_) => 1,
            Self::TwoByteInteger(_) => 2,
            Self::FourByteInteger(_) => 4,
            Self::VariableByteInteger(v) => variable_int_len(*v),
            Self::BinaryData(v) => binary_len(v),
            Self::Utf8String(v) => string_len(v),
            Self::Utf8StringPair(k, v) => string_len(k) + string_len(v),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    properties: BTreeMap<PropertyId, Vec<PropertyValue>>,
}

impl Properties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns error if value type doesn't match property's expected type
    /// or if property doesn't allow multiple values and already exists.
    pub fn add(&mut self, id: PropertyId, value: PropertyValue) -> Result<()> {
        if value.value_type() != id.value_type() {
            return Err(MqttError::ProtocolError(format!(
                "Property {:?} expects type {:?}, got {:?}",
                id,
                id.value_type(),
                value.value_type()
            )));
        }

        if !id.allows_multiple() && self.properties.contains_key(&id) {
            return Err(MqttError::DuplicatePropertyId(id as u8));
        }

        self.properties.entry(id).or_default().push(value);
        Ok(())
    }

    /// Adds a user property; user properties may repeat.
    pub fn add_user_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties
            .entry(PropertyId::UserProperty)
            .or_default()
            .push(PropertyValue::Utf8StringPair(key.into(), value.into()));
    }

    #[must_use]
    pub fn get(&self, id: PropertyId) -> Option<&PropertyValue> {
        self.properties.get(&id).and_then(|v| v.first())
    }

    #[must_use]
    pub fn get_all(&self, id: PropertyId) -> Option<&[PropertyValue]> {
        self.properties.get(&id).map(Vec::as_slice)
    }

    #[must_use]
    pub fn contains(&self, id: PropertyId) -> bool {
        self.properties.contains_key(&id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PropertyId, &PropertyValue)> + '_ {
        self.properties
            .iter()
            .flat_map(|(id, values)| values.iter().map(move |value| (*id, value)))
    }

    /// Copy holding only the properties legal in `context`.
    #[must_use]
    pub fn filtered(&self, context: PropertyContext) -> Self {
        Self {
            properties: self
                .properties
                .iter()
                .filter(|(id, _)| id.allowed_in(context))
                .map(|(id, values)| (*id, values.clone()))
                .collect(),
        }
    }

    /// Encodes the property length followed by every property legal in
    /// `context`; the rest are skipped.
    ///
    /// # Errors
    /// Returns error if a string or the block itself is too long.
    pub fn encode<B: BufMut>(&self, buf: &mut B, context: PropertyContext) -> Result<()> {
        let len = self.body_len(context);
        encode_variable_int(
            buf,
            u32::try_from(len).map_err(|_| MqttError::PacketTooLarge {
                size: len,
                max: u32::MAX as usize,
            })?,
        )?;

        for (id, value) in self.iter().filter(|(id, _)| id.allowed_in(context)) {
            buf.put_u8(id as u8);
            match value {
                PropertyValue::Byte(v) => buf.put_u8(*v),
                PropertyValue::TwoByteInteger(v) => buf.put_u16(*v),
                PropertyValue::FourByteInteger(v) => buf.put_u32(*v),
                PropertyValue::VariableByteInteger(v) => encode_variable_int(buf, *v)?,
                PropertyValue::BinaryData(v) => encode_binary(buf, v)?,
                PropertyValue::Utf8String(v) => encode_string(buf, v)?,
                PropertyValue::Utf8StringPair(k, v) => {
                    encode_string(buf, k)?;
                    encode_string(buf, v)?;
                }
            }
        }
        Ok(())
    }

    /// # Errors
    /// Returns error on a short read, an unknown identifier, a type mismatch,
    /// a repeated single-valued property, or a property that is not legal in
    /// `context`.
    pub fn decode<B: Buf>(buf: &mut B, context: PropertyContext) -> Result<Self> {
        let props_len = decode_variable_int(buf)? as usize;

        if buf.remaining() < props_len {
            return Err(MqttError::MalformedPacket(format!(
                "Insufficient data for properties: expected {props_len}, got {}",
                buf.remaining()
            )));
        }

        let mut props_buf = buf.copy_to_bytes(props_len);
        let mut properties = Self::new();

        while props_buf.has_remaining() {
            let id_byte = props_buf.get_u8();
            let id = PropertyId::from_u8(id_byte).ok_or(MqttError::InvalidPropertyId(id_byte))?;

            if !id.allowed_in(context) {
                return Err(MqttError::InvalidPropertyForPacket {
                    property: id_byte,
                    context: context.to_string(),
                });
            }

            let value = decode_value(&mut props_buf, id.value_type())?;
            properties.add(id, value)?;
        }

        Ok(properties)
    }

    /// Size of the encoded block including its length prefix.
    #[must_use]
    pub fn encoded_len(&self, context: PropertyContext) -> usize {
        let body = self.body_len(context);
        variable_int_len(u32::try_from(body).unwrap_or(u32::MAX)) + body
    }

    fn body_len(&self, context: PropertyContext) -> usize {
        self.iter()
            .filter(|(id, _)| id.allowed_in(context))
            .map(|(_, value)| 1 + value.encoded_len())
            .sum()
    }
}

fn decode_value(buf: &mut Bytes, value_type: PropertyValueType) -> Result<PropertyValue> {
    let need = |n: usize, buf: &Bytes| {
        if buf.remaining() < n {
            Err(MqttError::MalformedPacket(format!(
                "Insufficient data for {value_type:?} property"
            )))
        } else {
            Ok(())
        }
    };

    Ok(match value_type {
        PropertyValueType::Byte => {
            need(1, buf)?;
            PropertyValue::Byte(buf.get_u8())
        }
        PropertyValueType::TwoByteInteger => {
            need(2, buf)?;
            PropertyValue::TwoByteInteger(buf.get_u16())
        }
        PropertyValueType::FourByteInteger => {
            need(4, buf)?;
            PropertyValue::FourByteInteger(buf.get_u32())
        }
        PropertyValueType::VariableByteInteger => {
            PropertyValue::VariableByteInteger(decode_variable_int(buf)?)
        }
        PropertyValueType::BinaryData => PropertyValue::BinaryData(decode_binary(buf)?),
        PropertyValueType::Utf8String => PropertyValue::Utf8String(decode_string(buf)?),
        PropertyValueType::Utf8StringPair => {
            let key = decode_string(buf)?;
            let value = decode_string(buf)?;
            PropertyValue::Utf8StringPair(key, value)
        }
    })
}
