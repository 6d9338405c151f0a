#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::module_name_repetitions)]

//! Wire-level building blocks shared by the `mqttkit` client: the packet
//! codec for MQTT 3.1, 3.1.1 and 5.0, the v5 property table, topic
//! validation and filter matching, and the error type used across the
//! workspace.

pub mod constants;
pub mod encoding;
pub mod error;
pub mod flags;
pub mod packet;
pub mod properties;
pub mod topic;
pub mod types;

pub use error::{ErrorKind, MqttError, Result};
pub use flags::{ConnAckFlags, ConnectFlags, PublishFlags};
pub use packet::{FixedHeader, MqttPacket, Packet, PacketType};
pub use properties::{
    Properties, PropertyContext, PropertyId, PropertyValue, PropertyValueType,
};
pub use topic::{topic_matches_filter, validate_topic_filter, validate_topic_name, TopicFilter};
pub use types::{ConnectReturnCode, ProtocolVersion, QoS};
