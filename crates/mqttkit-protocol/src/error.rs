use crate::types::ConnectReturnCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MqttError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MqttError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Connect timeout")]
    ConnectTimeout,

    #[error("Keep alive timeout")]
    KeepAliveTimeout,

    #[error("Connection closed by peer")]
    ConnectionClosedByPeer,

    #[error("Connection refused: {0}")]
    ConnectionRefused(ConnectReturnCode),

    #[error("Bad username or password")]
    BadUsernameOrPassword,

    #[error("Not authorized")]
    NotAuthorized,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Malformed remaining length")]
    MalformedRemainingLength,

    #[error("Packet too large: size {size} exceeds maximum {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Unexpected packet: {0}")]
    UnexpectedPacket(String),

    #[error("Invalid property ID: {0}")]
    InvalidPropertyId(u8),

    #[error("Property 0x{property:02X} is not valid for {context}")]
    InvalidPropertyForPacket { property: u8, context: String },

    #[error("Duplicate property ID: {0}")]
    DuplicatePropertyId(u8),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("String too long: {0} bytes exceeds maximum of 65535")]
    StringTooLong(usize),

    #[error("Publish failed with reason code 0x{0:02X}")]
    PublishFailed(u8),

    #[error("Server sent DISCONNECT with reason code 0x{0:02X}")]
    ServerDisconnected(u8),

    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Already disconnected")]
    AlreadyDisconnected,

    #[error("Disconnection in progress")]
    DisconnectionInProgress,

    #[error("Connection attempt aborted by disconnect")]
    AbortedConnection,

    #[error("Disconnection requested during reconnect")]
    DisconnectionRequested,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Packet ID exhausted")]
    PacketIdExhausted,

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Coarse classification of an [`MqttError`], used by callers that only need
/// to know which layer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Auth,
    Topic,
    QoS,
    Lifecycle,
    Resource,
    Persistence,
    Configuration,
}

impl MqttError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_)
            | Self::ConnectionError(_)
            | Self::Tls(_)
            | Self::WriteTimeout
            | Self::ConnectTimeout
            | Self::KeepAliveTimeout
            | Self::ConnectionClosedByPeer => ErrorKind::Transport,
            Self::BadUsernameOrPassword | Self::NotAuthorized => ErrorKind::Auth,
            Self::ConnectionRefused(code) => match code {
                ConnectReturnCode::BadUsernameOrPassword | ConnectReturnCode::NotAuthorized => {
                    ErrorKind::Auth
                }
                _ => ErrorKind::Protocol,
            },
            Self::ProtocolError(_)
            | Self::MalformedPacket(_)
            | Self::MalformedRemainingLength
            | Self::PacketTooLarge { .. }
            | Self::InvalidPacketType(_)
            | Self::UnexpectedPacket(_)
            | Self::InvalidPropertyId(_)
            | Self::InvalidPropertyForPacket { .. }
            | Self::DuplicatePropertyId(_)
            | Self::UnsupportedProtocolVersion(_)
            | Self::StringTooLong(_)
            | Self::PublishFailed(_)
            | Self::ServerDisconnected(_) => ErrorKind::Protocol,
            Self::InvalidTopicName(_) | Self::InvalidTopicFilter(_) => ErrorKind::Topic,
            Self::InvalidQoS(_) => ErrorKind::QoS,
            Self::NotConnected
            | Self::AlreadyConnected
            | Self::AlreadyDisconnected
            | Self::DisconnectionInProgress
            | Self::AbortedConnection
            | Self::DisconnectionRequested
            | Self::InvalidState(_) => ErrorKind::Lifecycle,
            Self::PacketIdExhausted => ErrorKind::Resource,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// True when the error means the byte stream is gone and the session
    /// should either reconnect or shut down.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Protocol)
    }
}

impl From<std::io::Error> for MqttError {
    fn from(err: std::io::Error) -> Self {
        MqttError::Io(err.to_string())
    }
}
