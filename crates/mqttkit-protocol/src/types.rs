use crate::error::{MqttError, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtocolVersion {
    V31,
    #[default]
    V311,
    V5,
}

impl ProtocolVersion {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            ProtocolVersion::V31 => 3,
            ProtocolVersion::V311 => 4,
            ProtocolVersion::V5 => 5,
        }
    }

    /// Protocol name written into the CONNECT variable header.
    #[must_use]
    pub fn protocol_name(self) -> &'static str {
        match self {
            ProtocolVersion::V31 => "MQIsdp",
            ProtocolVersion::V311 | ProtocolVersion::V5 => "MQTT",
        }
    }

    #[must_use]
    pub fn is_v5(self) -> bool {
        self == ProtocolVersion::V5
    }
}

impl From<ProtocolVersion> for u8 {
    fn from(version: ProtocolVersion) -> Self {
        version.as_u8()
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            3 => Ok(ProtocolVersion::V31),
            4 => Ok(ProtocolVersion::V311),
            5 => Ok(ProtocolVersion::V5),
            other => Err(MqttError::UnsupportedProtocolVersion(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(MqttError::InvalidQoS(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

/// Outcome carried by CONNACK, folded into the MQTT 3.1.1 vocabulary.
///
/// MQTT 5 reason codes are mapped onto the closest 3.1.1 return code;
/// anything without an equivalent is kept verbatim in `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUsernameOrPassword,
    NotAuthorized,
    Other(u8),
}

impl ConnectReturnCode {
    #[must_use]
    pub fn from_u8(code: u8, version: ProtocolVersion) -> Self {
        if version.is_v5() {
            return match code {
                0x00 => Self::Accepted,
                0x84 => Self::UnacceptableProtocolVersion,
                0x85 => Self::IdentifierRejected,
                0x88 | 0x89 => Self::ServerUnavailable,
                0x86 => Self::BadUsernameOrPassword,
                0x87 => Self::NotAuthorized,
                other => Self::Other(other),
            };
        }
        match code {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUsernameOrPassword,
            5 => Self::NotAuthorized,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub fn to_u8(self, version: ProtocolVersion) -> u8 {
        if version.is_v5() {
            return match self {
                Self::Accepted => 0x00,
                Self::UnacceptableProtocolVersion => 0x84,
                Self::IdentifierRejected => 0x85,
                Self::ServerUnavailable => 0x88,
                Self::BadUsernameOrPassword => 0x86,
                Self::NotAuthorized => 0x87,
                Self::Other(code) => code,
            };
        }
        match self {
            Self::Accepted => 0,
            Self::UnacceptableProtocolVersion => 1,
            Self::IdentifierRejected => 2,
            Self::ServerUnavailable => 3,
            Self::BadUsernameOrPassword => 4,
            Self::NotAuthorized => 5,
            Self::Other(code) => code,
        }
    }

    #[must_use]
    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }

    /// Converts a refusal into the error surfaced on the connect token.
    #[must_use]
    pub fn into_error(self) -> Option<MqttError> {
        match self {
            Self::Accepted => None,
            Self::BadUsernameOrPassword => Some(MqttError::BadUsernameOrPassword),
            Self::NotAuthorized => Some(MqttError::NotAuthorized),
            Self::Other(code) => Some(MqttError::ProtocolError(format!(
                "unexpected CONNACK return code 0x{code:02X}"
            ))),
            refused => Some(MqttError::ConnectionRefused(refused)),
        }
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::UnacceptableProtocolVersion => write!(f, "unacceptable protocol version"),
            Self::IdentifierRejected => write!(f, "identifier rejected"),
            Self::ServerUnavailable => write!(f, "server unavailable"),
            Self::BadUsernameOrPassword => write!(f, "bad username or password"),
            Self::NotAuthorized => write!(f, "not authorized"),
            Self::Other(code) => write!(f, "return code 0x{code:02X}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version_names() {
        assert_eq!(ProtocolVersion::V31.protocol_name(), "MQIsdp");
        assert_eq!(ProtocolVersion::V31.as_u8(), 3);
        assert_eq!(ProtocolVersion::V311.protocol_name(), "MQTT");
        assert_eq!(ProtocolVersion::V5.as_u8(), 5);
        assert!(ProtocolVersion::try_from(6).is_err());
    }

    #[test]
    fn test_qos_conversion() {
        assert_eq!(QoS::try_from(2).unwrap(), QoS::ExactlyOnce);
        assert_eq!(QoS::try_from(3), Err(MqttError::InvalidQoS(3)));
        assert_eq!(u8::from(QoS::AtLeastOnce), 1);
    }

    #[test]
    fn test_return_code_mapping_v311() {
        for (code, expected) in [
            (0, ConnectReturnCode::Accepted),
            (1, ConnectReturnCode::UnacceptableProtocolVersion),
            (2, ConnectReturnCode::IdentifierRejected),
            (3, ConnectReturnCode::ServerUnavailable),
            (4, ConnectReturnCode::BadUsernameOrPassword),
            (5, ConnectReturnCode::NotAuthorized),
            (9, ConnectReturnCode::Other(9)),
        ] {
            let rc = ConnectReturnCode::from_u8(code, ProtocolVersion::V311);
            assert_eq!(rc, expected);
            assert_eq!(rc.to_u8(ProtocolVersion::V311), code);
        }
    }

    #[test]
    fn test_return_code_mapping_v5() {
        let v5 = ProtocolVersion::V5;
        assert_eq!(ConnectReturnCode::from_u8(0x85, v5), ConnectReturnCode::IdentifierRejected);
        assert_eq!(ConnectReturnCode::from_u8(0x89, v5), ConnectReturnCode::ServerUnavailable);
        assert_eq!(ConnectReturnCode::from_u8(0x86, v5), ConnectReturnCode::BadUsernameOrPassword);
        assert_eq!(ConnectReturnCode::from_u8(0x9C, v5), ConnectReturnCode::Other(0x9C));
    }

    #[test]
    fn test_return_code_errors() {
        assert!(ConnectReturnCode::Accepted.into_error().is_none());
        assert_eq!(
            ConnectReturnCode::NotAuthorized.into_error(),
            Some(MqttError::NotAuthorized)
        );
        assert!(matches!(
            ConnectReturnCode::Other(0x9C).into_error(),
            Some(MqttError::ProtocolError(_))
        ));
    }
}
