use crate::constants::fixed_header;
use crate::error::{MqttError, Result};
use crate::types::QoS;

/// CONNECT flags byte, MSB to LSB: username, password, will retain,
/// will QoS (2 bits), will, clean session, reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectFlags {
    pub username: bool,
    pub password: bool,
    pub will_retain: bool,
    pub will_qos: QoS,
    pub will: bool,
    pub clean_session: bool,
}

impl ConnectFlags {
    const USERNAME: u8 = 0x80;
    const PASSWORD: u8 = 0x40;
    const WILL_RETAIN: u8 = 0x20;
    const WILL_QOS_MASK: u8 = 0x18;
    const WILL_QOS_SHIFT: u8 = 3;
    const WILL: u8 = 0x04;
    const CLEAN_SESSION: u8 = 0x02;
    const RESERVED: u8 = 0x01;

    #[must_use]
    pub fn to_byte(self) -> u8 {
        let mut byte = 0;
        if self.username {
            byte |= Self::USERNAME;
        }
        if self.password {
            byte |= Self::PASSWORD;
        }
        if self.will_retain {
            byte |= Self::WILL_RETAIN;
        }
        byte |= u8::from(self.will_qos) << Self::WILL_QOS_SHIFT;
        if self.will {
            byte |= Self::WILL;
        }
        if self.clean_session {
            byte |= Self::CLEAN_SESSION;
        }
        byte
    }

    /// # Errors
    /// Rejects a set reserved bit and a will QoS of 3.
    pub fn from_byte(byte: u8) -> Result<Self> {
        if byte & Self::RESERVED != 0 {
            return Err(MqttError::MalformedPacket(
                "CONNECT reserved flag must be zero".to_string(),
            ));
        }
        let will_qos = QoS::try_from((byte & Self::WILL_QOS_MASK) >> Self::WILL_QOS_SHIFT)?;
        Ok(Self {
            username: byte & Self::USERNAME != 0,
            password: byte & Self::PASSWORD != 0,
            will_retain: byte & Self::WILL_RETAIN != 0,
            will_qos,
            will: byte & Self::WILL != 0,
            clean_session: byte & Self::CLEAN_SESSION != 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishFlags {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishFlags {
    #[must_use]
    pub fn to_nibble(self) -> u8 {
        let mut flags = u8::from(self.qos) << fixed_header::PUBLISH_QOS_SHIFT;
        if self.dup {
            flags |= fixed_header::PUBLISH_DUP;
        }
        if self.retain {
            flags |= fixed_header::PUBLISH_RETAIN;
        }
        flags
    }

    /// # Errors
    /// `InvalidQoS(3)` when both QoS bits are set.
    pub fn from_nibble(flags: u8) -> Result<Self> {
        let qos = QoS::try_from(
            (flags & fixed_header::PUBLISH_QOS_MASK) >> fixed_header::PUBLISH_QOS_SHIFT,
        )?;
        Ok(Self {
            dup: flags & fixed_header::PUBLISH_DUP != 0,
            qos,
            retain: flags & fixed_header::PUBLISH_RETAIN != 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnAckFlags {
    pub session_present: bool,
}

impl ConnAckFlags {
    #[must_use]
    pub fn to_byte(self) -> u8 {
        u8::from(self.session_present)
    }

    /// # Errors
    /// Bits 7-1 are reserved and must be zero.
    pub fn from_byte(byte: u8) -> Result<Self> {
        if byte & 0xFE != 0 {
            return Err(MqttError::MalformedPacket(format!(
                "CONNACK flags 0x{byte:02X} use reserved bits"
            )));
        }
        Ok(Self {
            session_present: byte & 0x01 != 0,
        })
    }
}
