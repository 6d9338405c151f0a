//! Wire-level limits and defaults.

/// Largest value a variable byte integer can carry (4 bytes, 7 bits each).
pub const VARIABLE_BYTE_INT_MAX: u32 = 268_435_455;

pub const MAX_STRING_LENGTH: usize = u16::MAX as usize;

pub const MAX_BINARY_LENGTH: usize = u16::MAX as usize;

/// Upper bound on a single decoded packet unless the caller sets a lower one.
pub const DEFAULT_MAX_PACKET_SIZE: usize = VARIABLE_BYTE_INT_MAX as usize + 5;

pub const SHARED_SUBSCRIPTION_PREFIX: &str = "$share/";

pub mod fixed_header {
    pub const PUBLISH_RETAIN: u8 = 0x01;
    pub const PUBLISH_QOS_MASK: u8 = 0x06;
    pub const PUBLISH_QOS_SHIFT: u8 = 1;
    pub const PUBLISH_DUP: u8 = 0x08;
    /// Required flag nibble for PUBREL, SUBSCRIBE and UNSUBSCRIBE.
    pub const RESERVED_0010: u8 = 0x02;
}
