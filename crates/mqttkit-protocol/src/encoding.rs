//! Primitive encoders shared by every packet: variable byte integers,
//! length-prefixed strings and binary data.

use crate::constants::{MAX_BINARY_LENGTH, MAX_STRING_LENGTH, VARIABLE_BYTE_INT_MAX};
use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut, Bytes};

/// # Errors
/// Returns `PacketTooLarge` if `value` exceeds the four byte maximum.
pub fn encode_variable_int<B: BufMut>(buf: &mut B, value: u32) -> Result<()> {
    if value > VARIABLE_BYTE_INT_MAX {
        return Err(MqttError::PacketTooLarge {
            size: value as usize,
            max: VARIABLE_BYTE_INT_MAX as usize,
        });
    }

    let mut remaining = value;
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if remaining == 0 {
            return Ok(());
        }
    }
}

/// # Errors
/// `MalformedPacket` on a short read, `MalformedRemainingLength` if the
/// fourth byte still has its continuation bit set.
pub fn decode_variable_int<B: Buf>(buf: &mut B) -> Result<u32> {
    let mut value: u32 = 0;
    let mut multiplier: u32 = 1;

    for index in 0..4 {
        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "Insufficient data for variable byte integer".to_string(),
            ));
        }
        let byte = buf.get_u8();
        value += u32::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        if index == 3 {
            break;
        }
        multiplier *= 128;
    }

    Err(MqttError::MalformedRemainingLength)
}

/// Peeks a variable byte integer at the start of `bytes` without consuming.
/// Returns `Ok(None)` when more bytes are needed.
///
/// # Errors
/// `MalformedRemainingLength` if four bytes all carry the continuation bit.
pub fn peek_variable_int(bytes: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut value: u32 = 0;
    let mut multiplier: u32 = 1;

    for (index, byte) in bytes.iter().take(4).enumerate() {
        value += u32::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
        multiplier *= 128;
    }

    if bytes.len() >= 4 {
        Err(MqttError::MalformedRemainingLength)
    } else {
        Ok(None)
    }
}

#[must_use]
pub fn variable_int_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// # Errors
/// `StringTooLong` if the UTF-8 encoding exceeds 65535 bytes.
pub fn encode_string<B: BufMut>(buf: &mut B, value: &str) -> Result<()> {
    if value.len() > MAX_STRING_LENGTH {
        return Err(MqttError::StringTooLong(value.len()));
    }
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Decodes a length-prefixed string. Invalid UTF-8 is replaced rather than
/// rejected; consumers that care validate themselves.
///
/// # Errors
/// `MalformedPacket` on a short read.
pub fn decode_string<B: Buf>(buf: &mut B) -> Result<String> {
    let raw = decode_binary(buf)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// # Errors
/// `MalformedPacket` if the length prefix exceeds 65535.
pub fn encode_binary<B: BufMut>(buf: &mut B, value: &[u8]) -> Result<()> {
    if value.len() > MAX_BINARY_LENGTH {
        return Err(MqttError::MalformedPacket(format!(
            "Binary data too long: {} bytes",
            value.len()
        )));
    }
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
    Ok(())
}

/// # Errors
/// `MalformedPacket` on a short read.
pub fn decode_binary<B: Buf>(buf: &mut B) -> Result<Bytes> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(
            "Insufficient data for length prefix".to_string(),
        ));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(MqttError::MalformedPacket(format!(
            "Length prefix {len} exceeds remaining {}",
            buf.remaining()
        )));
    }
    Ok(buf.copy_to_bytes(len))
}

/// # Errors
/// `MalformedPacket` if fewer than two bytes remain.
pub fn decode_u16<B: Buf>(buf: &mut B, what: &str) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(format!("Missing {what}")));
    }
    Ok(buf.get_u16())
}

/// # Errors
/// `MalformedPacket` if the buffer is empty.
pub fn decode_u8<B: Buf>(buf: &mut B, what: &str) -> Result<u8> {
    if !buf.has_remaining() {
        return Err(MqttError::MalformedPacket(format!("Missing {what}")));
    }
    Ok(buf.get_u8())
}

#[must_use]
pub fn string_len(value: &str) -> usize {
    2 + value.len()
}

#[must_use]
pub fn binary_len(value: &[u8]) -> usize {
    2 + value.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;

    #[test]
    fn test_variable_int_boundaries() {
        for (value, expected) in [
            (0u32, vec![0x00]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (16_383, vec![0xFF, 0x7F]),
            (16_384, vec![0x80, 0x80, 0x01]),
            (2_097_151, vec![0xFF, 0xFF, 0x7F]),
            (2_097_152, vec![0x80, 0x80, 0x80, 0x01]),
            (268_435_455, vec![0xFF, 0xFF, 0xFF, 0x7F]),
        ] {
            let mut buf = BytesMut::new();
            encode_variable_int(&mut buf, value).unwrap();
            assert_eq!(&buf[..], &expected[..], "encoding {value}");
        }
    }

    #[test]
    fn test_variable_int_too_large() {
        let mut buf = BytesMut::new();
        assert!(encode_variable_int(&mut buf, 268_435_456).is_err());
    }

    #[test]
    fn test_variable_int_fifth_byte_rejected() {
        let mut buf = Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert_eq!(
            decode_variable_int(&mut buf),
            Err(MqttError::MalformedRemainingLength)
        );
        assert_eq!(
            peek_variable_int(&[0x80, 0x80, 0x80, 0x80]),
            Err(MqttError::MalformedRemainingLength)
        );
    }

    #[test]
    fn test_peek_variable_int_incomplete() {
        assert_eq!(peek_variable_int(&[]).unwrap(), None);
        assert_eq!(peek_variable_int(&[0x80, 0x80]).unwrap(), None);
        assert_eq!(peek_variable_int(&[0x80, 0x01]).unwrap(), Some((128, 2)));
    }

    #[test]
    fn test_string_round_trip() {
        let mut buf = BytesMut::new();
        encode_string(&mut buf, "a/b").unwrap();
        assert_eq!(&buf[..], &[0x00, 0x03, b'a', b'/', b'b']);
        let mut frozen = buf.freeze();
        assert_eq!(decode_string(&mut frozen).unwrap(), "a/b");
    }

    #[test]
    fn test_string_invalid_utf8_passes() {
        let mut buf = Bytes::from_static(&[0x00, 0x02, 0xC3, 0x28]);
        assert!(decode_string(&mut buf).is_ok());
    }

    #[test]
    fn test_binary_short_read() {
        let mut buf = Bytes::from_static(&[0x00, 0x05, 1, 2]);
        assert!(decode_binary(&mut buf).is_err());
    }

    proptest! {
        #[test]
        fn prop_variable_int_round_trip(value in 0u32..=VARIABLE_BYTE_INT_MAX) {
            let mut buf = BytesMut::new();
            encode_variable_int(&mut buf, value).unwrap();
            prop_assert_eq!(buf.len(), variable_int_len(value));
            let expected_len = match value {
                0..=127 => 1,
                128..=16_383 => 2,
                16_384..=2_097_151 => 3,
                _ => 4,
            };
            prop_assert_eq!(buf.len(), expected_len);
            let mut frozen = buf.freeze();
            prop_assert_eq!(decode_variable_int(&mut frozen).unwrap(), value);
        }
    }
}
