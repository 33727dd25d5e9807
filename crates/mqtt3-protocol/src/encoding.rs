//! Primitive field encodings shared by every MQTT 3.1 packet.

use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut};

/// Largest value the remaining-length field can carry (four bytes of seven bits).
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;

/// Writes a UTF-8 string prefixed with its 16-bit big-endian length.
pub fn encode_string<B: BufMut>(buf: &mut B, value: &str) -> Result<()> {
    encode_binary(buf, value.as_bytes())
}

/// Writes raw bytes prefixed with their 16-bit big-endian length.
pub fn encode_binary<B: BufMut>(buf: &mut B, value: &[u8]) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| MqttError::StringTooLong(value.len()))?;
    buf.put_u16(len);
    buf.put_slice(value);
    Ok(())
}

pub fn decode_string<B: Buf>(buf: &mut B) -> Result<String> {
    let bytes = decode_binary(buf)?;
    String::from_utf8(bytes)
        .map_err(|e| MqttError::MalformedPacket(format!("Invalid UTF-8 string: {e}")))
}

pub fn decode_binary<B: Buf>(buf: &mut B) -> Result<Vec<u8>> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(
            "Insufficient data for string length".to_string(),
        ));
    }
    let len = usize::from(buf.get_u16());
    if buf.remaining() < len {
        return Err(MqttError::MalformedPacket(format!(
            "String length {len} exceeds remaining {}",
            buf.remaining()
        )));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

/// Encoded size of a length-prefixed string.
#[must_use]
pub fn string_len(value: &str) -> usize {
    2 + value.len()
}

pub fn encode_variable_int<B: BufMut>(buf: &mut B, value: u32) -> Result<()> {
    if value > MAX_REMAINING_LENGTH {
        return Err(MqttError::PacketTooLarge {
            size: value as usize,
            max: MAX_REMAINING_LENGTH as usize,
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
            break;
        }
    }
    Ok(())
}

pub fn decode_variable_int<B: Buf>(buf: &mut B) -> Result<u32> {
    let mut value = 0u32;
    let mut multiplier = 1u32;

    for _ in 0..4 {
        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "Truncated remaining length".to_string(),
            ));
        }
        let byte = buf.get_u8();
        value += u32::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        multiplier *= 128;
    }

    Err(MqttError::MalformedPacket(
        "Remaining length exceeds four bytes".to_string(),
    ))
}

/// Peeks a remaining-length field without consuming it.
///
/// Returns `Ok(None)` while more bytes are needed, otherwise the decoded value and
/// the number of bytes the field occupies.
pub fn peek_variable_int(bytes: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut value = 0u32;
    let mut multiplier = 1u32;

    for (index, byte) in bytes.iter().take(4).enumerate() {
        value += u32::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
        multiplier *= 128;
    }

    if bytes.len() >= 4 {
        return Err(MqttError::MalformedPacket(
            "Remaining length exceeds four bytes".to_string(),
        ));
    }
    Ok(None)
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

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;

    #[test]
    fn test_string_encode_decode() {
        let mut buf = BytesMut::new();
        encode_string(&mut buf, "MQIsdp").unwrap();
        assert_eq!(&buf[..], &[0x00, 0x06, b'M', b'Q', b'I', b's', b'd', b'p']);

        let decoded = decode_string(&mut buf).unwrap();
        assert_eq!(decoded, "MQIsdp");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_string_too_long() {
        let long = "x".repeat(70_000);
        let mut buf = BytesMut::new();
        assert_eq!(
            encode_string(&mut buf, &long),
            Err(MqttError::StringTooLong(70_000))
        );
    }

    #[test]
    fn test_decode_truncated_string() {
        let mut buf = BytesMut::from(&[0x00, 0x05, b'a', b'b'][..]);
        assert!(decode_string(&mut buf).is_err());
    }

    #[test]
    fn test_variable_int_boundaries() {
        for (value, expected) in [
            (0u32, vec![0x00]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (16_383, vec![0xFF, 0x7F]),
            (16_384, vec![0x80, 0x80, 0x01]),
            (MAX_REMAINING_LENGTH, vec![0xFF, 0xFF, 0xFF, 0x7F]),
        ] {
            let mut buf = BytesMut::new();
            encode_variable_int(&mut buf, value).unwrap();
            assert_eq!(&buf[..], &expected[..], "value {value}");
            assert_eq!(variable_int_len(value), expected.len());
        }
    }

    #[test]
    fn test_variable_int_too_large() {
        let mut buf = BytesMut::new();
        assert!(encode_variable_int(&mut buf, MAX_REMAINING_LENGTH + 1).is_err());
    }

    #[test]
    fn test_peek_variable_int_needs_more() {
        assert_eq!(peek_variable_int(&[0x80]).unwrap(), None);
        assert_eq!(peek_variable_int(&[0x80, 0x01]).unwrap(), Some((128, 2)));
        assert!(peek_variable_int(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }

    proptest! {
        #[test]
        fn prop_variable_int_decodes_what_it_encodes(value in 0u32..=MAX_REMAINING_LENGTH) {
            let mut buf = BytesMut::new();
            encode_variable_int(&mut buf, value).unwrap();
            prop_assert_eq!(buf.len(), variable_int_len(value));
            prop_assert_eq!(peek_variable_int(&buf).unwrap(), Some((value, buf.len())));
            prop_assert_eq!(decode_variable_int(&mut buf).unwrap(), value);
        }
    }
}
