//! Log record framing with varint lengths and CRC32C checksums.
//!
//! Record format:
//! - len: varint (payload length)
//! - payload: bytes[len] (bincode-encoded `LogEntry`)
//! - crc32c: u32 (little-endian, over len + payload)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("Incomplete record")]
    Incomplete,
    #[error("Corrupt record header: {0}")]
    Corrupt(&'static str),
}

/// Frames `payload` into a checksummed record.
pub fn encode_record(payload: &[u8], buf: &mut BytesMut) {
    let start = buf.len();
    encode_varint(buf, payload.len() as u64);
    buf.put_slice(payload);
    let crc = crc32c::crc32c(&buf[start..]);
    buf.put_u32_le(crc);
}

/// Decodes one record from the front of `data`.
///
/// Returns the payload and the number of bytes consumed.
pub fn decode_record(data: &[u8]) -> Result<(Bytes, usize), RecordError> {
    let mut cursor = data;
    let len = usize::try_from(decode_varint(&mut cursor)?)
        .map_err(|_| RecordError::Corrupt("length exceeds address space"))?;
    match len.checked_add(4) {
        Some(need) if cursor.len() >= need => {}
        Some(_) => return Err(RecordError::Incomplete),
        None => return Err(RecordError::Corrupt("length overflows")),
    }

    let header_len = data.len() - cursor.len();
    let payload = Bytes::copy_from_slice(&cursor[..len]);
    cursor.advance(len);

    let stored_crc = cursor.get_u32_le();
    let calculated_crc = crc32c::crc32c(&data[..header_len + len]);
    if stored_crc != calculated_crc {
        return Err(RecordError::CrcMismatch {
            expected: stored_crc,
            actual: calculated_crc,
        });
    }

    Ok((payload, header_len + len + 4))
}

/// Encodes a u64 as a varint (LEB128).
fn encode_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decodes a varint (LEB128) from bytes.
fn decode_varint(data: &mut &[u8]) -> Result<u64, RecordError> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        if data.is_empty() {
            return Err(RecordError::Incomplete);
        }

        let byte = data[0];
        data.advance(1);

        if shift >= 64 {
            return Err(RecordError::Corrupt("varint overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if byte & 0x80 == 0 {
            break;
        }

        shift += 7;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_varint_encoding() {
        let test_cases = vec![0u64, 127, 128, 255, 16383, 16384, u64::MAX];

        for value in test_cases {
            let mut buf = BytesMut::new();
            encode_varint(&mut buf, value);
            let mut slice = &buf[..];
            let decoded = decode_varint(&mut slice).unwrap();
            assert_eq!(value, decoded, "varint roundtrip failed for {}", value);
        }
    }

    #[test]
    fn test_consecutive_records() {
        let mut buf = BytesMut::new();
        encode_record(b"first", &mut buf);
        encode_record(b"", &mut buf);
        encode_record(b"third", &mut buf);

        let mut offset = 0;
        let mut payloads = Vec::new();
        while offset < buf.len() {
            let (payload, used) = decode_record(&buf[offset..]).unwrap();
            payloads.push(payload);
            offset += used;
        }
        assert_eq!(payloads, vec![Bytes::from("first"), Bytes::new(), Bytes::from("third")]);
    }

    #[test]
    fn test_torn_record_is_incomplete() {
        let mut buf = BytesMut::new();
        encode_record(b"payload-bytes", &mut buf);
        for cut in 0..buf.len() {
            assert!(matches!(
                decode_record(&buf[..cut]),
                Err(RecordError::Incomplete)
            ));
        }
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut buf = BytesMut::new();
        encode_record(b"payload-bytes", &mut buf);
        buf[3] ^= 0xFF;
        assert!(matches!(
            decode_record(&buf),
            Err(RecordError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_overlong_varint_is_corrupt() {
        let mut slice = &[0xFFu8; 11][..];
        assert!(matches!(
            decode_varint(&mut slice),
            Err(RecordError::Corrupt(_))
        ));
    }

    #[test]
    fn test_huge_length_does_not_panic() {
        // Length decodes to u64::MAX - 2
        let data = [0xFD, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert!(matches!(
            decode_record(&data),
            Err(RecordError::Corrupt(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_varint_roundtrip(value: u64) {
            let mut buf = BytesMut::new();
            encode_varint(&mut buf, value);
            let mut slice = &buf[..];
            prop_assert_eq!(decode_varint(&mut slice).unwrap(), value);
            prop_assert!(slice.is_empty());
        }

        #[test]
        fn prop_single_bit_flip_detected(payload in proptest::collection::vec(any::<u8>(), 1..256), bit in 0usize..8) {
            let mut buf = BytesMut::new();
            encode_record(&payload, &mut buf);
            let target = buf.len() - 5; // last payload byte
            buf[target] ^= 1 << bit;
            prop_assert!(decode_record(&buf).is_err());
        }
    }
}
