//! QUIC-style variable-length integer encoding (RFC 9000 §16).
//!
//! The top two bits of the first byte select the encoded length (1, 2, 4 or
//! 8 bytes), leaving 6/14/30/62 usable bits respectively. Capsule type,
//! capsule length, and request IDs on the wire all use this encoding.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, TunnelError};

/// Largest value representable in a 62-bit varint.
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Encode `v` using the shortest valid varint form and append it to `out`.
pub fn encode(v: u64, out: &mut Vec<u8>) {
    if v < (1 << 6) {
        out.push(v as u8);
    } else if v < (1 << 14) {
        let n = (v as u16) | 0x4000;
        out.extend_from_slice(&n.to_be_bytes());
    } else if v < (1 << 30) {
        let n = (v as u32) | 0x8000_0000;
        out.extend_from_slice(&n.to_be_bytes());
    } else {
        debug_assert!(v <= MAX_VARINT, "varint value exceeds 62 bits");
        let n = v | 0xC000_0000_0000_0000;
        out.extend_from_slice(&n.to_be_bytes());
    }
}

/// Read one varint from an in-memory buffer, returning the value and the
/// number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(u64, usize)> {
    let first = *buf
        .first()
        .ok_or_else(|| TunnelError::Decode("varint: empty buffer".into()))?;
    let len = 1usize << (first >> 6);
    if buf.len() < len {
        return Err(TunnelError::Decode("varint: short read".into()));
    }
    let mut value = (first & 0x3F) as u64;
    for &b in &buf[1..len] {
        value = (value << 8) | b as u64;
    }
    Ok((value, len))
}

/// Read one varint from an async byte stream.
pub async fn read_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64> {
    let first = r.read_u8().await?;
    let len = 1usize << (first >> 6);
    let mut value = (first & 0x3F) as u64;
    for _ in 1..len {
        let b = r.read_u8().await?;
        value = (value << 8) | b as u64;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: u64) {
        let mut buf = Vec::new();
        encode(v, &mut buf);
        let (decoded, consumed) = decode(&buf).unwrap();
        assert_eq!(decoded, v);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn roundtrips_across_all_length_tiers() {
        for v in [0u64, 1, 63, 64, 16383, 16384, 1 << 29, (1 << 30) - 1, 1 << 30, MAX_VARINT] {
            roundtrip(v);
        }
    }

    #[test]
    fn encodes_minimal_form() {
        let mut buf = Vec::new();
        encode(37, &mut buf);
        assert_eq!(buf, vec![37]);

        let mut buf = Vec::new();
        encode(15293, &mut buf);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let err = decode(&[0x40]).unwrap_err();
        assert!(matches!(err, TunnelError::Decode(_)));
    }

    #[tokio::test]
    async fn read_async_matches_sync_decode() {
        let mut buf = Vec::new();
        encode(0x1234_5678, &mut buf);
        let mut cursor = std::io::Cursor::new(buf.clone());
        let value = read_async(&mut cursor).await.unwrap();
        let (expected, _) = decode(&buf).unwrap();
        assert_eq!(value, expected);
    }
}
