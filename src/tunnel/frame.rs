//! Message header encoding/decoding
//!
//! Message format:
//! ```text
//! +-+-+----------------------------+
//! |E|C|      Payload size (14b)    |
//! +-+-+----------------------------+
//! |   Payload (compressed and/or   |
//! |   encrypted, `size` bytes)     |
//! +--------------------------------+
//! ```
//!
//! `E` marks a Blowfish CFB-64 encrypted payload and `C` a zlib
//! compressed one. Compression is applied before encryption.

use bytes::{Buf, BufMut, BytesMut};

/// Header size in bytes
pub const MESSAGE_HEADER_SIZE: usize = 2;

/// Payload is zlib compressed
pub const FLAG_COMPRESSED: u16 = 0x4000;

/// Payload is encrypted
pub const FLAG_ENCRYPTED: u16 = 0x8000;

/// Bits holding the payload size
pub const SIZE_MASK: u16 = 0x3fff;

/// Largest payload a header can describe
pub const MAX_PAYLOAD_SIZE: usize = SIZE_MASK as usize;

/// Payloads this size or smaller are never compressed
pub const COMPRESS_MINIMUM: usize = 32;

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Size of the payload as transmitted
    pub size: u16,
    pub compressed: bool,
    pub encrypted: bool,
}

impl MessageHeader {
    pub fn new(size: u16, compressed: bool, encrypted: bool) -> Self {
        Self {
            size: size & SIZE_MASK,
            compressed,
            encrypted,
        }
    }

    /// Header as a big-endian 16-bit word
    pub fn to_word(self) -> u16 {
        let mut word = self.size & SIZE_MASK;
        if self.compressed {
            word |= FLAG_COMPRESSED;
        }
        if self.encrypted {
            word |= FLAG_ENCRYPTED;
        }
        word
    }

    pub fn from_word(word: u16) -> Self {
        Self {
            size: word & SIZE_MASK,
            compressed: word & FLAG_COMPRESSED != 0,
            encrypted: word & FLAG_ENCRYPTED != 0,
        }
    }

    /// Append the header to `buf`
    pub fn encode(self, buf: &mut BytesMut) {
        buf.put_u16(self.to_word());
    }

    /// Decode a header from the first two bytes of `buf`
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return None;
        }
        Some(Self::from_word(buf.get_u16()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_flags() {
        let header = MessageHeader::new(1000, true, true);
        assert_eq!(header.to_word(), 0xC000 | 1000);

        let plain = MessageHeader::new(MAX_PAYLOAD_SIZE as u16, false, false);
        assert_eq!(plain.to_word(), 0x3fff);
    }

    #[test]
    fn test_header_wire_format() {
        let mut buf = BytesMut::new();
        MessageHeader::new(0x0123, false, true).encode(&mut buf);
        assert_eq!(&buf[..], &[0x81, 0x23]);

        let decoded = MessageHeader::decode(&buf).unwrap();
        assert_eq!(decoded.size, 0x0123);
        assert!(decoded.encrypted);
        assert!(!decoded.compressed);

        assert!(MessageHeader::decode(&[0x40]).is_none());
    }
}
