//! Fixed-size handshake headers
//!
//! Client request (26 bytes):
//! ```text
//! +--------+--------+--------+--------+--------+--------------+
//! |udpFlag | bufSize|  comp  | tgtPort| keySize|  token (4B)  |
//! +--------+--------+--------+--------+--------+--------------+
//! |         client nonce (8B)         |   target addr (4B)    |
//! +-----------------------------------+-----------------------+
//! ```
//!
//! Server reply (26 bytes): the same layout with the mode
//! acknowledgement, accepted values (port 0 = refused), the server's token
//! and nonce, and four zero bytes of padding.

use super::HEADER_SIZE;
use crate::crypto::NONCE_SIZE;
use bytes::{Buf, BufMut, BytesMut};
use std::net::Ipv4Addr;

/// Client header `udpFlag` / server `modeAck` value for UDP mode
pub const HDR_FLAG_UDPMODE: u16 = 1;

/// Mode word for TCP mode
pub const HDR_FLAG_TCPMODE: u16 = 0;

/// Handshake request sent by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHeader {
    pub mode: u16,
    pub buffer_size: u16,
    pub compression: u16,
    pub target_port: u16,
    pub key_size: u16,
    pub token: u32,
    pub nonce: [u8; NONCE_SIZE],
    /// All-zero when the target is the tunnel server itself
    pub target_addr: Ipv4Addr,
}

impl ClientHeader {
    pub fn is_udp(&self) -> bool {
        self.mode == HDR_FLAG_UDPMODE
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u16(self.mode);
        buf.put_u16(self.buffer_size);
        buf.put_u16(self.compression);
        buf.put_u16(self.target_port);
        buf.put_u16(self.key_size);
        buf.put_u32(self.token);
        buf.put_slice(&self.nonce);
        buf.put_slice(&self.target_addr.octets());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        let mut reader = &buf[..];
        let mode = reader.get_u16();
        let buffer_size = reader.get_u16();
        let compression = reader.get_u16();
        let target_port = reader.get_u16();
        let key_size = reader.get_u16();
        let token = reader.get_u32();
        let mut nonce = [0u8; NONCE_SIZE];
        reader.copy_to_slice(&mut nonce);
        let mut addr = [0u8; 4];
        reader.copy_to_slice(&mut addr);

        Self {
            mode,
            buffer_size,
            compression,
            target_port,
            key_size,
            token,
            nonce,
            target_addr: Ipv4Addr::from(addr),
        }
    }
}

/// Handshake reply sent by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHeader {
    pub mode: u16,
    pub buffer_size: u16,
    pub compression: u16,
    /// Accepted target port, 0 when refused
    pub port: u16,
    pub key_size: u16,
    pub token: u32,
    pub nonce: [u8; NONCE_SIZE],
}

impl ServerHeader {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u16(self.mode);
        buf.put_u16(self.buffer_size);
        buf.put_u16(self.compression);
        buf.put_u16(self.port);
        buf.put_u16(self.key_size);
        buf.put_u32(self.token);
        buf.put_slice(&self.nonce);
        buf.put_bytes(0, 4);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        let mut reader = &buf[..];
        let mode = reader.get_u16();
        let buffer_size = reader.get_u16();
        let compression = reader.get_u16();
        let port = reader.get_u16();
        let key_size = reader.get_u16();
        let token = reader.get_u32();
        let mut nonce = [0u8; NONCE_SIZE];
        reader.copy_to_slice(&mut nonce);

        Self {
            mode,
            buffer_size,
            compression,
            port,
            key_size,
            token,
            nonce,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_header_layout() {
        let header = ClientHeader {
            mode: HDR_FLAG_UDPMODE,
            buffer_size: 8192,
            compression: 6,
            target_port: 23,
            key_size: 128,
            token: 0xFFFF_FFFF,
            nonce: [1, 2, 3, 4, 5, 6, 7, 8],
            target_addr: Ipv4Addr::new(10, 0, 0, 1),
        };

        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(
            &bytes[..],
            &[
                0x00, 0x01, 0x20, 0x00, 0x00, 0x06, 0x00, 0x17, 0x00, 0x80, 0xff, 0xff, 0xff,
                0xff, 1, 2, 3, 4, 5, 6, 7, 8, 10, 0, 0, 1
            ]
        );

        let raw: [u8; HEADER_SIZE] = bytes[..].try_into().unwrap();
        let decoded = ClientHeader::decode(&raw);
        assert_eq!(decoded, header);
        assert!(decoded.is_udp());
    }

    #[test]
    fn test_server_header_padding() {
        let header = ServerHeader {
            mode: HDR_FLAG_TCPMODE,
            buffer_size: 4096,
            compression: 0,
            port: 0,
            key_size: 256,
            token: 0x1234_5678,
            nonce: [9; 8],
        };

        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[22..], &[0, 0, 0, 0]);
        assert_eq!(&bytes[10..14], &[0x12, 0x34, 0x56, 0x78]);

        let raw: [u8; HEADER_SIZE] = bytes[..].try_into().unwrap();
        assert_eq!(ServerHeader::decode(&raw), header);
    }
}
