//! Message channel: a byte stream turned into discrete, optionally
//! compressed and encrypted messages
//!
//! The reading and writing halves are separate so the two relay pumps of a
//! tunnel can own one each. They share a [`TunnelState`] for liveness.

use super::frame::{
    MessageHeader, COMPRESS_MINIMUM, MAX_PAYLOAD_SIZE, MESSAGE_HEADER_SIZE,
};
use super::state::TunnelState;
use crate::crypto::{Decryptor, Encryptor};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Compress `data` as a self-contained zlib stream
fn deflate(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len()), Compression::new(level));
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::Protocol(format!("compression failed: {}", e)))
}

/// Decompress one zlib stream, refusing output larger than `limit`
fn inflate(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(limit.min(data.len() * 4));
    ZlibDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| Error::Protocol(format!("data format error uncompressing message: {}", e)))?;

    if out.is_empty() {
        return Err(Error::Protocol("compressed message inflated to nothing".to_string()));
    }
    if out.len() > limit {
        return Err(Error::Protocol(format!(
            "uncompressed message larger than {} bytes",
            limit
        )));
    }
    Ok(out)
}

/// Reading half of a message channel
pub struct MessageReader<R> {
    io: R,
    decryptor: Option<Decryptor>,
    idle_timeout: Option<Duration>,
    state: Arc<TunnelState>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(io: R, state: Arc<TunnelState>) -> Self {
        Self {
            io,
            decryptor: None,
            idle_timeout: None,
            state,
        }
    }

    /// Fail reads that see no data for `timeout`
    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.idle_timeout = timeout;
    }

    pub fn set_decryptor(&mut self, decryptor: Decryptor) {
        self.decryptor = Some(decryptor);
    }

    pub fn is_encrypted(&self) -> bool {
        self.decryptor.is_some()
    }

    pub fn state(&self) -> &Arc<TunnelState> {
        &self.state
    }

    /// Read until `buf` is full or the stream ends, returning the count read
    async fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let read = self.io.read(&mut buf[filled..]);
            let n = match self.idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, read).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.state.mark_unreadable();
                        return Err(Error::Timeout(
                            "connection timed out while reading data".to_string(),
                        ));
                    }
                },
                None => read.await,
            };

            match n {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    self.state.mark_unreadable();
                    return Err(Error::Network(format!("read failed: {}", e)));
                }
            }
        }
        Ok(filled)
    }

    /// Read exactly `buf.len()` unframed bytes (handshake headers)
    pub async fn read_raw(&mut self, buf: &mut [u8]) -> Result<()> {
        let n = self.fill(buf).await?;
        if n < buf.len() {
            self.state.mark_unreadable();
            return Err(Error::Network(
                "EOF encountered while reading protocol header".to_string(),
            ));
        }
        Ok(())
    }

    /// Read the next message
    ///
    /// Returns `None` at end of stream, or once the tunnel is no longer
    /// readable.
    pub async fn read_message(&mut self) -> Result<Option<Bytes>> {
        if !self.state.is_readable() {
            return Ok(None);
        }

        let mut header = [0u8; MESSAGE_HEADER_SIZE];
        match self.fill(&mut header).await? {
            0 => return Ok(None),
            MESSAGE_HEADER_SIZE => {}
            _ => {
                self.state.mark_unreadable();
                return Err(Error::Network("EOF encountered reading message header".to_string()));
            }
        }

        let header = MessageHeader::from_word(u16::from_be_bytes(header));
        let size = header.size as usize;

        let mut body = BytesMut::zeroed(size);
        if self.fill(&mut body).await? < size {
            self.state.mark_unreadable();
            return Err(Error::Network(format!(
                "EOF encountered reading message of size {}",
                size
            )));
        }

        if header.encrypted {
            let decryptor = self.decryptor.as_mut().ok_or_else(|| {
                Error::Protocol(
                    "encrypted message received without an encryption context".to_string(),
                )
            })?;
            decryptor.apply(&mut body);
        }

        let payload = if header.compressed {
            match inflate(&body, MAX_PAYLOAD_SIZE) {
                Ok(data) => Bytes::from(data),
                Err(e) => {
                    self.state.mark_unreadable();
                    return Err(e);
                }
            }
        } else {
            body.freeze()
        };

        trace!(
            "Read message: {} bytes on the wire, {} bytes payload",
            size,
            payload.len()
        );
        self.state.record_in(size, payload.len());
        Ok(Some(payload))
    }

    /// Read a NUL-terminated ASCII string message
    pub async fn read_string(&mut self) -> Result<String> {
        let message = self
            .read_message()
            .await?
            .ok_or_else(|| Error::Network("EOF encountered while reading string".to_string()))?;

        let text = match message.split_last() {
            Some((0, text)) => text,
            _ => &message[..],
        };

        String::from_utf8(text.to_vec())
            .map_err(|_| Error::Protocol("string message is not ASCII".to_string()))
    }

    /// Stop reading; later reads report end of stream
    pub fn shutdown(&self) {
        self.state.mark_unreadable();
    }
}

/// Writing half of a message channel
pub struct MessageWriter<W> {
    io: W,
    encryptor: Option<Encryptor>,
    compression_level: u32,
    state: Arc<TunnelState>,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(io: W, state: Arc<TunnelState>) -> Self {
        Self {
            io,
            encryptor: None,
            compression_level: 0,
            state,
        }
    }

    /// zlib level for outgoing messages, 0 for none
    pub fn set_compression_level(&mut self, level: u32) {
        self.compression_level = level.min(9);
    }

    pub fn set_encryptor(&mut self, encryptor: Encryptor) {
        self.encryptor = Some(encryptor);
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryptor.is_some()
    }

    pub fn state(&self) -> &Arc<TunnelState> {
        &self.state
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.state.is_writable() {
            return Err(Error::Network(
                "previous unrecoverable error prohibits writing".to_string(),
            ));
        }

        let result = match self.io.write_all(data).await {
            Ok(()) => self.io.flush().await,
            Err(e) => Err(e),
        };

        result.map_err(|e| {
            self.state.mark_unwritable();
            Error::Network(format!("write failed: {}", e))
        })
    }

    /// Write unframed bytes (handshake headers)
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.send(data).await
    }

    /// Write one message, compressing and encrypting as configured
    pub async fn write_message(&mut self, payload: &[u8]) -> Result<()> {
        if !self.state.is_writable() {
            return Err(Error::Network(
                "previous unrecoverable error prohibits writing".to_string(),
            ));
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::Protocol(format!(
                "message of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let mut compressed = false;
        let mut body = if self.compression_level > 0 && payload.len() > COMPRESS_MINIMUM {
            let packed = deflate(payload, self.compression_level)?;
            if packed.len() < payload.len() {
                compressed = true;
                packed
            } else {
                payload.to_vec()
            }
        } else {
            payload.to_vec()
        };

        let encrypted = match self.encryptor.as_mut() {
            Some(encryptor) => {
                encryptor.apply(&mut body);
                true
            }
            None => false,
        };

        let mut frame = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + body.len());
        MessageHeader::new(body.len() as u16, compressed, encrypted).encode(&mut frame);
        frame.extend_from_slice(&body);

        self.send(&frame).await?;

        trace!(
            "Wrote message: {} bytes payload, {} bytes on the wire",
            payload.len(),
            body.len()
        );
        self.state.record_out(body.len(), payload.len());
        Ok(())
    }

    /// Write `data` as one message per `chunk_size` bytes
    pub async fn write_chunked(&mut self, data: &[u8], chunk_size: usize) -> Result<()> {
        let chunk_size = chunk_size.clamp(1, MAX_PAYLOAD_SIZE);
        for chunk in data.chunks(chunk_size) {
            self.write_message(chunk).await?;
        }
        Ok(())
    }

    /// Write `text` as a NUL-terminated ASCII string message
    pub async fn write_string(&mut self, text: &str) -> Result<()> {
        let mut message = Vec::with_capacity(text.len() + 1);
        message.extend_from_slice(text.as_bytes());
        message.push(0);
        self.write_message(&message).await
    }

    /// Half-close: the peer sees end of stream, reading continues
    pub async fn shutdown(&mut self) -> Result<()> {
        self.state.mark_unwritable();
        self.io
            .shutdown()
            .await
            .map_err(|e| Error::Network(format!("shutdown failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cipher_pair;
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

    const KEY: &[u8] = b"0123456789abcdef";

    type Pair = (
        MessageWriter<WriteHalf<DuplexStream>>,
        MessageReader<ReadHalf<DuplexStream>>,
    );

    fn channel(compression: u32, encrypted: bool) -> Pair {
        let (a, b) = duplex(64 * 1024);
        let (_, a_write) = tokio::io::split(a);
        let (b_read, _) = tokio::io::split(b);

        let mut writer = MessageWriter::new(a_write, Arc::new(TunnelState::new()));
        let mut reader = MessageReader::new(b_read, Arc::new(TunnelState::new()));
        writer.set_compression_level(compression);

        if encrypted {
            let (enc, _) = cipher_pair(KEY).unwrap();
            let (_, dec) = cipher_pair(KEY).unwrap();
            writer.set_encryptor(enc);
            reader.set_decryptor(dec);
        }

        (writer, reader)
    }

    #[tokio::test]
    async fn test_round_trip_all_modes() {
        let payloads: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"short".to_vec(),
            vec![b'z'; 33],
            (0..=255u8).cycle().take(5000).collect(),
            vec![7u8; MAX_PAYLOAD_SIZE],
        ];

        for (compression, encrypted) in [(0, false), (6, false), (0, true), (9, true)] {
            let (mut writer, mut reader) = channel(compression, encrypted);
            for payload in &payloads {
                writer.write_message(payload).await.unwrap();
                let got = reader.read_message().await.unwrap().unwrap();
                assert_eq!(&got[..], &payload[..], "mode ({}, {})", compression, encrypted);
            }
        }
    }

    #[tokio::test]
    async fn test_compression_only_when_smaller() {
        let (mut writer, mut reader) = channel(6, false);

        writer.write_message(&[b'a'; 1000]).await.unwrap();
        writer.write_message(&[b'b'; 32]).await.unwrap();
        let noise: Vec<u8> = (0..200).map(|i| (i * 73 % 251) as u8).collect();
        writer.write_message(&noise).await.unwrap();

        let stats = writer.state().stats();
        assert_eq!(stats.messages_out, 3);
        // 1000 repeated bytes shrink; 32 bytes are below the threshold
        assert!(stats.raw_bytes_out < 1000 + 32 + 200);

        assert_eq!(reader.read_message().await.unwrap().unwrap().len(), 1000);
        assert_eq!(reader.read_message().await.unwrap().unwrap().len(), 32);
        assert_eq!(reader.read_message().await.unwrap().unwrap(), noise);
    }

    #[tokio::test]
    async fn test_encrypted_without_context_is_protocol_error() {
        let (a, b) = duplex(1024);
        let (_, a_write) = tokio::io::split(a);
        let (b_read, _) = tokio::io::split(b);

        let mut writer = MessageWriter::new(a_write, Arc::new(TunnelState::new()));
        let (enc, _) = cipher_pair(KEY).unwrap();
        writer.set_encryptor(enc);
        let mut reader = MessageReader::new(b_read, Arc::new(TunnelState::new()));

        writer.write_message(b"secret").await.unwrap();
        assert!(matches!(reader.read_message().await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_eof_handling() {
        let (a, b) = duplex(1024);
        let (b_read, _) = tokio::io::split(b);
        let mut reader = MessageReader::new(b_read, Arc::new(TunnelState::new()));

        let (_, mut a_write) = tokio::io::split(a);
        // Header promises 10 bytes, only 3 arrive
        a_write.write_all(&[0x00, 0x0a, 1, 2, 3]).await.unwrap();
        a_write.shutdown().await.unwrap();
        drop(a_write);

        assert!(matches!(reader.read_message().await, Err(Error::Network(_))));
        assert!(!reader.state().is_readable());
        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clean_eof() {
        let (mut writer, mut reader) = channel(0, false);
        writer.write_message(b"last").await.unwrap();
        writer.shutdown().await.unwrap();

        assert_eq!(&reader.read_message().await.unwrap().unwrap()[..], b"last");
        assert!(reader.read_message().await.unwrap().is_none());
        assert!(writer.write_message(b"more").await.is_err());
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (_writer, mut reader) = channel(0, false);
        reader.set_idle_timeout(Some(Duration::from_millis(50)));

        assert!(matches!(reader.read_message().await, Err(Error::Timeout(_))));
        assert!(!reader.state().is_readable());
    }

    #[tokio::test]
    async fn test_strings_and_chunking() {
        let (mut writer, mut reader) = channel(0, true);

        writer.write_string("f488fd58").await.unwrap();
        assert_eq!(reader.read_string().await.unwrap(), "f488fd58");

        writer.write_chunked(&[1u8; 25], 10).await.unwrap();
        let sizes: Vec<usize> = [
            reader.read_message().await.unwrap().unwrap(),
            reader.read_message().await.unwrap().unwrap(),
            reader.read_message().await.unwrap().unwrap(),
        ]
        .iter()
        .map(|m| m.len())
        .collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (mut writer, _reader) = channel(0, false);
        let result = writer.write_message(&vec![0u8; MAX_PAYLOAD_SIZE + 1]).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}
