//! Tunnel layer - encrypted communication channel
//!
//! Provides:
//! - Message header encoding/decoding
//! - Framed reading and writing with zlib compression and Blowfish CFB-64
//! - Liveness flags and traffic counters shared by both directions
//! - The [`Tunnel`] type produced by a completed handshake

mod channel;
mod frame;
mod state;

pub use channel::{MessageReader, MessageWriter};
pub use frame::{
    MessageHeader, COMPRESS_MINIMUM, FLAG_COMPRESSED, FLAG_ENCRYPTED, MAX_PAYLOAD_SIZE,
    MESSAGE_HEADER_SIZE, SIZE_MASK,
};
pub use state::{TunnelState, TunnelStats};

use crate::config::TunnelConfig;
use crate::crypto::NONCE_SIZE;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Which end of the handshake a tunnel plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// One encrypted channel between a client and a server
///
/// Created unestablished around a transport; the negotiator configures its
/// compression and ciphers and fills in the negotiated parameters. Never
/// reused once either direction has failed.
pub struct Tunnel<R, W> {
    pub(crate) role: Role,
    pub(crate) config: TunnelConfig,
    pub(crate) reader: MessageReader<R>,
    pub(crate) writer: MessageWriter<W>,
    pub(crate) state: Arc<TunnelState>,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) client_nonce: [u8; NONCE_SIZE],
    pub(crate) server_nonce: [u8; NONCE_SIZE],
    pub(crate) token: u32,
}

/// Tunnel over a TCP connection
pub type TcpTunnel = Tunnel<OwnedReadHalf, OwnedWriteHalf>;

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Tunnel<R, W> {
    /// Wrap a transport split into its two halves
    pub fn new(role: Role, config: TunnelConfig, read: R, write: W) -> Self {
        let state = Arc::new(TunnelState::new());
        let mut reader = MessageReader::new(read, Arc::clone(&state));
        reader.set_idle_timeout(config.idle_timeout());

        Self {
            role,
            config,
            reader,
            writer: MessageWriter::new(write, Arc::clone(&state)),
            state,
            peer: None,
            client_nonce: [0u8; NONCE_SIZE],
            server_nonce: [0u8; NONCE_SIZE],
            token: crate::session::TOKEN_NULL,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Parameters in force; the negotiated ones once the handshake is done
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<TunnelState> {
        &self.state
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Session key reuse token agreed in the handshake
    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn nonces(&self) -> (&[u8; NONCE_SIZE], &[u8; NONCE_SIZE]) {
        (&self.client_nonce, &self.server_nonce)
    }

    pub fn is_encrypted(&self) -> bool {
        self.writer.is_encrypted()
    }

    pub fn reader_mut(&mut self) -> &mut MessageReader<R> {
        &mut self.reader
    }

    pub fn writer_mut(&mut self) -> &mut MessageWriter<W> {
        &mut self.writer
    }

    /// Mark both directions dead
    pub fn close(&self) {
        self.state.close();
    }

    /// Separate the two directions for independent relay pumps
    pub fn into_split(self) -> (MessageReader<R>, MessageWriter<W>) {
        (self.reader, self.writer)
    }
}

impl TcpTunnel {
    /// Wrap a connected TCP stream
    pub fn from_tcp(role: Role, config: TunnelConfig, stream: TcpStream) -> Self {
        stream.set_nodelay(true).ok();
        let peer = stream.peer_addr().ok();
        let (read, write) = stream.into_split();

        let mut tunnel = Self::new(role, config, read, write);
        tunnel.peer = peer;
        tunnel
    }
}

impl<R, W> fmt::Debug for Tunnel<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("token", &format_args!("{:#010x}", self.token))
            .field("state", &self.state)
            .finish()
    }
}
