//! Protocol definitions, constants and the handshake negotiators
//!
//! Handshake outline (both roles):
//!
//! ```text
//! VersionExchange -> HeaderExchange -> KeyEstablishment
//!     -> ChallengeResponse -> Established
//! ```
//!
//! Key establishment is either a full Diffie-Hellman exchange or, when the
//! client offers a token whose secret both sides still hold, a reuse of
//! that secret with fresh nonces.

mod client;
mod header;
mod server;
mod template;

pub use client::{ClientNegotiator, ClientTarget};
pub use header::{ClientHeader, ServerHeader, HDR_FLAG_TCPMODE, HDR_FLAG_UDPMODE};
pub use server::{ServerNegotiator, TargetConnection};
pub use template::TunnelTemplate;

use crate::crypto::{
    blowfish_key, challenge_answer, cipher_pair, generate_challenge, generate_session_key,
    CHALLENGE_SIZE,
};
use crate::tunnel::Tunnel;
use crate::{Error, Result};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Protocol version spoken by this implementation
pub const PROTOCOL_VERSION: u16 = 0x0201;

/// Size of the client and server handshake headers
pub const HEADER_SIZE: usize = 26;

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    VersionExchange,
    HeaderExchange,
    KeyEstablishment,
    ChallengeResponse,
    Established,
    /// Peer or target rejected
    Refused,
    ProtocolError,
    NetworkError,
    Timeout,
}

impl HandshakeState {
    /// Terminal state for a failed handshake
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Validation(_) => HandshakeState::Refused,
            Error::Timeout(_) => HandshakeState::Timeout,
            Error::Network(_) => HandshakeState::NetworkError,
            Error::Protocol(_) | Error::Parse(_) | Error::Config(_) => {
                HandshakeState::ProtocolError
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HandshakeState::Established
                | HandshakeState::Refused
                | HandshakeState::ProtocolError
                | HandshakeState::NetworkError
                | HandshakeState::Timeout
        )
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::VersionExchange => "VERSION_EXCHANGE",
            HandshakeState::HeaderExchange => "HEADER_EXCHANGE",
            HandshakeState::KeyEstablishment => "KEY_ESTABLISHMENT",
            HandshakeState::ChallengeResponse => "CHALLENGE_RESPONSE",
            HandshakeState::Established => "ESTABLISHED",
            HandshakeState::Refused => "REFUSED",
            HandshakeState::ProtocolError => "PROTOCOL_ERROR",
            HandshakeState::NetworkError => "NETWORK_ERROR",
            HandshakeState::Timeout => "TIMEOUT",
        };
        f.write_str(name)
    }
}

/// Protocol-level view of a malformed peer value
fn peer_value(error: Error) -> Error {
    match error {
        Error::Parse(msg) => Error::Protocol(msg),
        other => other,
    }
}

/// Key both directions of `tunnel` from a shared secret and the nonces
fn setup_ciphers<R, W>(tunnel: &mut Tunnel<R, W>, shared_secret: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let key_size = tunnel.config.key_size();
    let session = generate_session_key(
        &tunnel.client_nonce,
        &tunnel.server_nonce,
        shared_secret,
        key_size,
    );
    let key = blowfish_key(&session, key_size);
    debug!("Setting up Blowfish with a {} bit key", key_size);

    let (encryptor, decryptor) = cipher_pair(&key)?;
    tunnel.writer.set_encryptor(encryptor);
    tunnel.reader.set_decryptor(decryptor);
    Ok(())
}

/// Read the peer's challenge and send back the answer
async fn answer_challenge<R, W>(tunnel: &mut Tunnel<R, W>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let challenge = tunnel
        .reader
        .read_message()
        .await?
        .ok_or_else(|| Error::Network("EOF encountered while reading challenge".to_string()))?;

    if challenge.len() != CHALLENGE_SIZE {
        return Err(Error::Protocol(format!(
            "challenge has {} bytes, expected {}",
            challenge.len(),
            CHALLENGE_SIZE
        )));
    }

    tunnel.writer.write_message(&challenge_answer(&challenge)).await
}

/// Send a fresh challenge and check the peer's answer
async fn issue_challenge<R, W>(tunnel: &mut Tunnel<R, W>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let challenge = generate_challenge();
    tunnel.writer.write_message(&challenge).await?;

    let reply = tunnel
        .reader
        .read_message()
        .await?
        .ok_or_else(|| Error::Network("EOF encountered while reading challenge reply".to_string()))?;

    if reply[..] != challenge_answer(&challenge)[..] {
        return Err(Error::Protocol(
            "challenge-response failed: peer does not hold the session key".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_error() {
        assert_eq!(
            HandshakeState::from_error(&Error::Validation("no".into())),
            HandshakeState::Refused
        );
        assert_eq!(
            HandshakeState::from_error(&Error::Timeout("slow".into())),
            HandshakeState::Timeout
        );
        assert_eq!(
            HandshakeState::from_error(&Error::Network("reset".into())),
            HandshakeState::NetworkError
        );
        assert_eq!(
            HandshakeState::from_error(&Error::Parse("bad hex".into())),
            HandshakeState::ProtocolError
        );
        assert!(!HandshakeState::HeaderExchange.is_terminal());
        assert_eq!(HandshakeState::Established.to_string(), "ESTABLISHED");
    }

    #[tokio::test]
    async fn test_challenge_round() {
        let (a, b) = tokio::io::duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let config = crate::TunnelConfig::default();
        let mut challenger = Tunnel::new(crate::tunnel::Role::Server, config.clone(), a_read, a_write);
        let mut responder = Tunnel::new(crate::tunnel::Role::Client, config, b_read, b_write);

        for tunnel in [&mut challenger, &mut responder] {
            setup_ciphers(tunnel, "00aa11bb22cc").unwrap();
        }

        let (issued, answered) =
            tokio::join!(issue_challenge(&mut challenger), answer_challenge(&mut responder));
        issued.unwrap();
        answered.unwrap();
    }

    #[tokio::test]
    async fn test_challenge_with_wrong_key_fails() {
        let (a, b) = tokio::io::duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let config = crate::TunnelConfig::default();
        let mut challenger = Tunnel::new(crate::tunnel::Role::Server, config.clone(), a_read, a_write);
        let mut responder = Tunnel::new(crate::tunnel::Role::Client, config, b_read, b_write);

        setup_ciphers(&mut challenger, "00aa11bb22cc").unwrap();
        setup_ciphers(&mut responder, "ffffffffffff").unwrap();

        let (issued, _) =
            tokio::join!(issue_challenge(&mut challenger), answer_challenge(&mut responder));
        assert!(matches!(issued, Err(Error::Protocol(_))));
    }
}
