//! # ZBD Tunnel
//!
//! A Zebedee-compatible secure tunnel engine. An application TCP connection
//! or UDP flow is carried through a compressed, Blowfish-encrypted,
//! point-to-point channel between a client and a server, and the server
//! relays the traffic to the real target host and port.
//!
//! ## Features
//!
//! - **Wire compatible** with Zebedee protocol version `0x0201`
//! - **Diffie-Hellman key agreement** with per-connection nonces
//! - **Session key reuse** through server-issued tokens
//! - **zlib compression** of every message larger than 32 bytes
//! - **Address and port validation** for peers, targets and identities
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Relay Layer                      │
//! │    (TCP/UDP listeners, session table, relay pumps)   │
//! ├─────────────────────────────────────────────────────┤
//! │                   Protocol Layer                     │
//! │   (version + header exchange, DH, challenge-reply)   │
//! ├─────────────────────────────────────────────────────┤
//! │                    Tunnel Layer                      │
//! │      (message framing, zlib, Blowfish CFB-64)        │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │                  (TCP sockets, IPv4)                 │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod address;
pub mod config;
pub mod crypto;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod tunnel;
pub mod validation;

pub use config::{Config, TunnelConfig};
pub use protocol::{HandshakeState, TunnelTemplate};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default server port for TCP tunnels
pub const DEFAULT_TCP_PORT: u16 = 0x2EBD;

/// Default server port for UDP tunnels
pub const DEFAULT_UDP_PORT: u16 = 0x2BDE;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed configuration value or specification string
    #[error("Parse error: {0}")]
    Parse(String),

    /// I/O failure on a socket or pipe
    #[error("Network error: {0}")]
    Network(String),

    /// Idle or connect timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed or incompatible peer data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Peer, target or identity rejected
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration file could not be read, parsed or written
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for I/O failures, including timeouts
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }

    /// True for idle and connect timeouts
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Error::Timeout(e.to_string())
            }
            _ => Error::Network(e.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout("operation timed out".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let timeout: Error = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(timeout.is_timeout());
        assert!(timeout.is_network());

        let reset: Error = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "gone").into();
        assert!(matches!(reset, Error::Network(_)));
        assert!(!reset.is_timeout());
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(DEFAULT_TCP_PORT, 11965);
        assert_eq!(DEFAULT_UDP_PORT, 11230);
    }
}
