//! Peer, target and identity validation
//!
//! Every handshake consults a [`Validator`]:
//! - before any protocol byte, on the peer's socket address
//! - on the server, on the target the client asked for
//! - after the DH parameters arrive, on the peer's public key identity

use crate::address::{resolve_ipv4, system_services, AddressSpec};
use crate::crypto::identity_hash;
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Access checks applied during connection setup
#[async_trait]
pub trait Validator: Send + Sync + fmt::Debug {
    /// Accept the peer's public key, given the DH parameters it was made with
    async fn validate_identity(&self, generator: &str, modulus: &str, public_key: &str) -> bool;

    /// Accept a connection from (or to) `peer`
    async fn validate_peer(&self, peer: SocketAddr) -> bool;

    /// Accept relaying to `host:port`
    async fn validate_target(&self, host: &str, port: u16, udp: bool) -> bool;
}

/// Validator that accepts everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllValidator;

#[async_trait]
impl Validator for AcceptAllValidator {
    async fn validate_identity(&self, _: &str, _: &str, _: &str) -> bool {
        true
    }

    async fn validate_peer(&self, _: SocketAddr) -> bool {
        true
    }

    async fn validate_target(&self, _: &str, _: u16, _: bool) -> bool {
        true
    }
}

/// Validator driven by identity files, peer specifications and target
/// specifications
///
/// An empty list accepts unconditionally.
#[derive(Debug, Clone, Default)]
pub struct ListValidator {
    id_files: Vec<PathBuf>,
    peers: Vec<AddressSpec>,
    targets: Vec<AddressSpec>,
}

impl ListValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file of accepted identities, one per line
    pub fn add_id_file(&mut self, path: impl Into<PathBuf>) {
        self.id_files.push(path.into());
    }

    /// Add a peer specification (`host[/mask][:ports]` or `*`)
    pub fn add_peer(&mut self, spec: &str) -> Result<()> {
        self.peers
            .extend(AddressSpec::parse(spec, system_services())?);
        Ok(())
    }

    /// Add a target specification (`host[/mask][:ports]` or `*`)
    pub fn add_target(&mut self, spec: &str) -> Result<()> {
        self.targets
            .extend(AddressSpec::parse(spec, system_services())?);
        Ok(())
    }

    /// Host of the most recently added target
    pub fn default_target(&self) -> Option<String> {
        self.targets.last().map(|spec| spec.host.clone())
    }

    pub fn peers(&self) -> &[AddressSpec] {
        &self.peers
    }

    pub fn targets(&self) -> &[AddressSpec] {
        &self.targets
    }

    async fn file_has_identity(path: &PathBuf, id: &str) -> bool {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => content.lines().any(|line| line.starts_with(id)),
            Err(e) => {
                debug!("Can't read identity file {}: {}", path.display(), e);
                false
            }
        }
    }
}

#[async_trait]
impl Validator for ListValidator {
    async fn validate_identity(&self, generator: &str, modulus: &str, public_key: &str) -> bool {
        if self.id_files.is_empty() {
            return true;
        }

        let id = identity_hash(generator, modulus, public_key);
        for path in &self.id_files {
            if Self::file_has_identity(path, &id).await {
                debug!("Identity {} found in {}", id, path.display());
                return true;
            }
        }

        warn!("Peer identity {} is not authorized", id);
        false
    }

    async fn validate_peer(&self, peer: SocketAddr) -> bool {
        if self.peers.is_empty() {
            return true;
        }

        let addr = match peer.ip() {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => v4,
                None => {
                    warn!("Rejecting IPv6 peer {}", peer);
                    return false;
                }
            },
        };

        for spec in &self.peers {
            if spec.matches(&[addr], peer.port()).await {
                return true;
            }
        }

        warn!("Peer {} is not authorized", peer);
        false
    }

    async fn validate_target(&self, host: &str, port: u16, udp: bool) -> bool {
        if self.targets.is_empty() {
            return true;
        }

        let addrs = match resolve_ipv4(host).await {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("Target {} rejected: {}", host, e);
                return false;
            }
        };

        for spec in &self.targets {
            if spec.matches(&addrs, port).await {
                return true;
            }
        }

        warn!(
            "Target {}:{} ({}) is not allowed",
            host,
            port,
            if udp { "udp" } else { "tcp" }
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{public_key, DEFAULT_MODULUS};
    use std::io::Write;

    const PRIVATE: &str = "0123456789abcdef0123456789abcdef01234567";
    const IDENTITY: &str = "8036c208b6428a4f78c3d2234a8c0ea82131cd57";

    #[tokio::test]
    async fn test_empty_lists_accept_everything() {
        let validator = ListValidator::new();
        assert!(validator.validate_peer("203.0.113.7:4000".parse().unwrap()).await);
        assert!(validator.validate_target("198.51.100.1", 25, false).await);
        assert!(validator.validate_identity("", "", "abcd").await);
    }

    #[tokio::test]
    async fn test_target_list() {
        let mut validator = ListValidator::new();
        validator.add_target("127.0.0.1:2000-2999").unwrap();
        validator.add_target("10.1.0.0/16").unwrap();

        assert!(validator.validate_target("127.0.0.1", 2323, false).await);
        assert!(!validator.validate_target("127.0.0.1", 3000, false).await);
        assert!(validator.validate_target("10.1.200.3", 80, true).await);
        assert!(!validator.validate_target("10.2.0.1", 80, false).await);
        assert_eq!(validator.default_target().as_deref(), Some("10.1.0.0"));
    }

    #[tokio::test]
    async fn test_peer_list() {
        let mut validator = ListValidator::new();
        validator.add_peer("192.168.1.0/24").unwrap();

        assert!(validator.validate_peer("192.168.1.77:5555".parse().unwrap()).await);
        assert!(!validator.validate_peer("192.168.2.1:5555".parse().unwrap()).await);

        validator.add_peer("*").unwrap();
        assert!(validator.validate_peer("8.8.8.8:53".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn test_identity_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0000000000000000000000000000000000000000 someone-else").unwrap();
        writeln!(file, "{} trusted-peer", IDENTITY).unwrap();

        let mut validator = ListValidator::new();
        validator.add_id_file("/nonexistent/identities");
        validator.add_id_file(file.path());

        let public = public_key("", "", PRIVATE).unwrap();
        assert!(validator.validate_identity("", "", &public).await);
        assert!(validator.validate_identity("2", DEFAULT_MODULUS, &public).await);
        assert!(!validator.validate_identity("", "", "1234").await);
    }

    #[tokio::test]
    async fn test_accept_all() {
        let validator = AcceptAllValidator;
        assert!(validator.validate_target("anything", 1, true).await);
    }
}
