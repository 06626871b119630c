//! Client side of the handshake

use super::header::{ClientHeader, ServerHeader, HDR_FLAG_TCPMODE, HDR_FLAG_UDPMODE};
use super::{
    answer_challenge, issue_challenge, peer_value, setup_ciphers, HandshakeState,
    TunnelTemplate, HEADER_SIZE, PROTOCOL_VERSION,
};
use crate::address::resolve_ipv4;
use crate::crypto::{diffie_hellman, generate_nonce, public_key, validate_hex};
use crate::tunnel::Tunnel;
use crate::{Error, Result};
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, info_span, warn, Instrument};

/// Where the server should relay the tunnel's traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTarget {
    pub host: String,
    pub port: u16,
    /// Host the tunnel connects to; a target equal to it is sent as 0.0.0.0
    pub server_host: String,
}

impl ClientTarget {
    pub fn new(host: impl Into<String>, port: u16, server_host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            server_host: server_host.into(),
        }
    }

    /// Target address as carried in the request header
    async fn wire_address(&self) -> Result<Ipv4Addr> {
        if self.host.eq_ignore_ascii_case(&self.server_host) {
            return Ok(Ipv4Addr::UNSPECIFIED);
        }
        resolve_ipv4(&self.host)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Network(format!("can't resolve target host '{}'", self.host)))
    }
}

/// Drives one client tunnel through the handshake
#[derive(Debug)]
pub struct ClientNegotiator {
    template: TunnelTemplate,
    state: HandshakeState,
}

impl ClientNegotiator {
    pub fn new(template: &TunnelTemplate) -> Self {
        Self {
            template: template.clone(),
            state: HandshakeState::VersionExchange,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run the handshake on `tunnel`
    ///
    /// On failure the tunnel is closed and the state records why.
    pub async fn negotiate<R, W>(
        &mut self,
        tunnel: &mut Tunnel<R, W>,
        target: &ClientTarget,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let span = info_span!(
            "handshake",
            role = "client",
            remote = %format!("{}:{}", target.host, target.port)
        );

        match self.run(tunnel, target).instrument(span).await {
            Ok(()) => {
                self.state = HandshakeState::Established;
                Ok(())
            }
            Err(e) => {
                self.state = HandshakeState::from_error(&e);
                warn!("Client handshake failed ({}): {}", self.state, e);
                tunnel.close();
                tunnel.writer.shutdown().await.ok();
                Err(e)
            }
        }
    }

    async fn run<R, W>(&mut self, tunnel: &mut Tunnel<R, W>, target: &ClientTarget) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if let Some(peer) = tunnel.peer {
            if !self.template.validator.validate_peer(peer).await {
                return Err(Error::Validation(format!("server {} is not an allowed peer", peer)));
            }
        }

        self.state = HandshakeState::VersionExchange;
        tunnel.writer.write_raw(&PROTOCOL_VERSION.to_be_bytes()).await?;
        let mut version = [0u8; 2];
        tunnel.reader.read_raw(&mut version).await?;
        let version = u16::from_be_bytes(version);
        if version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "server speaks protocol {:#06x}, expected {:#06x}",
                version, PROTOCOL_VERSION
            )));
        }

        self.state = HandshakeState::HeaderExchange;
        let udp = tunnel.config.udp_mode();
        tunnel.client_nonce = generate_nonce();

        let request = ClientHeader {
            mode: if udp { HDR_FLAG_UDPMODE } else { HDR_FLAG_TCPMODE },
            buffer_size: tunnel.config.buffer_size(),
            compression: tunnel.config.compression(),
            target_port: target.port,
            key_size: tunnel.config.key_size(),
            token: self.template.tokens.current_token(),
            nonce: tunnel.client_nonce,
            target_addr: target.wire_address().await?,
        };
        debug!(
            "Requesting buffer {} compression {:#x} key size {} token {:#010x}",
            request.buffer_size, request.compression, request.key_size, request.token
        );
        tunnel.writer.write_raw(&request.encode()).await?;

        let mut raw = [0u8; HEADER_SIZE];
        tunnel.reader.read_raw(&mut raw).await?;
        let reply = ServerHeader::decode(&raw);
        self.adopt_reply(tunnel, &request, &reply, target)?;

        tunnel.token = reply.token;
        tunnel.server_nonce = reply.nonce;

        if tunnel.config.key_size() == 0 {
            debug!("Key size 0 negotiated, tunnel is not encrypted");
            return Ok(());
        }

        self.state = HandshakeState::KeyEstablishment;
        match self.template.tokens.key_for_token(reply.token) {
            Some(shared) => {
                debug!("Reusing session key for token {:#010x}", reply.token);
                setup_ciphers(tunnel, &shared)?;
                self.state = HandshakeState::ChallengeResponse;
                answer_challenge(tunnel).await?;
                issue_challenge(tunnel).await?;
            }
            None => {
                let shared = self.exchange_keys(tunnel).await?;
                setup_ciphers(tunnel, &shared)?;
                self.state = HandshakeState::ChallengeResponse;
                answer_challenge(tunnel).await?;
                issue_challenge(tunnel).await?;
                self.template.tokens.set_current_token(reply.token, &shared);
            }
        }

        info!(
            "Tunnel established to {}:{} ({} bit key)",
            target.host,
            target.port,
            tunnel.config.key_size()
        );
        Ok(())
    }

    /// Check the server's reply and narrow the tunnel's config to it
    fn adopt_reply<R, W>(
        &self,
        tunnel: &mut Tunnel<R, W>,
        request: &ClientHeader,
        reply: &ServerHeader,
        target: &ClientTarget,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let udp = request.is_udp();
        if (udp && reply.mode != HDR_FLAG_UDPMODE) || (!udp && reply.mode != HDR_FLAG_TCPMODE) {
            return Err(Error::Protocol(format!(
                "requested {} mode but the server does not support it",
                if udp { "UDP" } else { "TCP" }
            )));
        }

        if reply.buffer_size == 0 {
            return Err(Error::Protocol("server responded with zero buffer size".to_string()));
        }
        tunnel.config.set_buffer_size(i64::from(reply.buffer_size))?;

        if reply.compression > request.compression {
            return Err(Error::Protocol(format!(
                "server responded with invalid compression {:#x}",
                reply.compression
            )));
        }
        tunnel.config.adopt_compression(reply.compression);
        tunnel
            .writer
            .set_compression_level(u32::from(tunnel.config.compression_level()));

        if reply.port == 0 {
            return Err(Error::Validation(format!(
                "server refused redirection to {}:{}",
                target.host, target.port
            )));
        }
        if reply.port != request.target_port {
            return Err(Error::Protocol(format!(
                "server accepted port {} instead of {}",
                reply.port, request.target_port
            )));
        }

        if reply.key_size < tunnel.config.min_key_size() {
            return Err(Error::Protocol(format!(
                "server key size too small ({} < {})",
                reply.key_size,
                tunnel.config.min_key_size()
            )));
        }
        tunnel.config.adopt_key_size(reply.key_size);

        debug!(
            "Accepted buffer {} compression {:#x} key size {} token {:#010x}",
            reply.buffer_size, reply.compression, reply.key_size, reply.token
        );
        Ok(())
    }

    /// Full Diffie-Hellman exchange, returning the shared secret
    async fn exchange_keys<R, W>(&self, tunnel: &mut Tunnel<R, W>) -> Result<String>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let generator = tunnel.reader.read_string().await?;
        let modulus = tunnel.reader.read_string().await?;
        let server_key = tunnel.reader.read_string().await?;

        let generator = validate_hex("DH generator", &generator).map_err(peer_value)?;
        let modulus = validate_hex("DH modulus", &modulus).map_err(peer_value)?;
        let server_key = validate_hex("server DH key", &server_key).map_err(peer_value)?;
        tunnel.config.set_generator(&generator)?;
        tunnel.config.set_modulus(&modulus)?;

        if !self
            .template
            .validator
            .validate_identity(&generator, &modulus, &server_key)
            .await
        {
            return Err(Error::Validation("failed to validate server identity".to_string()));
        }
        debug!("Validated server identity");

        let exponent = self.template.private_key().await?;
        let own_key = public_key(&generator, &modulus, &exponent)?;
        tunnel.writer.write_string(&own_key).await?;

        diffie_hellman(&server_key, &modulus, &exponent)
    }
}
