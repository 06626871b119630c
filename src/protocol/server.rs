//! Server side of the handshake

use super::header::{ClientHeader, ServerHeader, HDR_FLAG_TCPMODE, HDR_FLAG_UDPMODE};
use super::{
    answer_challenge, issue_challenge, peer_value, setup_ciphers, HandshakeState,
    TunnelTemplate, HEADER_SIZE, PROTOCOL_VERSION,
};
use crate::crypto::{diffie_hellman, generate_nonce, public_key, validate_hex};
use crate::tunnel::Tunnel;
use crate::{Error, Result};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, info_span, warn, Instrument};

/// Socket to the real target a server tunnel relays to
#[derive(Debug)]
pub enum TargetConnection {
    Tcp(TcpStream),
    /// Connected to the target address
    Udp(UdpSocket),
}

impl TargetConnection {
    pub fn is_udp(&self) -> bool {
        matches!(self, TargetConnection::Udp(_))
    }

    /// Open a connection to `host:port`
    pub async fn connect(
        host: &str,
        port: u16,
        udp: bool,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let connect = async {
            if udp {
                let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
                socket.connect((host, port)).await?;
                Ok::<_, std::io::Error>(TargetConnection::Udp(socket))
            } else {
                let stream = TcpStream::connect((host, port)).await?;
                stream.set_nodelay(true).ok();
                Ok(TargetConnection::Tcp(stream))
            }
        };

        match timeout {
            Some(limit) => Ok(tokio::time::timeout(limit, connect).await??),
            None => Ok(connect.await?),
        }
    }
}

/// Drives one server tunnel through the handshake
#[derive(Debug)]
pub struct ServerNegotiator {
    template: TunnelTemplate,
    default_target: String,
    state: HandshakeState,
}

impl ServerNegotiator {
    /// `default_target` serves clients that name the server itself (0.0.0.0)
    pub fn new(template: &TunnelTemplate, default_target: impl Into<String>) -> Self {
        Self {
            template: template.clone(),
            default_target: default_target.into(),
            state: HandshakeState::VersionExchange,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run the handshake on `tunnel`, returning the target connection
    ///
    /// A connection supplied in `target` is used as is; otherwise one is
    /// opened to the validated target. On failure the tunnel is closed and
    /// the state records why.
    pub async fn negotiate<R, W>(
        &mut self,
        tunnel: &mut Tunnel<R, W>,
        target: Option<TargetConnection>,
    ) -> Result<TargetConnection>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let span = match tunnel.peer {
            Some(peer) => info_span!("handshake", role = "server", remote = %peer),
            None => info_span!("handshake", role = "server"),
        };

        match self.run(tunnel, target).instrument(span).await {
            Ok(connection) => {
                self.state = HandshakeState::Established;
                Ok(connection)
            }
            Err(e) => {
                self.state = HandshakeState::from_error(&e);
                warn!("Server handshake failed ({}): {}", self.state, e);
                tunnel.close();
                tunnel.writer.shutdown().await.ok();
                Err(e)
            }
        }
    }

    async fn run<R, W>(
        &mut self,
        tunnel: &mut Tunnel<R, W>,
        mut target: Option<TargetConnection>,
    ) -> Result<TargetConnection>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if let Some(peer) = tunnel.peer {
            if !self.template.validator.validate_peer(peer).await {
                return Err(Error::Validation(format!("client {} is not an allowed peer", peer)));
            }
        }

        self.state = HandshakeState::VersionExchange;
        let mut version = [0u8; 2];
        tunnel.reader.read_raw(&mut version).await?;
        let version = u16::from_be_bytes(version);
        if version < PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "client protocol {:#06x} is older than {:#06x}",
                version, PROTOCOL_VERSION
            )));
        }
        tunnel.writer.write_raw(&PROTOCOL_VERSION.to_be_bytes()).await?;
        debug!("Received protocol version {:#06x}", version);

        self.state = HandshakeState::HeaderExchange;
        let mut raw = [0u8; HEADER_SIZE];
        tunnel.reader.read_raw(&mut raw).await?;
        let request = ClientHeader::decode(&raw);
        tunnel.client_nonce = request.nonce;

        let mut refusal: Option<String> = None;
        let udp = request.is_udp();
        let config = &mut tunnel.config;

        let mode = if udp {
            if config.udp_mode() {
                HDR_FLAG_UDPMODE
            } else {
                HDR_FLAG_TCPMODE
            }
        } else if config.tcp_mode() {
            HDR_FLAG_TCPMODE
        } else {
            HDR_FLAG_UDPMODE
        };
        if (udp && !config.udp_mode()) || (!udp && !config.tcp_mode()) {
            refusal = Some(format!(
                "client requested {} mode, which is not enabled",
                if udp { "UDP" } else { "TCP" }
            ));
        }
        // Record the mode this tunnel actually runs in
        config.set_udp_mode(udp);

        if request.buffer_size > 0 && request.buffer_size < config.buffer_size() {
            config.set_buffer_size(i64::from(request.buffer_size))?;
        }

        let compression = request.compression.min(config.compression());
        config.adopt_compression(compression);
        tunnel
            .writer
            .set_compression_level(u32::from(tunnel.config.compression_level()));

        let host = if request.target_addr.is_unspecified() {
            self.default_target.clone()
        } else {
            request.target_addr.to_string()
        };

        let mut port = request.target_port;
        if refusal.is_none() {
            if !self.template.validator.validate_target(&host, port, udp).await {
                refusal = Some(format!("target {}:{} is not allowed", host, port));
            } else if target.is_none() {
                match TargetConnection::connect(&host, port, udp, self.template.connect_timeout)
                    .await
                {
                    Ok(connection) => target = Some(connection),
                    Err(e) => refusal = Some(format!("can't connect to {}:{}: {}", host, port, e)),
                }
            }
        }
        if refusal.is_some() {
            port = 0;
        }

        let config = &mut tunnel.config;
        let key_size = request
            .key_size
            .max(config.min_key_size())
            .min(config.key_size());
        config.adopt_key_size(key_size);

        let cached = self.template.tokens.key_for_token(request.token);
        let token = match cached {
            Some(_) => request.token,
            None => self.template.tokens.generate_token(request.token),
        };
        tunnel.token = token;
        tunnel.server_nonce = generate_nonce();

        let reply = ServerHeader {
            mode,
            buffer_size: tunnel.config.buffer_size(),
            compression,
            port,
            key_size,
            token,
            nonce: tunnel.server_nonce,
        };
        debug!(
            "Replying with buffer {} compression {:#x} port {} key size {} token {:#010x}",
            reply.buffer_size, reply.compression, reply.port, reply.key_size, reply.token
        );
        tunnel.writer.write_raw(&reply.encode()).await?;

        if let Some(reason) = refusal {
            return Err(Error::Validation(reason));
        }
        let target = target.ok_or_else(|| {
            Error::Protocol(format!("no target connection for {}:{}", host, port))
        })?;

        if key_size == 0 {
            debug!("Key size 0 negotiated, tunnel is not encrypted");
            return Ok(target);
        }

        self.state = HandshakeState::KeyEstablishment;
        match cached {
            Some(shared) => {
                debug!("Reusing session key for token {:#010x}", token);
                setup_ciphers(tunnel, &shared)?;
                self.state = HandshakeState::ChallengeResponse;
                issue_challenge(tunnel).await?;
                answer_challenge(tunnel).await?;
            }
            None => {
                let shared = self.exchange_keys(tunnel).await?;
                setup_ciphers(tunnel, &shared)?;
                self.state = HandshakeState::ChallengeResponse;
                issue_challenge(tunnel).await?;
                answer_challenge(tunnel).await?;
                self.template.tokens.set_key_for_token(token, &shared);
            }
        }

        info!(
            "Tunnel established to {}:{} ({}, {} bit key)",
            host,
            port,
            if udp { "udp" } else { "tcp" },
            key_size
        );
        Ok(target)
    }

    /// Full Diffie-Hellman exchange, returning the shared secret
    async fn exchange_keys<R, W>(&self, tunnel: &mut Tunnel<R, W>) -> Result<String>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let generator = tunnel.config.generator().to_string();
        let modulus = tunnel.config.modulus().to_string();
        tunnel.writer.write_string(&generator).await?;
        tunnel.writer.write_string(&modulus).await?;

        let exponent = self.template.private_key().await?;
        let own_key = public_key(&generator, &modulus, &exponent)?;
        tunnel.writer.write_string(&own_key).await?;

        let client_key = tunnel.reader.read_string().await?;
        let client_key = validate_hex("client DH key", &client_key).map_err(peer_value)?;

        if !self
            .template
            .validator
            .validate_identity(&generator, &modulus, &client_key)
            .await
        {
            return Err(Error::Validation("failed to validate client identity".to_string()));
        }
        debug!("Validated client identity");

        diffie_hellman(&client_key, &modulus, &exponent)
    }
}
