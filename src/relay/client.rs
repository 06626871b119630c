//! Client orchestration: local listeners that turn each accepted
//! connection (or each new UDP source) into a tunnel to the server

use super::pump::{datagram_fits, relay_stream, tunnel_to_datagrams, DATAGRAM_BUFFER_SIZE};
use super::udp::{UdpSession, UdpSessionTable};
use crate::address::TunnelSpec;
use crate::protocol::{ClientNegotiator, ClientTarget, TunnelTemplate};
use crate::tunnel::{Role, TcpTunnel};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

/// Socket a client listens on for local applications
#[derive(Debug)]
pub enum LocalSocket {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

/// One bound local socket and the target its traffic is forwarded to
#[derive(Debug)]
pub struct LocalListener {
    socket: LocalSocket,
    target: ClientTarget,
}

impl LocalListener {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = match &self.socket {
            LocalSocket::Tcp(listener) => listener.local_addr()?,
            LocalSocket::Udp(socket) => socket.local_addr()?,
        };
        Ok(addr)
    }

    pub fn target(&self) -> &ClientTarget {
        &self.target
    }
}

/// Every socket a client needs, bound and ready to serve
#[derive(Debug)]
pub struct ClientListeners {
    pub locals: Vec<LocalListener>,
    /// Accepts server-initiated connections in listen mode
    pub acceptor: Option<TcpListener>,
}

/// Tunnel client
#[derive(Debug)]
pub struct TunnelClient {
    template: TunnelTemplate,
    server_host: String,
    server_port: u16,
    tunnels: Vec<TunnelSpec>,
    listen: Vec<String>,
    listen_mode: bool,
    multi_use: bool,
}

impl TunnelClient {
    pub fn new(template: TunnelTemplate, server_host: impl Into<String>, server_port: u16) -> Self {
        Self {
            template,
            server_host: server_host.into(),
            server_port,
            tunnels: Vec::new(),
            listen: vec!["0.0.0.0".to_string()],
            listen_mode: false,
            multi_use: true,
        }
    }

    pub fn add_tunnel(&mut self, spec: TunnelSpec) {
        self.tunnels.push(spec);
    }

    /// Local addresses to bind, `0.0.0.0` by default
    pub fn with_listen(mut self, listen: Vec<String>) -> Self {
        if !listen.is_empty() {
            self.listen = listen;
        }
        self
    }

    /// Wait for the server to connect instead of dialing it
    pub fn with_listen_mode(mut self, on: bool) -> Self {
        self.listen_mode = on;
        self
    }

    /// Keep accepting after the first tunnel
    pub fn with_multi_use(mut self, on: bool) -> Self {
        self.multi_use = on;
        self
    }

    pub fn server_host(&self) -> &str {
        &self.server_host
    }

    /// UDP tunnels only when UDP is enabled and TCP is not
    pub fn is_udp(&self) -> bool {
        self.template.config.udp_mode() && !self.template.config.tcp_mode()
    }

    /// Bind one local socket per tunnel rule, listen address and port
    pub async fn bind(&self) -> Result<ClientListeners> {
        let udp = self.is_udp();
        let mut locals = Vec::new();

        for spec in &self.tunnels {
            for addr in &self.listen {
                for port in spec.from.ports() {
                    let target_port = spec.map_port(port).ok_or_else(|| {
                        Error::Parse(format!("no target port for local port {}", port))
                    })?;
                    let bind_addr = (addr.as_str(), port);

                    let socket = if udp {
                        LocalSocket::Udp(UdpSocket::bind(bind_addr).await.map_err(|e| {
                            Error::Network(format!("can't bind UDP {}:{}: {}", addr, port, e))
                        })?)
                    } else {
                        LocalSocket::Tcp(TcpListener::bind(bind_addr).await.map_err(|e| {
                            Error::Network(format!("can't bind TCP {}:{}: {}", addr, port, e))
                        })?)
                    };

                    let listener = LocalListener {
                        socket,
                        target: ClientTarget::new(
                            spec.host.clone(),
                            target_port,
                            self.server_host.clone(),
                        ),
                    };
                    info!(
                        "Listening on {} ({}) for {}:{}",
                        listener.local_addr()?,
                        if udp { "udp" } else { "tcp" },
                        spec.host,
                        target_port
                    );
                    locals.push(listener);
                }
            }
        }

        let acceptor = if self.listen_mode {
            let addr = self.listen.first().map(String::as_str).unwrap_or("0.0.0.0");
            let listener = TcpListener::bind((addr, self.server_port))
                .await
                .map_err(|e| {
                    Error::Network(format!(
                        "can't listen for the server on {}:{}: {}",
                        addr, self.server_port, e
                    ))
                })?;
            info!("Waiting for server connections on {}", listener.local_addr()?);
            Some(listener)
        } else {
            None
        };

        Ok(ClientListeners { locals, acceptor })
    }

    /// Bind everything and serve until every listener has stopped
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listeners = self.bind().await?;
        self.serve(listeners).await;
        Ok(())
    }

    /// Serve already bound listeners until every one has stopped
    pub async fn serve(self: Arc<Self>, listeners: ClientListeners) {
        let acceptor = listeners.acceptor.map(Arc::new);
        let mut tasks = JoinSet::new();

        for local in listeners.locals {
            let client = Arc::clone(&self);
            let acceptor = acceptor.clone();
            tasks.spawn(async move {
                let target = local.target;
                let result = match local.socket {
                    LocalSocket::Tcp(listener) => {
                        client.serve_tcp(listener, target, acceptor).await
                    }
                    LocalSocket::Udp(socket) => client.serve_udp(socket, target, acceptor).await,
                };
                if let Err(e) = result {
                    error!("Listener stopped: {}", e);
                }
            });
        }

        while tasks.join_next().await.is_some() {}
        debug!("All client listeners have stopped");
    }

    /// Transport to the server: dialed, or accepted in listen mode
    async fn server_connection(&self, acceptor: Option<&TcpListener>) -> Result<TcpStream> {
        let timeout = self.template.connect_timeout;

        let stream = match acceptor {
            Some(acceptor) => {
                let accept = acceptor.accept();
                let (stream, peer) = match timeout {
                    Some(limit) => tokio::time::timeout(limit, accept).await??,
                    None => accept.await?,
                };
                debug!("Accepted server connection from {}", peer);
                stream
            }
            None => {
                let connect = TcpStream::connect((self.server_host.as_str(), self.server_port));
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, connect).await??,
                    None => connect.await?,
                }
            }
        };
        Ok(stream)
    }

    /// Connect to the server and run the handshake for one tunnel
    async fn open_tunnel(
        &self,
        target: &ClientTarget,
        udp: bool,
        acceptor: Option<&TcpListener>,
    ) -> Result<TcpTunnel> {
        let stream = self.server_connection(acceptor).await?;

        let mut config = self.template.config.clone();
        config.set_udp_mode(udp);
        let mut tunnel = TcpTunnel::from_tcp(Role::Client, config, stream);

        ClientNegotiator::new(&self.template)
            .negotiate(&mut tunnel, target)
            .await?;
        Ok(tunnel)
    }

    async fn serve_tcp(
        &self,
        listener: TcpListener,
        target: ClientTarget,
        acceptor: Option<Arc<TcpListener>>,
    ) -> Result<()> {
        loop {
            let (local, from) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };
            debug!("Local connection from {}", from);

            match self.open_tunnel(&target, false, acceptor.as_deref()).await {
                Ok(tunnel) => {
                    let span = tracing::info_span!("local", from = %from);
                    tokio::spawn(relay_stream(tunnel, local).instrument(span));
                    if !self.multi_use {
                        info!("Single-use listener done");
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!("Can't open tunnel for {}: {}", from, e);
                    drop(local);
                }
            }
        }
    }

    async fn serve_udp(
        &self,
        socket: UdpSocket,
        target: ClientTarget,
        acceptor: Option<Arc<TcpListener>>,
    ) -> Result<()> {
        let socket = Arc::new(socket);
        let sessions: Arc<UdpSessionTable<OwnedWriteHalf>> = UdpSessionTable::new();
        let idle_timeout = self.template.config.idle_timeout();
        let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];

        loop {
            let received = match idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, socket.recv_from(&mut buf)).await {
                    Ok(received) => received,
                    Err(_) if self.multi_use => continue,
                    Err(_) => {
                        info!("Idle timeout on single-use UDP listener");
                        return Ok(());
                    }
                },
                None => socket.recv_from(&mut buf).await,
            };

            let (n, source) = match received {
                Ok(received) => received,
                Err(e) => {
                    debug!("UDP receive failed: {}", e);
                    continue;
                }
            };
            if !datagram_fits("udp listener", n) {
                continue;
            }

            let session = match sessions.get(&source) {
                Some(session) => session,
                None => match self
                    .open_udp_session(&socket, source, &target, acceptor.as_deref())
                    .await
                {
                    Ok(session) => {
                        sessions.insert(source, session.clone());
                        session
                    }
                    Err(e) => {
                        warn!("Can't open UDP tunnel for {}: {}", source, e);
                        continue;
                    }
                },
            };

            let mut writer = session.writer.lock().await;
            if let Err(e) = writer.write_message(&buf[..n]).await {
                debug!("Dropping UDP session for {}: {}", source, e);
                session.state.close();
                drop(writer);
                sessions.remove(&source);
            }
        }
    }

    async fn open_udp_session(
        &self,
        socket: &Arc<UdpSocket>,
        source: SocketAddr,
        target: &ClientTarget,
        acceptor: Option<&TcpListener>,
    ) -> Result<UdpSession<OwnedWriteHalf>> {
        let tunnel = self.open_tunnel(target, true, acceptor).await?;
        let state = Arc::clone(tunnel.state());
        let (reader, writer) = tunnel.into_split();

        let span = tracing::info_span!("tunnel", role = "client", source = %source);
        tokio::spawn(tunnel_to_datagrams(reader, Arc::clone(socket), Some(source)).instrument(span));

        Ok(UdpSession::new(writer, state))
    }
}

/// Port of the server to dial (or listen for), defaulting by mode
pub fn default_server_port(template: &TunnelTemplate, configured: Option<u16>) -> u16 {
    configured.unwrap_or_else(|| template.config.default_server_port())
}

/// Tunnel client configured from the tunnel rules alone: the server is
/// the first rule's host
pub fn client_for_specs(
    template: TunnelTemplate,
    specs: Vec<TunnelSpec>,
    server_port: Option<u16>,
) -> Result<TunnelClient> {
    let server_host = specs
        .first()
        .map(|spec| spec.host.clone())
        .ok_or_else(|| Error::Parse("no tunnels configured".to_string()))?;
    let port = default_server_port(&template, server_port);

    let mut client = TunnelClient::new(template, server_host, port);
    for spec in specs {
        client.add_tunnel(spec);
    }
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SystemServices;
    use crate::TunnelConfig;
    use std::time::Duration;

    fn spec(text: &str) -> Vec<TunnelSpec> {
        TunnelSpec::parse(text, &SystemServices::parse("telnet 23/tcp\n")).unwrap()
    }

    #[tokio::test]
    async fn test_bind_maps_ports() {
        let template = TunnelTemplate::new(TunnelConfig::default());
        let client = client_for_specs(template, spec("0:remote.example:2323"), None)
            .unwrap()
            .with_listen(vec!["127.0.0.1".to_string()]);

        assert_eq!(client.server_host(), "remote.example");
        assert!(!client.is_udp());

        let listeners = client.bind().await.unwrap();
        assert_eq!(listeners.locals.len(), 1);
        assert!(listeners.acceptor.is_none());

        let local = &listeners.locals[0];
        assert_ne!(local.local_addr().unwrap().port(), 0);
        assert_eq!(local.target().port, 2323);
        assert_eq!(local.target().host, "remote.example");
    }

    #[tokio::test]
    async fn test_default_server_port_follows_mode() {
        let mut config = TunnelConfig::default();
        assert_eq!(default_server_port(&TunnelTemplate::new(config.clone()), None), 0x2EBD);

        config.set_udp_mode(true);
        config.set_tcp_mode(false);
        let template = TunnelTemplate::new(config);
        assert_eq!(default_server_port(&template, None), 0x2BDE);
        assert_eq!(default_server_port(&template, Some(5000)), 5000);

        let client = client_for_specs(template, spec("localhost:7"), None).unwrap();
        assert!(client.is_udp());
    }

    #[tokio::test]
    async fn test_no_specs_is_an_error() {
        let template = TunnelTemplate::new(TunnelConfig::default());
        assert!(matches!(
            client_for_specs(template, Vec::new(), None),
            Err(Error::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_keeps_listening() {
        // Grab a free port, then close it so dialing fails
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_port = closed.local_addr().unwrap().port();
        drop(closed);

        let template = TunnelTemplate::new(TunnelConfig::default())
            .with_connect_timeout(Some(Duration::from_secs(2)));
        let mut client = TunnelClient::new(template, "127.0.0.1", server_port)
            .with_listen(vec!["127.0.0.1".to_string()]);
        client.add_tunnel(spec("0:127.0.0.1:7").remove(0));
        let client = Arc::new(client);

        let listeners = client.bind().await.unwrap();
        let local_addr = listeners.locals[0].local_addr().unwrap();
        let serving = tokio::spawn(Arc::clone(&client).serve(listeners));

        for _ in 0..2 {
            let mut app = TcpStream::connect(local_addr).await.unwrap();
            let mut buf = [0u8; 1];
            let n = tokio::io::AsyncReadExt::read(&mut app, &mut buf).await.unwrap_or(0);
            assert_eq!(n, 0);
        }
        assert!(!serving.is_finished());
        serving.abort();
    }
}
