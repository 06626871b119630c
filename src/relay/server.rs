//! Server orchestration: accept (or, in server-initiated mode, dial)
//! tunnel connections and relay each to its negotiated target

use super::pump::{relay_datagrams, relay_stream};
use crate::protocol::{ServerNegotiator, TargetConnection, TunnelTemplate};
use crate::tunnel::{Role, TcpTunnel, TunnelStats};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Pause after a failed dial in server-initiated mode
pub const INITIATE_BACKOFF: Duration = Duration::from_secs(1);

/// Tunnel server
#[derive(Debug)]
pub struct TunnelServer {
    template: TunnelTemplate,
    listen: Vec<String>,
    port: u16,
    client_host: Option<String>,
    default_target: String,
}

impl TunnelServer {
    pub fn new(template: TunnelTemplate, port: u16) -> Self {
        Self {
            template,
            listen: vec!["0.0.0.0".to_string()],
            port,
            client_host: None,
            default_target: "localhost".to_string(),
        }
    }

    /// Local addresses to listen on, `0.0.0.0` by default
    pub fn with_listen(mut self, listen: Vec<String>) -> Self {
        if !listen.is_empty() {
            self.listen = listen;
        }
        self
    }

    /// Dial `client_host` instead of listening
    pub fn with_client_host(mut self, client_host: Option<String>) -> Self {
        self.client_host = client_host;
        self
    }

    /// Target for clients that name the server itself
    pub fn with_default_target(mut self, host: impl Into<String>) -> Self {
        self.default_target = host.into();
        self
    }

    pub fn default_target(&self) -> &str {
        &self.default_target
    }

    /// Bind a listener per configured address
    pub async fn bind(&self) -> Result<Vec<TcpListener>> {
        let mut listeners = Vec::with_capacity(self.listen.len());
        for addr in &self.listen {
            let listener = TcpListener::bind((addr.as_str(), self.port))
                .await
                .map_err(|e| {
                    Error::Network(format!("can't listen on {}:{}: {}", addr, self.port, e))
                })?;
            info!("Server listening on {}", listener.local_addr()?);
            listeners.push(listener);
        }
        Ok(listeners)
    }

    /// Listen (or dial, with a client host) until stopped
    pub async fn run(self: Arc<Self>) -> Result<()> {
        if let Some(client_host) = self.client_host.clone() {
            self.initiate(&client_host).await;
            return Ok(());
        }

        let listeners = self.bind().await?;
        self.serve(listeners).await;
        Ok(())
    }

    /// Accept on every listener; returns only if all accept loops end
    pub async fn serve(self: Arc<Self>, listeners: Vec<TcpListener>) {
        let mut tasks = JoinSet::new();
        for listener in listeners {
            tasks.spawn(Arc::clone(&self).accept_loop(listener));
        }
        while tasks.join_next().await.is_some() {}
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("Connection from {}", peer);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(stream).await;
                    });
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Server-initiated mode: keep one connection to the client pending
    ///
    /// Each connection's handshake runs before the next dial, since the
    /// client only uses one when a local application connects.
    async fn initiate(self: Arc<Self>, client_host: &str) {
        info!("Connecting to client {}:{}", client_host, self.port);
        loop {
            let connect = TcpStream::connect((client_host, self.port));
            let connected = match self.template.connect_timeout {
                Some(limit) => tokio::time::timeout(limit, connect)
                    .await
                    .map_err(Error::from)
                    .and_then(|r| r.map_err(Error::from)),
                None => connect.await.map_err(Error::from),
            };

            let stream = match connected {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("Can't reach client {}: {}", client_host, e);
                    tokio::time::sleep(INITIATE_BACKOFF).await;
                    continue;
                }
            };

            match self.establish(stream).await {
                Ok((tunnel, target)) => {
                    tokio::spawn(relay(tunnel, target));
                }
                Err(e) => {
                    debug!("Server-initiated tunnel failed: {}", e);
                    tokio::time::sleep(INITIATE_BACKOFF).await;
                }
            }
        }
    }

    async fn establish(&self, stream: TcpStream) -> Result<(TcpTunnel, TargetConnection)> {
        let mut tunnel = TcpTunnel::from_tcp(Role::Server, self.template.config.clone(), stream);
        let target = ServerNegotiator::new(&self.template, self.default_target.clone())
            .negotiate(&mut tunnel, None)
            .await?;
        Ok((tunnel, target))
    }

    /// Handshake then relay one accepted connection
    pub async fn handle_connection(&self, stream: TcpStream) -> Option<TunnelStats> {
        match self.establish(stream).await {
            Ok((tunnel, target)) => Some(relay(tunnel, target).await),
            Err(e) => {
                warn!("Tunnel refused: {}", e);
                None
            }
        }
    }
}

async fn relay(tunnel: TcpTunnel, target: TargetConnection) -> TunnelStats {
    match target {
        TargetConnection::Tcp(stream) => relay_stream(tunnel, stream).await,
        TargetConnection::Udp(socket) => relay_datagrams(tunnel, socket).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TunnelConfig;

    #[tokio::test]
    async fn test_bind_ephemeral() {
        let server = TunnelServer::new(TunnelTemplate::new(TunnelConfig::default()), 0)
            .with_listen(vec!["127.0.0.1".to_string()]);
        assert_eq!(server.default_target(), "localhost");

        let listeners = server.bind().await.unwrap();
        assert_eq!(listeners.len(), 1);
        assert_ne!(listeners[0].local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_garbage_client_is_dropped() {
        let server = Arc::new(
            TunnelServer::new(TunnelTemplate::new(TunnelConfig::default()), 0)
                .with_listen(vec!["127.0.0.1".to_string()]),
        );
        let listeners = server.bind().await.unwrap();
        let addr = listeners[0].local_addr().unwrap();
        let serving = tokio::spawn(Arc::clone(&server).serve(listeners));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut stream, &[0x00, 0x01])
            .await
            .unwrap();
        let mut buf = [0u8; 8];
        let n = tokio::io::AsyncReadExt::read(&mut stream, &mut buf)
            .await
            .unwrap_or(0);
        assert_eq!(n, 0);

        // The listener survives a failed handshake
        assert!(TcpStream::connect(addr).await.is_ok());
        assert!(!serving.is_finished());
        serving.abort();
    }
}
