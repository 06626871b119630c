//! Relay pumps: one unidirectional copy loop per direction of an
//! established tunnel

use crate::tunnel::{MessageReader, MessageWriter, Tunnel, TunnelState, TunnelStats, MAX_PAYLOAD_SIZE};
use crate::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, trace, warn, Instrument};

/// Run `fut`, failing with [`Error::Timeout`] after `limit` if one is set
async fn with_idle_timeout<T, F>(limit: Option<Duration>, fut: F) -> crate::Result<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match limit {
        Some(limit) => Ok(tokio::time::timeout(limit, fut).await??),
        None => Ok(fut.await?),
    }
}

/// Receive buffer size that holds any UDP datagram whole
pub(crate) const DATAGRAM_BUFFER_SIZE: usize = 65536;

/// Whether an `len` byte datagram fits one tunnel message
///
/// Logs the drop when it does not.
pub(crate) fn datagram_fits(direction: &str, len: usize) -> bool {
    if len > MAX_PAYLOAD_SIZE {
        warn!(
            "{}: dropping {} byte datagram, the limit is {} bytes",
            direction, len, MAX_PAYLOAD_SIZE
        );
        return false;
    }
    true
}

fn log_read_end(direction: &str, error: &Error, state: &TunnelState) {
    if error.is_timeout() {
        info!("{}: idle timeout, closing tunnel", direction);
        state.close();
    } else {
        debug!("{}: {}", direction, error);
    }
}

/// Copy tunnel messages to a local byte stream until either side ends
///
/// Half-closes the local stream when done.
pub async fn tunnel_to_local<R, L>(mut reader: MessageReader<R>, mut local: L)
where
    R: AsyncRead + Unpin,
    L: AsyncWrite + Unpin,
{
    let state = Arc::clone(reader.state());
    loop {
        match reader.read_message().await {
            Ok(Some(data)) => {
                trace!("tunnel -> local: {} bytes", data.len());
                if let Err(e) = local.write_all(&data).await {
                    debug!("tunnel -> local: write failed: {}", e);
                    reader.shutdown();
                    break;
                }
            }
            Ok(None) => {
                debug!("tunnel -> local: end of stream");
                break;
            }
            Err(e) => {
                log_read_end("tunnel -> local", &e, &state);
                break;
            }
        }
    }
    local.shutdown().await.ok();
}

/// Copy a local byte stream into the tunnel until either side ends
///
/// Reads at most `buffer_size` bytes at a time and half-closes the tunnel
/// when done, so the peer sees end of stream.
pub async fn local_to_tunnel<L, W>(
    mut local: L,
    mut writer: MessageWriter<W>,
    buffer_size: usize,
    idle_timeout: Option<Duration>,
) where
    L: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let state = Arc::clone(writer.state());
    let buffer_size = buffer_size.clamp(1, MAX_PAYLOAD_SIZE);
    let mut buf = vec![0u8; buffer_size];

    loop {
        let read = tokio::select! {
            read = with_idle_timeout(idle_timeout, local.read(&mut buf)) => read,
            _ = state.closed() => {
                debug!("local -> tunnel: tunnel closed");
                break;
            }
        };

        match read {
            Ok(0) => {
                debug!("local -> tunnel: end of stream");
                break;
            }
            Ok(n) => {
                trace!("local -> tunnel: {} bytes", n);
                if let Err(e) = writer.write_chunked(&buf[..n], buffer_size).await {
                    debug!("local -> tunnel: {}", e);
                    break;
                }
            }
            Err(e) => {
                log_read_end("local -> tunnel", &e, &state);
                break;
            }
        }
    }
    writer.shutdown().await.ok();
}

/// Copy each tunnel message out as one datagram
///
/// Sends to `dest`, or on the socket's connected address when `dest` is
/// `None`. Closes the tunnel when done.
pub async fn tunnel_to_datagrams<R>(
    mut reader: MessageReader<R>,
    socket: Arc<UdpSocket>,
    dest: Option<SocketAddr>,
) where
    R: AsyncRead + Unpin,
{
    let state = Arc::clone(reader.state());
    loop {
        match reader.read_message().await {
            Ok(Some(data)) => {
                let sent = match dest {
                    Some(dest) => socket.send_to(&data, dest).await,
                    None => socket.send(&data).await,
                };
                if let Err(e) = sent {
                    debug!("tunnel -> udp: send failed: {}", e);
                    break;
                }
                trace!("tunnel -> udp: {} byte datagram", data.len());
            }
            Ok(None) => {
                debug!("tunnel -> udp: end of stream");
                break;
            }
            Err(e) => {
                log_read_end("tunnel -> udp", &e, &state);
                break;
            }
        }
    }
    state.close();
}

/// Copy datagrams from a connected socket into the tunnel, one message each
pub async fn datagrams_to_tunnel<W>(
    socket: Arc<UdpSocket>,
    writer: Arc<AsyncMutex<MessageWriter<W>>>,
    idle_timeout: Option<Duration>,
) where
    W: AsyncWrite + Unpin,
{
    let state = Arc::clone(writer.lock().await.state());
    let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];

    loop {
        let received = tokio::select! {
            received = with_idle_timeout(idle_timeout, socket.recv(&mut buf)) => received,
            _ = state.closed() => break,
        };

        match received {
            Ok(n) if !datagram_fits("udp -> tunnel", n) => continue,
            Ok(n) => {
                trace!("udp -> tunnel: {} byte datagram", n);
                if let Err(e) = writer.lock().await.write_message(&buf[..n]).await {
                    debug!("udp -> tunnel: {}", e);
                    break;
                }
            }
            Err(e) => {
                log_read_end("udp -> tunnel", &e, &state);
                break;
            }
        }
    }
    state.close();
    writer.lock().await.shutdown().await.ok();
}

fn log_closed(stats: &TunnelStats) {
    info!(
        "Tunnel closed: {} messages / {} bytes in, {} messages / {} bytes out",
        stats.messages_in, stats.bytes_in, stats.messages_out, stats.bytes_out
    );
}

/// Relay between an established tunnel and a local byte stream
///
/// Runs the two directions as separate tasks and returns the tunnel's
/// counters once both have finished.
pub async fn relay_stream<R, W, L>(tunnel: Tunnel<R, W>, local: L) -> TunnelStats
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    L: AsyncRead + AsyncWrite + Send + 'static,
{
    let span = tracing::info_span!("tunnel", role = %tunnel.role(), peer = ?tunnel.peer());
    let buffer_size = usize::from(tunnel.config().buffer_size());
    let idle_timeout = tunnel.config().idle_timeout();
    let state = Arc::clone(tunnel.state());

    let (reader, writer) = tunnel.into_split();
    let (local_read, local_write) = tokio::io::split(local);

    let inbound = tokio::spawn(tunnel_to_local(reader, local_write).instrument(span.clone()));
    let outbound = tokio::spawn(
        local_to_tunnel(local_read, writer, buffer_size, idle_timeout).instrument(span.clone()),
    );
    let (inbound, outbound) = tokio::join!(inbound, outbound);
    if let Err(e) = inbound.and(outbound) {
        debug!(parent: &span, "Relay task failed: {}", e);
    }

    let stats = state.stats();
    span.in_scope(|| log_closed(&stats));
    stats
}

/// Relay between an established UDP-mode tunnel and a connected socket
pub async fn relay_datagrams<R, W>(tunnel: Tunnel<R, W>, socket: UdpSocket) -> TunnelStats
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let span = tracing::info_span!("tunnel", role = %tunnel.role(), peer = ?tunnel.peer());
    let idle_timeout = tunnel.config().idle_timeout();
    let state = Arc::clone(tunnel.state());

    let (reader, writer) = tunnel.into_split();
    let socket = Arc::new(socket);
    let writer = Arc::new(AsyncMutex::new(writer));

    let inbound = tokio::spawn(
        tunnel_to_datagrams(reader, Arc::clone(&socket), None).instrument(span.clone()),
    );
    let outbound =
        tokio::spawn(datagrams_to_tunnel(socket, writer, idle_timeout).instrument(span.clone()));
    let (inbound, outbound) = tokio::join!(inbound, outbound);
    if let Err(e) = inbound.and(outbound) {
        debug!(parent: &span, "Relay task failed: {}", e);
    }

    let stats = state.stats();
    span.in_scope(|| log_closed(&stats));
    stats
}
