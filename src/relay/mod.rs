//! Relay layer - listeners and the pumps that move traffic
//!
//! Provides:
//! - Per-direction relay pumps for stream and datagram tunnels
//! - The client-side UDP session table
//! - [`TunnelClient`]: local listeners feeding tunnels to a server
//! - [`TunnelServer`]: accepts or dials tunnels and relays them to targets

mod client;
mod pump;
mod server;
mod udp;

pub use client::{
    client_for_specs, default_server_port, ClientListeners, LocalListener, LocalSocket,
    TunnelClient,
};
pub use pump::{
    datagrams_to_tunnel, local_to_tunnel, relay_datagrams, relay_stream, tunnel_to_datagrams,
    tunnel_to_local,
};
pub use server::{TunnelServer, INITIATE_BACKOFF};
pub use udp::{UdpSession, UdpSessionTable};
