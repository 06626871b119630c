//! Address and port specifications
//!
//! Provides:
//! - Port range and port list parsing, with symbolic service names
//! - Target/peer specifications with network masks
//! - Client port forwarding rules (`[from:]target[:to]`)
//! - IPv4 resolution and masked address matching

mod ports;
mod services;
mod spec;

pub use ports::{parse_port_list, parse_port_range, PortRange};
pub use services::{system_services, ServiceLookup, SystemServices, SERVICES_PATH};
pub use spec::{
    find_target_host, find_target_port, mask_for, masked_match, resolve_ipv4, AddressSpec,
    TunnelSpec, HOST_MASK_BITS,
};
