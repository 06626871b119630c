//! Target, peer and tunnel specifications

use super::ports::{parse_port_list, PortRange};
use super::ServiceLookup;
use crate::{Error, Result};
use std::fmt;
use std::net::Ipv4Addr;

/// Width of an exact host match
pub const HOST_MASK_BITS: u8 = 32;

/// Network mask for a prefix width; a width of 0 matches everything
pub fn mask_for(bits: u8) -> u32 {
    match bits {
        0 => 0,
        b if b >= 32 => u32::MAX,
        b => u32::MAX << (32 - b),
    }
}

/// True when `a` and `b` agree on their first `bits` bits
pub fn masked_match(a: Ipv4Addr, b: Ipv4Addr, bits: u8) -> bool {
    let mask = mask_for(bits);
    (u32::from(a) & mask) == (u32::from(b) & mask)
}

/// Resolve a host name or dotted quad to its IPv4 addresses
pub async fn resolve_ipv4(host: &str) -> Result<Vec<Ipv4Addr>> {
    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return Ok(vec![addr]);
    }

    let addrs: Vec<Ipv4Addr> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| Error::Network(format!("can't resolve host '{}': {}", host, e)))?
        .filter_map(|addr| match addr.ip() {
            std::net::IpAddr::V4(v4) => Some(v4),
            std::net::IpAddr::V6(_) => None,
        })
        .collect();

    if addrs.is_empty() {
        return Err(Error::Network(format!(
            "host '{}' has no IPv4 address",
            host
        )));
    }

    Ok(addrs)
}

/// A target or peer specification
///
/// Grammar: `host`, `host:ports`, `host/maskbits` or `host/maskbits:ports`.
/// `*` stands for `0.0.0.0/0` on all ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpec {
    pub host: String,
    pub ports: PortRange,
    pub mask_bits: u8,
}

impl AddressSpec {
    /// Specification matching every address and port
    pub fn any() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            ports: PortRange::ALL,
            mask_bits: 0,
        }
    }

    /// Exact host on all ports
    pub fn host(host: &str) -> Self {
        Self {
            host: host.to_string(),
            ports: PortRange::ALL,
            mask_bits: HOST_MASK_BITS,
        }
    }

    /// Parse a specification; a port list yields one entry per range
    pub fn parse(spec: &str, services: &dyn ServiceLookup) -> Result<Vec<Self>> {
        let spec = spec.trim();
        if spec == "*" {
            return Ok(vec![Self::any()]);
        }

        let (address, ports) = match spec.split_once(':') {
            Some((address, ports)) => (address, Some(ports)),
            None => (spec, None),
        };

        let (host, mask_bits) = match address.split_once('/') {
            Some((host, mask)) => {
                let bits = mask
                    .trim()
                    .parse::<u8>()
                    .ok()
                    .filter(|bits| *bits <= 32)
                    .ok_or_else(|| {
                        Error::Parse(format!("invalid mask width '{}' in '{}'", mask, spec))
                    })?;
                (host.trim(), bits)
            }
            None => (address.trim(), HOST_MASK_BITS),
        };

        if host.is_empty() {
            return Err(Error::Parse(format!("missing host in '{}'", spec)));
        }

        let (host, mask_bits) = if host == "*" {
            ("0.0.0.0", 0)
        } else {
            (host, mask_bits)
        };

        let ranges = match ports {
            Some(ports) => parse_port_list(ports, services)?,
            None => vec![PortRange::ALL],
        };

        Ok(ranges
            .into_iter()
            .map(|ports| Self {
                host: host.to_string(),
                ports,
                mask_bits,
            })
            .collect())
    }

    pub fn mask(&self) -> u32 {
        mask_for(self.mask_bits)
    }

    /// Match against already-resolved addresses of both sides
    pub fn matches_resolved(&self, own: &[Ipv4Addr], candidates: &[Ipv4Addr], port: u16) -> bool {
        self.ports.contains(port)
            && own.iter().any(|a| {
                candidates
                    .iter()
                    .any(|b| masked_match(*a, *b, self.mask_bits))
            })
    }

    /// Resolve this specification's host and match it against `candidates`
    pub async fn matches(&self, candidates: &[Ipv4Addr], port: u16) -> bool {
        if !self.ports.contains(port) {
            return false;
        }

        match resolve_ipv4(&self.host).await {
            Ok(own) => self.matches_resolved(&own, candidates, port),
            Err(e) => {
                tracing::debug!("Skipping specification {}: {}", self, e);
                false
            }
        }
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.host, self.mask_bits, self.ports)
    }
}

/// Client-side port forwarding rule
///
/// A local port `p` in `from` forwards to `host` port
/// `to.lo + (from.hi - p)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub from: PortRange,
    pub host: String,
    pub to: PortRange,
}

impl TunnelSpec {
    /// Parse `target`, `target:toports` or `fromports:target:toports`
    ///
    /// A bare target forwards from an ephemeral local port to `telnet`.
    /// The from and to lists must have the same number of ranges. Each
    /// paired range must also cover the same number of ports, which is
    /// stricter than Zebedee, which only compares the list counts.
    pub fn parse(spec: &str, services: &dyn ServiceLookup) -> Result<Vec<Self>> {
        let tokens: Vec<&str> = spec.trim().split(':').map(str::trim).collect();

        let (from, host, to) = match tokens.as_slice() {
            [host] => ("0", *host, "telnet"),
            [host, to] => ("0", *host, *to),
            [from, host, to] => (*from, *host, *to),
            _ => {
                return Err(Error::Parse(format!(
                    "invalid tunnel specification: '{}'",
                    spec
                )))
            }
        };

        if host.is_empty() {
            return Err(Error::Parse(format!("missing target host in '{}'", spec)));
        }

        let from = parse_port_list(from, services)?;
        let to = parse_port_list(to, services)?;

        if from.len() != to.len() {
            return Err(Error::Parse(format!(
                "source and target port lists differ in length in '{}'",
                spec
            )));
        }

        from.into_iter()
            .zip(to)
            .map(|(from, to)| {
                if from.len() != to.len() {
                    return Err(Error::Parse(format!(
                        "port ranges {} and {} differ in size in '{}'",
                        from, to, spec
                    )));
                }
                Ok(Self {
                    from,
                    host: host.to_string(),
                    to,
                })
            })
            .collect()
    }

    /// Target port for local port `port`, if this rule covers it
    pub fn map_port(&self, port: u16) -> Option<u16> {
        if !self.from.contains(port) {
            return None;
        }
        let mapped = u32::from(self.to.lo) + u32::from(self.from.hi - port);
        u16::try_from(mapped).ok()
    }
}

/// Target host for the first rule covering `port`
pub fn find_target_host(specs: &[TunnelSpec], port: u16) -> Option<&str> {
    specs
        .iter()
        .find(|spec| spec.from.contains(port))
        .map(|spec| spec.host.as_str())
}

/// Target port for the first rule covering `port`
pub fn find_target_port(specs: &[TunnelSpec], port: u16) -> Option<u16> {
    specs.iter().find_map(|spec| spec.map_port(port))
}
