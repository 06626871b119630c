//! Port range grammar
//!
//! ```text
//! list  := range ( [, \t]+ range )*
//! range := N | N-M | service-name
//! ```

use super::ServiceLookup;
use crate::{Error, Result};
use std::fmt;
use std::ops::RangeInclusive;

/// Inclusive port range, always normalized so that `lo <= hi`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    /// Every usable port
    pub const ALL: PortRange = PortRange { lo: 1, hi: 65535 };

    /// Create a range, swapping the bounds if they are reversed
    pub fn new(a: u16, b: u16) -> Self {
        if a <= b {
            Self { lo: a, hi: b }
        } else {
            Self { lo: b, hi: a }
        }
    }

    /// Range holding one port
    pub fn single(port: u16) -> Self {
        Self { lo: port, hi: port }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.lo <= port && port <= self.hi
    }

    /// Number of ports in the range
    pub fn len(&self) -> usize {
        (self.hi - self.lo) as usize + 1
    }

    /// Always false: a range holds at least `lo`
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn ports(&self) -> RangeInclusive<u16> {
        self.lo..=self.hi
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lo == self.hi {
            write!(f, "{}", self.lo)
        } else {
            write!(f, "{}-{}", self.lo, self.hi)
        }
    }
}

/// Parse a comma, space or tab separated list of port ranges
pub fn parse_port_list(spec: &str, services: &dyn ServiceLookup) -> Result<Vec<PortRange>> {
    let ranges = spec
        .split(|c| c == ',' || c == ' ' || c == '\t')
        .filter(|token| !token.is_empty())
        .map(|token| parse_port_range(token, services))
        .collect::<Result<Vec<_>>>()?;

    if ranges.is_empty() {
        return Err(Error::Parse(format!("empty port list: '{}'", spec)));
    }

    Ok(ranges)
}

/// Parse a single range: `N`, `N-M` or a service name
///
/// Service names are looked up in the TCP table first, then UDP.
pub fn parse_port_range(token: &str, services: &dyn ServiceLookup) -> Result<PortRange> {
    let token = token.trim();

    if token.starts_with('-') || token.ends_with('-') {
        return Err(Error::Parse(format!("badly formed port range: '{}'", token)));
    }

    if token.starts_with(|c: char| c.is_ascii_digit()) {
        if let Some((lo, hi)) = token.split_once('-') {
            return Ok(PortRange::new(parse_port(lo)?, parse_port(hi)?));
        }
    }

    if let Some(port) = services
        .lookup(token, "tcp")
        .or_else(|| services.lookup(token, "udp"))
    {
        return Ok(PortRange::single(port));
    }

    parse_port(token).map(PortRange::single)
}

fn parse_port(s: &str) -> Result<u16> {
    s.trim()
        .parse::<u16>()
        .map_err(|_| Error::Parse(format!("invalid port number: '{}'", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SystemServices;

    fn services() -> SystemServices {
        SystemServices::parse("telnet 23/tcp\nsyslog 514/udp\nwho 513/udp\nlogin 513/tcp\n")
    }

    #[test]
    fn test_numeric_range() {
        let range = parse_port_range("8000-8010", &services()).unwrap();
        assert_eq!(range, PortRange { lo: 8000, hi: 8010 });
        assert_eq!(range.len(), 11);
    }

    #[test]
    fn test_single_port_range_is_not_empty() {
        let range = PortRange::single(80);
        assert_eq!(range.len(), 1);
        assert!(!range.is_empty());
        assert_eq!(PortRange::ALL.len(), 65535);
    }

    #[test]
    fn test_reversed_range_is_swapped() {
        let forward = parse_port_range("8000-8010", &services()).unwrap();
        let reversed = parse_port_range("8010-8000", &services()).unwrap();
        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_service_name_prefers_tcp() {
        let s = services();
        assert_eq!(parse_port_range("telnet", &s).unwrap(), PortRange::single(23));
        assert_eq!(parse_port_range("syslog", &s).unwrap(), PortRange::single(514));
        // "login" is tcp/513, "who" is udp/513
        assert_eq!(parse_port_range("login", &s).unwrap(), PortRange::single(513));
    }

    #[test]
    fn test_bad_ranges() {
        let s = services();
        assert!(parse_port_range("-80", &s).is_err());
        assert!(parse_port_range("80-", &s).is_err());
        assert!(parse_port_range("80-abc", &s).is_err());
        assert!(parse_port_range("nosuchservice", &s).is_err());
        assert!(parse_port_range("70000", &s).is_err());
    }

    #[test]
    fn test_port_list() {
        let ranges = parse_port_list("80, 443\t8000-8002", &services()).unwrap();
        assert_eq!(
            ranges,
            vec![
                PortRange::single(80),
                PortRange::single(443),
                PortRange::new(8000, 8002)
            ]
        );
        assert!(parse_port_list(" , ", &services()).is_err());
    }
}
