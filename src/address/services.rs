//! Symbolic service name lookup (`telnet` -> 23)

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

/// Standard location of the system services database
pub const SERVICES_PATH: &str = "/etc/services";

/// Resolves a service name for a transport protocol to a port number
pub trait ServiceLookup: Send + Sync {
    /// Look up `name` for `protocol` ("tcp" or "udp")
    fn lookup(&self, name: &str, protocol: &str) -> Option<u16>;
}

/// Services known even when no services database is installed
const WELL_KNOWN: &[(&str, u16)] = &[
    ("ftp", 21),
    ("ssh", 22),
    ("telnet", 23),
    ("smtp", 25),
    ("domain", 53),
    ("http", 80),
    ("www", 80),
    ("pop3", 110),
    ("nntp", 119),
    ("imap", 143),
    ("https", 443),
    ("x11", 6000),
    ("zebedee", 11965),
];

/// Service table read from a services(5) file
#[derive(Debug, Clone, Default)]
pub struct SystemServices {
    table: HashMap<(String, String), u16>,
}

impl SystemServices {
    /// Load the system table, falling back to the built-in well-known list
    pub fn load() -> Self {
        Self::load_from(SERVICES_PATH)
    }

    /// Load a services file from `path`
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                tracing::debug!(
                    "Services file {} unavailable ({}), using built-in table",
                    path.as_ref().display(),
                    e
                );
                Self::well_known()
            }
        }
    }

    /// Parse services(5) content: `name port/proto [aliases...] [# comment]`
    pub fn parse(content: &str) -> Self {
        let mut table = HashMap::new();

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("");
            let mut fields = line.split_whitespace();

            let (Some(name), Some(port_proto)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Some((port, proto)) = port_proto.split_once('/') else {
                continue;
            };
            let Ok(port) = port.parse::<u16>() else {
                continue;
            };

            let proto = proto.to_ascii_lowercase();
            for alias in std::iter::once(name).chain(fields) {
                table
                    .entry((alias.to_string(), proto.clone()))
                    .or_insert(port);
            }
        }

        Self { table }
    }

    /// Table holding only the built-in well-known services
    pub fn well_known() -> Self {
        let mut table = HashMap::new();
        for (name, port) in WELL_KNOWN {
            for proto in ["tcp", "udp"] {
                table.insert((name.to_string(), proto.to_string()), *port);
            }
        }
        Self { table }
    }
}

impl ServiceLookup for SystemServices {
    fn lookup(&self, name: &str, protocol: &str) -> Option<u16> {
        self.table
            .get(&(name.to_string(), protocol.to_string()))
            .copied()
            .or_else(|| {
                WELL_KNOWN
                    .iter()
                    .find(|(known, _)| *known == name)
                    .map(|(_, port)| *port)
            })
    }
}

/// Process-wide system service table, loaded on first use
pub fn system_services() -> &'static SystemServices {
    static SERVICES: OnceLock<SystemServices> = OnceLock::new();
    SERVICES.get_or_init(SystemServices::load)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_services_file() {
        let services = SystemServices::parse(
            "# comment line\n\
             ssh      22/tcp\n\
             domain   53/udp   nameserver  # DNS\n\
             bogus    notaport/tcp\n",
        );

        assert_eq!(services.lookup("ssh", "tcp"), Some(22));
        assert_eq!(services.lookup("nameserver", "udp"), Some(53));
        assert_eq!(services.lookup("bogus", "tcp"), None);
    }

    #[test]
    fn test_well_known_fallback() {
        let services = SystemServices::parse("");
        assert_eq!(services.lookup("telnet", "tcp"), Some(23));
        assert_eq!(services.lookup("no-such-service", "tcp"), None);
    }
}
