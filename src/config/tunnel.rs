//! Per-tunnel protocol parameters

use crate::crypto::validate_hex;
use crate::{Error, Result};
use std::time::Duration;

/// Compression type carried in bits 8..12 of the compression value
pub const COMPRESSION_ZLIB: u16 = 0;

/// bzip2 compression type; recognised but never accepted
pub const COMPRESSION_BZIP2: u16 = 1;

/// Highest zlib level
pub const MAX_COMPRESSION_LEVEL: u16 = 9;

/// Default compression value: zlib level 6
pub const DEFAULT_COMPRESSION: u16 = 0x0006;

pub const DEFAULT_KEY_SIZE: u16 = 128;

/// Largest key size in bits
pub const MAX_KEY_SIZE: u16 = 576;

pub const DEFAULT_BUFFER_SIZE: u16 = 8192;

/// Largest message payload
pub const MAX_BUFFER_SIZE: u16 = 16383;

/// Default lifetime of a reusable session key, in seconds
pub const DEFAULT_KEY_LIFETIME: u16 = 3600;

pub const MAX_KEY_LIFETIME: u16 = 65535;

/// Largest idle timeout in seconds; 0 disables the timeout
pub const MAX_IDLE_TIMEOUT: u16 = 65535;

/// Parameters requested by, negotiated for, or accepted by one tunnel
///
/// A configured instance acts as the template for every tunnel a listener
/// creates. Each tunnel then narrows its own copy to the values agreed in
/// the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    compression: u16,
    key_size: u16,
    min_key_size: u16,
    buffer_size: u16,
    idle_timeout: u16,
    key_lifetime: u16,
    generator: String,
    modulus: String,
    private_key: Option<String>,
    tcp_mode: bool,
    udp_mode: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            compression: DEFAULT_COMPRESSION,
            key_size: DEFAULT_KEY_SIZE,
            min_key_size: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: 0,
            key_lifetime: DEFAULT_KEY_LIFETIME,
            generator: String::new(),
            modulus: String::new(),
            private_key: None,
            tcp_mode: true,
            udp_mode: false,
        }
    }
}

fn non_negative(what: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::Parse(format!("invalid {}: {}", what, value)))
}

fn clamp_u16(value: u64, max: u16) -> u16 {
    value.min(max as u64) as u16
}

/// Combined compression value `(kind << 8) | level`
///
/// Only zlib is accepted. A negative level is an error and a level above
/// [`MAX_COMPRESSION_LEVEL`] is clamped to it.
pub fn make_compression_value(kind: u16, level: i64) -> Result<u16> {
    match kind {
        COMPRESSION_ZLIB => {}
        COMPRESSION_BZIP2 => {
            return Err(Error::Parse("bzip2 compression is not supported".to_string()))
        }
        other => return Err(Error::Parse(format!("unknown compression type: {}", other))),
    }
    let level = clamp_u16(non_negative("compression level", level)?, MAX_COMPRESSION_LEVEL);
    Ok((kind << 8) | level)
}

impl TunnelConfig {
    /// Raw compression value, `(type << 8) | level`
    pub fn compression(&self) -> u16 {
        self.compression
    }

    pub fn compression_type(&self) -> u16 {
        (self.compression >> 8) & 0xf
    }

    pub fn compression_level(&self) -> u16 {
        self.compression & 0xf
    }

    /// Set the combined compression value, clamping the level to 9
    ///
    /// bzip2 and unknown types are rejected.
    pub fn set_compression(&mut self, value: i64) -> Result<()> {
        let value = non_negative("compression", value)?;
        let kind = u16::try_from(value >> 8)
            .map_err(|_| Error::Parse(format!("unknown compression type in {:#x}", value)))?;
        self.compression = make_compression_value(kind, (value & 0xff) as i64)?;
        Ok(())
    }

    /// Parse `none`, `N` (a combined value), `zlib` or `zlib:N`
    pub fn set_compression_str(&mut self, spec: &str) -> Result<()> {
        let spec = spec.trim().to_ascii_lowercase();

        let (kind, level) = match spec.split_once(':') {
            Some((kind, level)) => {
                let level = level
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| Error::Parse(format!("invalid compression level: '{}'", level)))?;
                (kind.trim(), level)
            }
            None => match spec.as_str() {
                "none" | "off" => return self.set_compression(0),
                raw if raw.starts_with(|c: char| c.is_ascii_digit()) => {
                    let value = raw
                        .parse::<i64>()
                        .map_err(|_| Error::Parse(format!("invalid compression: '{}'", raw)))?;
                    return self.set_compression(value);
                }
                kind => (kind, i64::from(DEFAULT_COMPRESSION & 0xff)),
            },
        };

        let kind = match kind {
            "zlib" => COMPRESSION_ZLIB,
            "bzip2" | "bzip" => COMPRESSION_BZIP2,
            other => {
                return Err(Error::Parse(format!("unknown compression type: '{}'", other)))
            }
        };
        self.compression = make_compression_value(kind, level)?;
        Ok(())
    }

    /// Key size in bits: requested by a client, the maximum for a server
    pub fn key_size(&self) -> u16 {
        self.key_size
    }

    pub fn set_key_size(&mut self, bits: i64) -> Result<()> {
        self.key_size = clamp_u16(non_negative("key size", bits)?, MAX_KEY_SIZE);
        Ok(())
    }

    /// Smallest key size this side will accept
    pub fn min_key_size(&self) -> u16 {
        self.min_key_size
    }

    pub fn set_min_key_size(&mut self, bits: i64) -> Result<()> {
        self.min_key_size = clamp_u16(non_negative("minimum key size", bits)?, MAX_KEY_SIZE);
        Ok(())
    }

    pub fn buffer_size(&self) -> u16 {
        self.buffer_size
    }

    pub fn set_buffer_size(&mut self, size: i64) -> Result<()> {
        if size < 1 {
            return Err(Error::Parse(format!("invalid buffer size: {}", size)));
        }
        self.buffer_size = clamp_u16(size as u64, MAX_BUFFER_SIZE);
        Ok(())
    }

    /// Idle timeout in seconds, 0 for none
    pub fn idle_timeout_secs(&self) -> u16 {
        self.idle_timeout
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs as u64)),
        }
    }

    pub fn set_idle_timeout(&mut self, secs: i64) -> Result<()> {
        self.idle_timeout = clamp_u16(non_negative("idle timeout", secs)?, MAX_IDLE_TIMEOUT);
        Ok(())
    }

    pub fn key_lifetime(&self) -> Duration {
        Duration::from_secs(self.key_lifetime as u64)
    }

    pub fn set_key_lifetime(&mut self, secs: i64) -> Result<()> {
        self.key_lifetime = clamp_u16(non_negative("key lifetime", secs)?, MAX_KEY_LIFETIME);
        Ok(())
    }

    /// Configured DH generator, empty for the default
    pub fn generator(&self) -> &str {
        &self.generator
    }

    pub fn set_generator(&mut self, generator: &str) -> Result<()> {
        self.generator = validate_hex("generator", generator)?;
        Ok(())
    }

    /// Configured DH modulus, empty for the default
    pub fn modulus(&self) -> &str {
        &self.modulus
    }

    pub fn set_modulus(&mut self, modulus: &str) -> Result<()> {
        self.modulus = validate_hex("modulus", modulus)?;
        Ok(())
    }

    /// Fixed DH exponent, if configured
    pub fn private_key(&self) -> Option<&str> {
        self.private_key.as_deref()
    }

    pub fn set_private_key(&mut self, key: Option<&str>) -> Result<()> {
        self.private_key = match key {
            Some(key) => match validate_hex("private key", key)? {
                key if key.is_empty() => None,
                key => Some(key),
            },
            None => None,
        };
        Ok(())
    }

    pub fn tcp_mode(&self) -> bool {
        self.tcp_mode
    }

    pub fn set_tcp_mode(&mut self, on: bool) {
        self.tcp_mode = on;
    }

    /// On a client, request a UDP tunnel; on a server, accept them
    pub fn udp_mode(&self) -> bool {
        self.udp_mode
    }

    pub fn set_udp_mode(&mut self, on: bool) {
        self.udp_mode = on;
    }

    /// Default server port for the enabled modes
    pub fn default_server_port(&self) -> u16 {
        if self.udp_mode && !self.tcp_mode {
            crate::DEFAULT_UDP_PORT
        } else {
            crate::DEFAULT_TCP_PORT
        }
    }

    /// Adopt a negotiated compression value without validation
    pub(crate) fn adopt_compression(&mut self, value: u16) {
        self.compression = value;
    }

    /// Adopt a negotiated key size without clamping
    pub(crate) fn adopt_key_size(&mut self, bits: u16) {
        self.key_size = bits;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TunnelConfig::default();
        assert_eq!(config.compression(), 6);
        assert_eq!(config.key_size(), 128);
        assert_eq!(config.buffer_size(), 8192);
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.key_lifetime(), Duration::from_secs(3600));
        assert_eq!(config.default_server_port(), 0x2EBD);
    }

    #[test]
    fn test_compression_values() {
        let mut config = TunnelConfig::default();

        config.set_compression(0x0003).unwrap();
        assert_eq!(config.compression_level(), 3);

        config.set_compression(0x000c).unwrap();
        assert_eq!(config.compression_level(), 9);

        assert!(config.set_compression(0x0106).is_err());
        assert!(config.set_compression(-1).is_err());
    }

    #[test]
    fn test_compression_strings() {
        let mut config = TunnelConfig::default();

        config.set_compression_str("zlib:9").unwrap();
        assert_eq!(config.compression(), 9);
        config.set_compression_str("none").unwrap();
        assert_eq!(config.compression(), 0);
        config.set_compression_str("4").unwrap();
        assert_eq!(config.compression(), 4);
        config.set_compression_str("zlib").unwrap();
        assert_eq!(config.compression(), 6);

        assert!(config.set_compression_str("bzip2:9").is_err());
        assert!(config.set_compression_str("lzma").is_err());
        assert!(config.set_compression_str("zlib:x").is_err());
        assert!(config.set_compression_str("zlib:-1").is_err());
    }

    #[test]
    fn test_compression_level_clamped_not_wrapped() {
        let mut config = TunnelConfig::default();

        config.set_compression_str("zlib:20").unwrap();
        assert_eq!(config.compression(), 9);
        config.set_compression_str("zlib:300").unwrap();
        assert_eq!(config.compression(), 9);
        config.set_compression_str("20").unwrap();
        assert_eq!(config.compression(), 9);

        // Type bits above the low byte are never masked away
        assert!(config.set_compression(0x1006).is_err());
        assert!(config.set_compression_str("4102").is_err());

        assert_eq!(make_compression_value(COMPRESSION_ZLIB, 12).unwrap(), 9);
        assert_eq!(make_compression_value(COMPRESSION_ZLIB, 0).unwrap(), 0);
        assert!(make_compression_value(COMPRESSION_BZIP2, 5).is_err());
        assert!(make_compression_value(7, 5).is_err());
        assert!(make_compression_value(COMPRESSION_ZLIB, -3).is_err());
    }

    #[test]
    fn test_clamps_and_errors() {
        let mut config = TunnelConfig::default();

        config.set_key_size(4096).unwrap();
        assert_eq!(config.key_size(), MAX_KEY_SIZE);
        assert!(config.set_key_size(-8).is_err());

        config.set_buffer_size(100_000).unwrap();
        assert_eq!(config.buffer_size(), MAX_BUFFER_SIZE);
        assert!(config.set_buffer_size(0).is_err());

        config.set_idle_timeout(1_000_000).unwrap();
        assert_eq!(config.idle_timeout_secs(), MAX_IDLE_TIMEOUT);

        config.set_key_lifetime(70_000).unwrap();
        assert_eq!(config.key_lifetime(), Duration::from_secs(65535));
    }

    #[test]
    fn test_hex_parameters() {
        let mut config = TunnelConfig::default();

        config.set_generator(" 5 ").unwrap();
        assert_eq!(config.generator(), "5");
        assert!(config.set_modulus("not hex").is_err());

        config.set_private_key(Some("ABCDEF")).unwrap();
        assert_eq!(config.private_key(), Some("abcdef"));
        config.set_private_key(Some("")).unwrap();
        assert_eq!(config.private_key(), None);
    }
}
