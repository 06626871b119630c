//! Configuration management

mod tunnel;

pub use tunnel::{
    make_compression_value, TunnelConfig, COMPRESSION_BZIP2, COMPRESSION_ZLIB,
    DEFAULT_BUFFER_SIZE, DEFAULT_COMPRESSION, DEFAULT_KEY_LIFETIME, DEFAULT_KEY_SIZE,
    MAX_BUFFER_SIZE, MAX_COMPRESSION_LEVEL, MAX_IDLE_TIMEOUT, MAX_KEY_LIFETIME, MAX_KEY_SIZE,
};

use crate::crypto::{CommandKeySource, KeySource, RandomKeySource};
use crate::validation::ListValidator;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Default timeout for connections and server-initiated accepts, in seconds
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 300;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Protocol parameters shared by every tunnel
    #[serde(default)]
    pub tunnel: TunnelSettings,
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Peer and identity checks
    #[serde(default)]
    pub access: AccessConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// `[tunnel]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// `none`, `N`, `zlib` or `zlib:N`
    pub compression: String,
    /// Requested key size (client) or maximum key size (server), in bits
    pub key_size: i64,
    /// Smallest acceptable key size
    pub min_key_size: i64,
    /// Seconds a shared secret may be reused
    pub key_lifetime: i64,
    /// Seconds without traffic before a tunnel is closed, 0 for never
    pub idle_timeout: i64,
    /// Largest message payload
    pub buffer_size: i64,
    /// DH generator in hex, empty for the default
    pub generator: String,
    /// DH modulus in hex, empty for the default
    pub modulus: String,
    /// Fixed private key in hex
    pub private_key: Option<String>,
    /// Command printing a private key on its first output line
    pub key_gen_command: Option<String>,
    /// Enable TCP tunnels
    pub tcp: bool,
    /// Enable UDP tunnels
    pub udp: bool,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            compression: "zlib:6".to_string(),
            key_size: DEFAULT_KEY_SIZE as i64,
            min_key_size: 0,
            key_lifetime: DEFAULT_KEY_LIFETIME as i64,
            idle_timeout: 0,
            buffer_size: DEFAULT_BUFFER_SIZE as i64,
            generator: String::new(),
            modulus: String::new(),
            private_key: None,
            key_gen_command: None,
            tcp: true,
            udp: false,
        }
    }
}

impl TunnelSettings {
    /// Validate the section into a [`TunnelConfig`]
    pub fn to_tunnel_config(&self) -> crate::Result<TunnelConfig> {
        let mut config = TunnelConfig::default();
        config.set_compression_str(&self.compression)?;
        config.set_key_size(self.key_size)?;
        config.set_min_key_size(self.min_key_size)?;
        config.set_key_lifetime(self.key_lifetime)?;
        config.set_idle_timeout(self.idle_timeout)?;
        config.set_buffer_size(self.buffer_size)?;
        config.set_generator(&self.generator)?;
        config.set_modulus(&self.modulus)?;
        config.set_private_key(self.private_key.as_deref())?;
        config.set_tcp_mode(self.tcp);
        config.set_udp_mode(self.udp);

        if !self.tcp && !self.udp {
            return Err(crate::Error::Parse(
                "at least one of tcp and udp must be enabled".to_string(),
            ));
        }

        Ok(config)
    }

    /// Private key source: the generator command if one is set, else the CSPRNG
    pub fn key_source(&self) -> Arc<dyn KeySource> {
        match self.key_gen_command.as_deref() {
            Some(command) if !command.trim().is_empty() => Arc::new(CommandKeySource::new(command)),
            _ => Arc::new(RandomKeySource),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Local addresses to listen on
    pub listen: Vec<String>,
    /// Listen port (or client port to dial); defaults by mode
    pub port: Option<u16>,
    /// Dial this client instead of listening
    pub client_host: Option<String>,
    /// Permitted targets (`host[/mask][:ports]` or `*`)
    pub targets: Vec<String>,
    /// Timeout for outgoing connections, in seconds
    pub connect_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: vec!["0.0.0.0".to_string()],
            port: None,
            client_host: None,
            targets: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Tunnel server; defaults to the first tunnel's target host
    pub server_host: Option<String>,
    /// Tunnel server port; defaults by mode
    pub server_port: Option<u16>,
    /// Forwarding rules (`[fromports:]target[:toports]`)
    pub tunnels: Vec<String>,
    /// Local addresses for the forwarding listeners
    pub listen: Vec<String>,
    /// Wait for the server to connect instead of dialing it
    pub listen_mode: bool,
    /// Timeout for dialing the server or for awaiting it in listen mode
    pub connect_timeout: u64,
    /// Keep accepting after the first tunnel
    pub multi_use: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: None,
            server_port: None,
            tunnels: Vec::new(),
            listen: vec!["0.0.0.0".to_string()],
            listen_mode: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            multi_use: true,
        }
    }
}

/// `[access]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Files of accepted identity hashes, one per line
    pub id_files: Vec<String>,
    /// Accepted peer addresses (`host[/mask][:ports]` or `*`)
    pub peers: Vec<String>,
}

impl AccessConfig {
    /// Build a validator from the identity files and peer list
    pub fn validator(&self) -> crate::Result<ListValidator> {
        let mut validator = ListValidator::new();
        for path in &self.id_files {
            validator.add_id_file(path);
        }
        for peer in &self.peers {
            validator.add_peer(peer)?;
        }
        Ok(validator)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Install the global tracing subscriber
    ///
    /// `level` overrides the configured filter.
    pub fn init(&self, level: Option<&str>) -> crate::Result<()> {
        let filter = EnvFilter::try_new(level.unwrap_or(&self.level))
            .map_err(|e| crate::Error::Config(format!("Invalid log level: {}", e)))?;
        let builder = tracing_subscriber::fmt().with_env_filter(filter);

        let installed = match (&self.file, self.format.as_str()) {
            (Some(path), format) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| crate::Error::Config(format!("Failed to open log file: {}", e)))?;
                let builder = builder
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file));
                if format == "compact" {
                    builder.compact().try_init()
                } else {
                    builder.try_init()
                }
            }
            (None, "compact") => builder.compact().try_init(),
            (None, _) => builder.try_init(),
        };

        installed.map_err(|e| crate::Error::Config(format!("Failed to install logger: {}", e)))
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        tunnel: TunnelSettings::default(),
        server: Some(ServerConfig {
            targets: vec!["localhost".to_string()],
            ..ServerConfig::default()
        }),
        client: Some(ClientConfig {
            server_host: Some("tunnel.example.org".to_string()),
            tunnels: vec!["8023:localhost:telnet".to_string()],
            listen: vec!["127.0.0.1".to_string()],
            ..ClientConfig::default()
        }),
        access: AccessConfig::default(),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config = Config::from_toml(
            r#"
            [tunnel]
            compression = "zlib:9"
            key_size = 256
            idle_timeout = 120

            [server]
            targets = ["localhost", "10.0.0.0/8:22"]
            "#,
        )
        .unwrap();

        let tunnel = config.tunnel.to_tunnel_config().unwrap();
        assert_eq!(tunnel.compression(), 9);
        assert_eq!(tunnel.key_size(), 256);
        assert_eq!(tunnel.idle_timeout_secs(), 120);

        let server = config.server.unwrap();
        assert_eq!(server.listen, vec!["0.0.0.0"]);
        assert_eq!(server.targets.len(), 2);
        assert!(config.client.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_tunnel_settings() {
        let settings = TunnelSettings {
            compression: "bzip2:9".to_string(),
            ..TunnelSettings::default()
        };
        assert!(settings.to_tunnel_config().is_err());

        let settings = TunnelSettings {
            tcp: false,
            udp: false,
            ..TunnelSettings::default()
        };
        assert!(settings.to_tunnel_config().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zbd.toml");

        let config = generate_example_config();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(
            loaded.client.unwrap().tunnels,
            vec!["8023:localhost:telnet".to_string()]
        );
        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_access_validator() {
        let access = AccessConfig {
            id_files: vec!["/etc/zbd/clients.id".to_string()],
            peers: vec!["127.0.0.1".to_string(), "10.0.0.0/8:22".to_string()],
        };
        let validator = access.validator().unwrap();
        assert_eq!(validator.peers().len(), 2);

        let bad = AccessConfig {
            peers: vec!["10.0.0.0/40".to_string()],
            ..AccessConfig::default()
        };
        assert!(bad.validator().is_err());
    }

    #[test]
    fn test_key_source_selection() {
        let settings = TunnelSettings::default();
        assert!(format!("{:?}", settings.key_source()).contains("RandomKeySource"));

        let settings = TunnelSettings {
            key_gen_command: Some("echo 0123456789abcdef".to_string()),
            ..TunnelSettings::default()
        };
        assert!(format!("{:?}", settings.key_source()).contains("CommandKeySource"));
    }
}
