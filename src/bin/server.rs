//! ZBD Tunnel Server
//!
//! A Zebedee-compatible tunnel server that:
//! - Accepts tunnel connections, or dials a listening client
//! - Negotiates compression, buffer size and key size with each client
//! - Agrees a Blowfish session key by Diffie-Hellman, reusing cached keys
//! - Relays each tunnel to a permitted TCP or UDP target

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use zbd_tunnel::{
    config::{Config, ServerConfig},
    crypto::{generate_private_key, public_identity},
    relay::TunnelServer,
    TunnelTemplate,
};

const DEFAULT_CONFIG: &str = "config.toml";

/// ZBD Tunnel Server - Zebedee-compatible secure tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "zbd-server")]
#[command(about = "ZBD Tunnel Server - compressed, encrypted TCP/UDP tunnels")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: String,

    /// Generate a private key and exit
    #[arg(long)]
    gen_private_key: bool,

    /// Print the public identity for the configured private key and exit
    #[arg(long)]
    gen_public_id: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Listen port, or the client's port when dialing it (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Dial this client instead of listening (overrides config)
    #[arg(long)]
    client_host: Option<String>,

    /// Permitted target, `host[/mask][:ports]` (adds to config)
    #[arg(short, long)]
    target: Vec<String>,

    /// Accept UDP tunnels (overrides config)
    #[arg(short, long)]
    udp: bool,

    /// Log level (trace, debug, info, warn, error; overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.gen_private_key {
        println!("{}", generate_private_key()?);
        return Ok(());
    }

    let mut config = load_config(&args.config)?;
    config
        .logging
        .init(args.log_level.as_deref())
        .context("Failed to initialize logging")?;

    let mut server_config = config.server.take().unwrap_or_default();
    apply_overrides(&args, &mut server_config);
    if args.udp {
        config.tunnel.udp = true;
    }

    let tunnel = config
        .tunnel
        .to_tunnel_config()
        .context("Invalid [tunnel] settings")?;

    let mut validator = config
        .access
        .validator()
        .context("Invalid [access] settings")?;
    if server_config.targets.is_empty() {
        server_config.targets.push("localhost".to_string());
    }
    for target in &server_config.targets {
        validator
            .add_target(target)
            .with_context(|| format!("Invalid target '{}'", target))?;
    }
    let default_target = validator
        .default_target()
        .unwrap_or_else(|| "localhost".to_string());

    let port = server_config
        .port
        .unwrap_or_else(|| tunnel.default_server_port());

    let template = TunnelTemplate::new(tunnel)
        .with_key_source(config.tunnel.key_source())
        .with_validator(Arc::new(validator))
        .with_connect_timeout(connect_timeout(server_config.connect_timeout));

    if args.gen_public_id {
        let private_key = template.private_key().await?;
        let id = public_identity(
            template.config.generator(),
            template.config.modulus(),
            &private_key,
        )?;
        println!("{} generated-id", id);
        return Ok(());
    }

    info!("Starting ZBD Tunnel Server v{}", zbd_tunnel::VERSION);
    info!(
        "Targets: {} (default {})",
        server_config.targets.join(", "),
        default_target
    );

    let server = Arc::new(
        TunnelServer::new(template, port)
            .with_listen(server_config.listen)
            .with_client_host(server_config.client_host)
            .with_default_target(default_target),
    );

    tokio::select! {
        result = server.run() => {
            result.context("Server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}

/// Load the configuration file; a missing default file means defaults
fn load_config(path: &str) -> Result<Config> {
    if path == DEFAULT_CONFIG && !Path::new(path).exists() {
        return Ok(Config::default());
    }
    Config::load(path).context("Failed to load configuration")
}

fn apply_overrides(args: &Args, server: &mut ServerConfig) {
    if let Some(listen) = &args.listen {
        server.listen = vec![listen.clone()];
    }
    if args.port.is_some() {
        server.port = args.port;
    }
    if args.client_host.is_some() {
        server.client_host = args.client_host.clone();
    }
    server.targets.extend(args.target.iter().cloned());
}

fn connect_timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
