//! ZBD Tunnel Client
//!
//! Listens on local ports and carries each accepted connection (or each
//! UDP source) through its own compressed, encrypted tunnel to a server,
//! which relays it to the real target.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use zbd_tunnel::{
    address::{system_services, TunnelSpec},
    config::{ClientConfig, Config},
    crypto::{generate_private_key, public_identity},
    relay::{default_server_port, TunnelClient},
    TunnelTemplate,
};

const DEFAULT_CONFIG: &str = "config.toml";

/// ZBD Tunnel Client - Zebedee-compatible secure tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "zbd-client")]
#[command(about = "ZBD Tunnel Client - forward local ports through encrypted tunnels")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: String,

    /// Tunnels, `[fromports:]target[:toports]` (adds to config)
    tunnels: Vec<String>,

    /// Generate a private key and exit
    #[arg(long)]
    gen_private_key: bool,

    /// Print the public identity for the configured private key and exit
    #[arg(long)]
    gen_public_id: bool,

    /// Tunnel server host (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Tunnel server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Local listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Wait for the server to connect instead of dialing it
    #[arg(long)]
    listen_mode: bool,

    /// Carry UDP datagrams instead of TCP connections
    #[arg(short, long)]
    udp: bool,

    /// Stop after the first tunnel
    #[arg(long)]
    once: bool,

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

    let mut client_config = config.client.take().unwrap_or_default();
    apply_overrides(&args, &mut client_config);
    if args.udp {
        config.tunnel.udp = true;
        config.tunnel.tcp = false;
    }

    let tunnel = config
        .tunnel
        .to_tunnel_config()
        .context("Invalid [tunnel] settings")?;

    let mut specs = Vec::new();
    for spec in &client_config.tunnels {
        let parsed = TunnelSpec::parse(spec, system_services())
            .with_context(|| format!("Invalid tunnel '{}'", spec))?;
        specs.extend(parsed);
    }

    let mut validator = config
        .access
        .validator()
        .context("Invalid [access] settings")?;

    let template = TunnelTemplate::new(tunnel)
        .with_key_source(config.tunnel.key_source())
        .with_connect_timeout(connect_timeout(client_config.connect_timeout));

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

    let server_host = client_config
        .server_host
        .clone()
        .or_else(|| specs.first().map(|spec| spec.host.clone()))
        .ok_or_else(|| anyhow!("No tunnels configured"))?;

    // Only the configured server may connect in listen mode
    if client_config.listen_mode {
        validator
            .add_peer(&server_host)
            .with_context(|| format!("Invalid server host '{}'", server_host))?;
    }

    let template = template.with_validator(Arc::new(validator));
    let port = default_server_port(&template, client_config.server_port);

    let mut client = TunnelClient::new(template, server_host, port)
        .with_listen(client_config.listen)
        .with_listen_mode(client_config.listen_mode)
        .with_multi_use(client_config.multi_use);
    for spec in specs {
        client.add_tunnel(spec);
    }

    info!("Starting ZBD Tunnel Client v{}", zbd_tunnel::VERSION);
    info!("Server: {}:{}", client.server_host(), port);

    let client = Arc::new(client);

    tokio::select! {
        result = client.run() => {
            result.context("Client failed")?;
            info!("All tunnels finished");
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

fn apply_overrides(args: &Args, client: &mut ClientConfig) {
    if args.server.is_some() {
        client.server_host = args.server.clone();
    }
    if args.port.is_some() {
        client.server_port = args.port;
    }
    if let Some(listen) = &args.listen {
        client.listen = vec![listen.clone()];
    }
    if args.listen_mode {
        client.listen_mode = true;
    }
    if args.once {
        client.multi_use = false;
    }
    client.tunnels.extend(args.tunnels.iter().cloned());
}

fn connect_timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
