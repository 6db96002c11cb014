//! Wiremux Client
//!
//! The connecting (minor) side of a carrier link:
//! - Dials the server and keeps one carrier connection alive
//! - Reconnects with a fixed delay when the link drops
//! - Forwards local tunnel listeners to targets behind the server

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use wiremux::{
    config::{self, Config, TunnelSpec},
    crypto::KeyPair,
    tunnel::{Carrier, CarrierOptions, ChannelOpener},
};

/// Wiremux Client - connecting side of a multiplexed tunnel link
#[derive(Parser, Debug)]
#[command(name = "wiremux-client")]
#[command(about = "Wiremux Client - multiplexed encrypted tunnel, connecting side")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "wiremux.toml")]
    config: String,

    /// Write an example configuration with fresh keys and exit
    #[arg(long)]
    generate_config: bool,

    /// Print a fresh [keys] section for both configs and exit
    #[arg(long)]
    generate_keys: bool,

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Additional tunnel specs, e.g. tcp:8850:localhost:22
    #[arg(short, long = "tunnel")]
    tunnels: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    if args.generate_config {
        return generate_config(&args.config);
    }
    if args.generate_keys {
        return generate_keys();
    }

    // Load configuration
    let config = Config::load(&args.config).context("Failed to load configuration")?;

    let client_config = config
        .client
        .clone()
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;

    let keys = config
        .keys
        .key_pair()
        .context("Invalid carrier keys in config")?;

    let mut specs = client_config.tunnels.clone();
    specs.extend(args.tunnels.iter().cloned());
    let tunnels = config::parse_tunnel_specs(&specs)?;

    let server_addr = args.server.unwrap_or(client_config.server);
    let reconnect_delay = Duration::from_secs(client_config.reconnect_delay_secs);

    info!("Wiremux Client v{}", wiremux::VERSION);
    info!("Server: {}", server_addr);
    for spec in &tunnels {
        info!("Tunnel {}", spec);
    }

    loop {
        info!("Connecting to {}...", server_addr);
        match TcpStream::connect(&server_addr).await {
            Ok(stream) => {
                info!("Carrier connected");
                tokio::select! {
                    result = run_session(stream, &keys, config.carrier.carrier_options(), &tunnels) => {
                        match result {
                            Ok(()) => info!("Carrier session ended"),
                            Err(e) => error!("Carrier session failed: {}", e),
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutting down...");
                        return Ok(());
                    }
                }
            }
            Err(e) => error!("Failed to connect: {}", e),
        }

        info!(
            "Reconnecting in {} seconds...",
            client_config.reconnect_delay_secs
        );
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                return Ok(());
            }
        }
    }
}

/// Run one carrier session until the link dies
async fn run_session(
    stream: TcpStream,
    keys: &KeyPair,
    options: CarrierOptions,
    tunnels: &[TunnelSpec],
) -> Result<()> {
    stream.set_nodelay(true)?;

    // The client is the minor side and encrypts with the c2s key
    let carrier = Carrier::with_options(
        stream,
        false,
        &keys.client_to_server,
        &keys.server_to_client,
        options,
    )
    .start();

    let mut listeners = Vec::new();
    for spec in tunnels {
        let spec = spec.clone();
        let opener = carrier.opener();
        listeners.push(tokio::spawn(async move {
            if let Err(e) = run_tunnel_listener(spec, opener).await {
                error!("Tunnel listener error: {}", e);
            }
        }));
    }

    let result = carrier.join().await;
    for listener in &listeners {
        listener.abort();
    }
    result.map_err(Into::into)
}

/// Accept local connections and open a channel for each
async fn run_tunnel_listener(spec: TunnelSpec, opener: ChannelOpener) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", spec.listen_port))
        .await
        .context(format!("Failed to bind tunnel port {}", spec.listen_port))?;
    info!(
        "Tunnel listening on {} -> {}:{}",
        spec.listen_port, spec.target_host, spec.target_port
    );

    loop {
        let (socket, peer_addr) = listener.accept().await?;
        debug!("Accepted {} on tunnel port {}", peer_addr, spec.listen_port);
        socket.set_nodelay(true)?;
        match opener
            .open_channel(socket, &spec.target_host, spec.target_port)
            .await
        {
            Ok(cid) => debug!("Relaying {} on channel {}", peer_addr, cid),
            Err(e) => warn!("Failed to open channel for {}: {}", peer_addr, e),
        }
    }
}

/// Write an example configuration file with freshly generated keys
fn generate_config(path: &str) -> Result<()> {
    if std::path::Path::new(path).exists() {
        return Err(anyhow!("Refusing to overwrite existing {}", path));
    }
    let config = config::generate_example_config();
    config.save(path)?;
    println!("Wrote example configuration to {}", path);
    println!("Copy the [keys] section verbatim into the server configuration.");
    Ok(())
}

/// Print a freshly generated key pair as a paste-ready [keys] section
fn generate_keys() -> Result<()> {
    let keys = config::KeysConfig::from_pair(&KeyPair::generate());
    println!("[keys]");
    println!("server_to_client = \"{}\"", keys.server_to_client);
    println!("client_to_server = \"{}\"", keys.client_to_server);
    Ok(())
}
