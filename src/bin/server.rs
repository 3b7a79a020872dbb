//! Lunar Tunnel Server
//!
//! The relay side of the split tunnel:
//! - Authenticates clients against the configured users
//! - Applies the layer stack each client negotiated
//! - Opens requested streams to their destinations

use anyhow::{bail, Context, Result};
use clap::Parser;
use lunar_tunnel::{
    auth::StaticAuth,
    config::{generate_example_config, Config},
    layers::{LayerCatalog, LayerIndex},
    logging::init_logging,
    session::Server,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Lunar Tunnel Server - split-tunnel VPN relay
#[derive(Parser, Debug)]
#[command(name = "lunar-server")]
#[command(about = "Lunar Tunnel Server - split-tunnel VPN relay with obfuscation layers")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Write an example configuration to --config and exit
    #[arg(long)]
    generate_config: bool,

    /// Print the layer catalog and exit
    #[arg(long)]
    list_layers: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Layer protecting the handshake (must match clients)
    #[arg(long)]
    bootstrap_layer: Option<LayerIndex>,

    /// Log level or filter (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        if Path::new(&args.config).exists() {
            bail!("{} already exists, not overwriting", args.config);
        }
        generate_example_config()
            .save(&args.config)
            .context("Failed to write example configuration")?;
        println!("Example configuration written to {}", args.config);
        return Ok(());
    }

    let config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else if args.list_layers {
        Config::default()
    } else {
        bail!(
            "Configuration file {} not found (create one with --generate-config)",
            args.config
        );
    };

    let catalog = Arc::new(LayerCatalog::from_config(&config.layers).context("Invalid [layers]")?);

    if args.list_layers {
        for (index, description) in catalog.descriptions() {
            println!("{:>3}  {}", index, description);
        }
        return Ok(());
    }

    let Some(mut server_config) = config.server.clone() else {
        bail!("{} has no [server] section", args.config);
    };
    if let Some(listen) = args.listen {
        server_config.listen = listen;
    }
    if let Some(index) = args.bootstrap_layer {
        server_config.bootstrap_layer = index;
    }

    init_logging(&config.logging, args.log_level.as_deref()).context("Failed to set up logging")?;

    info!("Lunar Tunnel Server v{}", lunar_tunnel::VERSION);
    for (index, description) in catalog.descriptions() {
        info!("Layer {}: {}", index, description);
    }
    info!("Bootstrap layer: {}", server_config.bootstrap_layer);

    info!("Loaded {} user(s)", server_config.users.len());
    let authenticator = Arc::new(StaticAuth::new(server_config.users.clone()));

    let server = Arc::new(Server::new(server_config, catalog, authenticator)?);
    let listener = server.bind().await.context("Failed to bind to address")?;

    tokio::select! {
        result = server.serve(listener) => {
            result.context("Server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
