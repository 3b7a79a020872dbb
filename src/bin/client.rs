//! Lunar Tunnel Client
//!
//! The local side of the split tunnel:
//! - Runs local SOCKS5/HTTP CONNECT proxies
//! - Routes each flow directly or through the tunnel (whitelist/blacklist)
//! - Negotiates an obfuscation layer stack with the server
//! - Multiplexes tunneled flows over one connection

use anyhow::{bail, Context, Result};
use clap::Parser;
use lunar_tunnel::{
    config::{generate_example_config, ClientConfig, Config},
    layers::{LayerCatalog, LayerIndex},
    logging::init_logging,
    routing::RoutingPolicy,
    session::Client,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Lunar Tunnel Client - split-tunnel VPN client
#[derive(Parser, Debug)]
#[command(name = "lunar-client")]
#[command(about = "Lunar Tunnel Client - split-tunnel VPN with obfuscation layers")]
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

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Local SOCKS5 proxy address
    #[arg(long)]
    socks5: Option<String>,

    /// Local HTTP proxy address
    #[arg(long)]
    http: Option<String>,

    /// Layer stack to propose, innermost first (e.g. "1,2")
    #[arg(long, value_delimiter = ',')]
    layers: Option<Vec<LayerIndex>>,

    /// Layer protecting the handshake (must match the server)
    #[arg(long)]
    bootstrap_layer: Option<LayerIndex>,

    /// Login
    #[arg(long)]
    login: Option<String>,

    /// Password
    #[arg(long)]
    password: Option<String>,

    /// Whitelist file (destinations routed directly)
    #[arg(long)]
    whitelist: Option<String>,

    /// Blacklist file (destinations always tunneled)
    #[arg(long)]
    blacklist: Option<String>,

    /// Log level or filter (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(&self, client: &mut ClientConfig) {
        if let Some(server) = &self.server {
            client.server = server.clone();
        }
        if let Some(addr) = &self.socks5 {
            client.socks5_listen = Some(addr.clone());
        }
        if let Some(addr) = &self.http {
            client.http_listen = Some(addr.clone());
        }
        if let Some(layers) = &self.layers {
            client.layers = layers.clone();
        }
        if let Some(index) = self.bootstrap_layer {
            client.bootstrap_layer = index;
        }
        if let Some(login) = &self.login {
            client.login = login.clone();
        }
        if let Some(password) = &self.password {
            client.password = password.clone();
        }
        if let Some(path) = &self.whitelist {
            client.whitelist = Some(path.clone());
        }
        if let Some(path) = &self.blacklist {
            client.blacklist = Some(path.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        return write_example_config(&args.config);
    }

    let mut config = if Path::new(&args.config).exists() {
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

    let mut client_config = config.client.take().unwrap_or_default();
    args.apply(&mut client_config);
    config.client = Some(client_config.clone());
    config.validate().context("Invalid configuration")?;

    init_logging(&config.logging, args.log_level.as_deref()).context("Failed to set up logging")?;

    info!("Lunar Tunnel Client v{}", lunar_tunnel::VERSION);
    info!("Server: {}", client_config.server);
    info!(
        "Layers: {:?} (bootstrap {})",
        client_config.layers, client_config.bootstrap_layer
    );

    let policy = RoutingPolicy::from_config(&client_config).context("Failed to load route lists")?;
    let client = Arc::new(Client::new(client_config, catalog, policy)?);

    client.connect().await.context("Failed to connect to server")?;

    tokio::select! {
        result = Arc::clone(&client).listen() => {
            result.context("Local proxy failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    client.disconnect().await;
    Ok(())
}

fn write_example_config(path: &str) -> Result<()> {
    if Path::new(path).exists() {
        bail!("{} already exists, not overwriting", path);
    }
    generate_example_config()
        .save(path)
        .context("Failed to write example configuration")?;

    println!("Example configuration written to {}", path);
    println!("Change the credentials in [server.users] and [client] before use.");
    Ok(())
}
