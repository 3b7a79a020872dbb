//! Configuration management

use crate::layers::{LayerIndex, PaddingConfig};
use crate::routing::Route;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Layer catalog parameters (must match on client and server)
    #[serde(default)]
    pub layers: LayersConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        let config: Self = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Check values that do not depend on the layer catalog
    pub fn validate(&self) -> Result<(), crate::Error> {
        if let Some(client) = &self.client {
            client.validate()?;
        }
        if let Some(server) = &self.server {
            server.validate()?;
        }
        self.layers.validate()?;
        self.logging.validate()
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Layer used to protect the handshake (pre-shared with clients)
    pub bootstrap_layer: LayerIndex,
    /// Accepted credentials: login => password
    pub users: HashMap<String, String>,
    /// Maximum concurrent tunnel connections
    pub max_connections: usize,
    /// Deadline for the whole handshake round trip
    pub handshake_timeout_secs: u64,
    /// Timeout for dialing tunneled destinations
    pub connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", crate::DEFAULT_PORT),
            bootstrap_layer: 1,
            users: HashMap::new(),
            max_connections: 1000,
            handshake_timeout_secs: crate::protocol::HANDSHAKE_TIMEOUT,
            connect_timeout_secs: crate::transport::CONNECT_TIMEOUT,
        }
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.users.is_empty() {
            return Err(crate::Error::Config(
                "[server] has no users - every handshake would be rejected".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(crate::Error::Config("max_connections must be positive".to_string()));
        }
        check_timeout("handshake_timeout_secs", self.handshake_timeout_secs)?;
        check_timeout("connect_timeout_secs", self.connect_timeout_secs)
    }

    /// Handshake deadline
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Destination dial timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address
    pub server: String,
    /// Login sent in the handshake
    pub login: String,
    /// Password sent in the handshake
    pub password: String,
    /// Proposed layer stack, innermost first
    pub layers: Vec<LayerIndex>,
    /// Layer used to protect the handshake (pre-shared with the server)
    pub bootstrap_layer: LayerIndex,
    /// Local SOCKS5 proxy address
    pub socks5_listen: Option<String>,
    /// Local HTTP CONNECT proxy address
    pub http_listen: Option<String>,
    /// File of destinations routed directly
    pub whitelist: Option<String>,
    /// File of destinations always tunneled
    pub blacklist: Option<String>,
    /// Route for destinations in neither list
    pub default_route: Route,
    /// Deadline for the whole handshake round trip
    pub handshake_timeout_secs: u64,
    /// Timeout for dialing the server and direct destinations
    pub connect_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{}", crate::DEFAULT_PORT),
            login: String::new(),
            password: String::new(),
            layers: vec![1],
            bootstrap_layer: 1,
            socks5_listen: Some("127.0.0.1:1080".to_string()),
            http_listen: Some("127.0.0.1:8080".to_string()),
            whitelist: Some("whitelist.txt".to_string()),
            blacklist: Some("blacklist.txt".to_string()),
            default_route: Route::Tunnel,
            handshake_timeout_secs: crate::protocol::HANDSHAKE_TIMEOUT,
            connect_timeout_secs: crate::transport::CONNECT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.server.is_empty() {
            return Err(crate::Error::Config("[client] server address is empty".to_string()));
        }
        if self.layers.is_empty() {
            return Err(crate::Error::Config("[client] layers must not be empty".to_string()));
        }
        if self.socks5_listen.is_none() && self.http_listen.is_none() {
            return Err(crate::Error::Config(
                "[client] needs socks5_listen or http_listen".to_string(),
            ));
        }
        check_timeout("handshake_timeout_secs", self.handshake_timeout_secs)?;
        check_timeout("connect_timeout_secs", self.connect_timeout_secs)
    }

    /// Handshake deadline
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Dial timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Parameters of the shared layer catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayersConfig {
    /// Key of the XOR layer
    pub xor_key: String,
    /// Padding layer settings
    pub padding: PaddingConfig,
    /// Passphrase of the AEAD layer (layer absent when unset)
    pub aead_passphrase: Option<String>,
}

impl Default for LayersConfig {
    fn default() -> Self {
        Self {
            xor_key: "LunarVPN".to_string(),
            padding: PaddingConfig::default(),
            aead_passphrase: None,
        }
    }
}

impl LayersConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.xor_key.is_empty() {
            return Err(crate::Error::Config("[layers] xor_key must not be empty".to_string()));
        }
        if matches!(&self.aead_passphrase, Some(p) if p.is_empty()) {
            return Err(crate::Error::Config(
                "[layers] aead_passphrase must not be empty when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (full, compact, pretty)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "full".to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        match self.format.as_str() {
            "full" | "compact" | "pretty" => Ok(()),
            other => Err(crate::Error::Config(format!("Unknown log format '{}'", other))),
        }
    }
}

fn check_timeout(name: &str, secs: u64) -> Result<(), crate::Error> {
    if secs == 0 {
        return Err(crate::Error::Config(format!("{} must be positive", name)));
    }
    Ok(())
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    let mut users = HashMap::new();
    users.insert("admin".to_string(), "change-me".to_string());

    Config {
        server: Some(ServerConfig {
            users,
            ..ServerConfig::default()
        }),
        client: Some(ClientConfig {
            login: "admin".to_string(),
            password: "change-me".to_string(),
            ..ClientConfig::default()
        }),
        layers: LayersConfig::default(),
        logging: LoggingConfig::default(),
    }
}
