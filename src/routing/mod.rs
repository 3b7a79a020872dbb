//! Split-tunnel routing
//!
//! Two independent lists decide, per destination, whether a flow goes
//! through the tunnel or straight to the destination:
//!
//! - **whitelist**: destinations excluded from the tunnel (routed directly)
//! - **blacklist**: destinations always tunneled
//!
//! When both lists match, the blacklist wins. When neither matches, the
//! configured default applies (tunnel unless configured otherwise).
//! Domains are compared by name only and never resolved.

use crate::config::ClientConfig;
use crate::proxy::Address;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use tracing::info;

/// Header written into a newly created whitelist file
pub const WHITELIST_HEADER: &str = "# Place IPs line by line to exclude them from routing.\n\
# Don't enter IP addresses if you want to route all system traffic.\n\n";

/// Header written into a newly created blacklist file
pub const BLACKLIST_HEADER: &str = "# Place IPs line by line to include them to routing.\n\n";

const COMMENT_MARKERS: [&str; 2] = ["#", "//"];

/// Where a flow goes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    /// Straight to the destination
    Direct,
    /// Through the tunnel
    #[default]
    Tunnel,
}

/// A set of IPs, CIDR ranges and host names
#[derive(Debug, Clone, Default)]
pub struct RouteList {
    hosts: HashSet<String>,
    v4: Vec<Ipv4Net>,
    v6: Vec<Ipv6Net>,
}

impl RouteList {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse line-oriented text: one entry per line, blank lines and lines
    /// starting with `#` or `//` ignored
    pub fn parse(text: &str) -> crate::Result<Self> {
        let mut list = Self::new();

        for (number, line) in text.lines().enumerate() {
            let entry = line.trim();
            if entry.is_empty() || COMMENT_MARKERS.iter().any(|m| entry.starts_with(m)) {
                continue;
            }
            list.insert(entry).map_err(|e| {
                crate::Error::Config(format!("line {}: {}", number + 1, e))
            })?;
        }

        Ok(list)
    }

    /// Load a list file, creating it with `default_content` when missing
    pub fn load<P: AsRef<Path>>(path: P, default_content: &str) -> crate::Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            std::fs::write(path, default_content).map_err(|e| {
                crate::Error::Config(format!("Failed to create {}: {}", path.display(), e))
            })?;
            info!("Created {}", path.display());
        }

        let text = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::parse(&text)
            .map_err(|e| crate::Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Add one entry: an IP, a CIDR range or a host name
    pub fn insert(&mut self, entry: &str) -> Result<(), String> {
        if entry.is_empty() {
            return Err("empty entry".to_string());
        }
        if entry.chars().any(char::is_whitespace) {
            return Err(format!("invalid entry '{}'", entry));
        }

        let net = if let Ok(net) = entry.parse::<IpNet>() {
            Some(net.trunc())
        } else {
            entry.parse::<IpAddr>().ok().map(IpNet::from)
        };

        match net {
            Some(IpNet::V4(net)) => self.v4.push(net),
            Some(IpNet::V6(net)) => self.v6.push(net),
            None if entry.contains('/') => {
                return Err(format!("invalid CIDR '{}'", entry));
            }
            None => {
                self.hosts
                    .insert(entry.trim_end_matches('.').to_ascii_lowercase());
            }
        }
        Ok(())
    }

    /// Whether the destination matches any entry
    pub fn contains(&self, address: &Address) -> bool {
        match address {
            Address::Domain(host, _) => self
                .hosts
                .contains(&host.trim_end_matches('.').to_ascii_lowercase()),
            _ => address.ip().is_some_and(|ip| self.contains_ip(ip)),
        }
    }

    /// Whether an IP is inside any listed network
    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.v4.iter().any(|net| net.contains(&v4)),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => self.contains_ip(IpAddr::V4(v4)),
                None => self.v6.iter().any(|net| net.contains(&v6)),
            },
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.hosts.len() + self.v4.len() + self.v6.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-destination routing decision; immutable once built
#[derive(Debug, Clone, Default)]
pub struct RoutingPolicy {
    whitelist: RouteList,
    blacklist: RouteList,
    default_route: Route,
}

impl RoutingPolicy {
    /// Create a policy
    pub fn new(whitelist: RouteList, blacklist: RouteList, default_route: Route) -> Self {
        Self {
            whitelist,
            blacklist,
            default_route,
        }
    }

    /// Tunnel everything
    pub fn tunnel_all() -> Self {
        Self::default()
    }

    /// Load the configured list files, creating missing ones with their
    /// default header
    pub fn from_config(config: &ClientConfig) -> crate::Result<Self> {
        let whitelist = match &config.whitelist {
            Some(path) => RouteList::load(path, WHITELIST_HEADER)?,
            None => RouteList::new(),
        };
        let blacklist = match &config.blacklist {
            Some(path) => RouteList::load(path, BLACKLIST_HEADER)?,
            None => RouteList::new(),
        };
        info!(
            "Routing: {} whitelisted, {} blacklisted, default {:?}",
            whitelist.len(),
            blacklist.len(),
            config.default_route
        );

        Ok(Self::new(whitelist, blacklist, config.default_route))
    }

    /// Decide the route of a flow to `address`
    pub fn route(&self, address: &Address) -> Route {
        if self.blacklist.contains(address) {
            Route::Tunnel
        } else if self.whitelist.contains(address) {
            Route::Direct
        } else {
            self.default_route
        }
    }

    /// `true` when the flow goes through the tunnel
    pub fn should_tunnel(&self, address: &Address) -> bool {
        self.route(address) == Route::Tunnel
    }

    /// Whitelisted entries
    pub fn whitelist(&self) -> &RouteList {
        &self.whitelist
    }

    /// Blacklisted entries
    pub fn blacklist(&self) -> &RouteList {
        &self.blacklist
    }
}
