//! Client configuration

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result};
use pingtun_core::CoreConfig;
use pingtun_network::tun::Ipv4Route;
use pingtun_network::TunConfig;
use serde::{Deserialize, Serialize};

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Tunnel interface settings
    pub tunnel: TunnelSection,
    /// Profile used when a configuration has to be created
    pub profile: CoreConfig,
    /// Configuration store
    pub store: StoreSection,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Tunnel interface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSection {
    /// TUN device name
    pub name: String,
    /// Interface address
    pub address: String,
    /// Interface netmask
    pub netmask: String,
    /// Routes sent through the tunnel, in CIDR notation
    pub routes: Vec<String>,
    /// MTU
    pub mtu: u16,
}

/// Configuration store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Store file path
    pub path: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let tun = TunConfig::default();
        Self {
            tunnel: TunnelSection {
                name: tun.name,
                address: tun.address.to_string(),
                netmask: tun.netmask.to_string(),
                routes: tun
                    .included_routes
                    .iter()
                    .map(|route| format!("{}/{}", route.destination, route.prefix_len()))
                    .collect(),
                mtu: tun.mtu,
            },
            profile: CoreConfig::default(),
            store: StoreSection {
                path: "~/.pingtun/store.toml".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl ClientConfig {
    /// Load configuration from file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Load or create default configuration
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path).await
        } else {
            let config = Self::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.tun_config()?
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid tunnel settings")?;

        self.profile
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid profile")?;

        if self.store.path.trim().is_empty() {
            anyhow::bail!("Store path must not be empty");
        }

        Ok(())
    }

    /// Interface settings for the packet engine
    pub fn tun_config(&self) -> Result<TunConfig> {
        let address: Ipv4Addr = self
            .tunnel
            .address
            .parse()
            .with_context(|| format!("Invalid tunnel address {:?}", self.tunnel.address))?;
        let netmask: Ipv4Addr = self
            .tunnel
            .netmask
            .parse()
            .with_context(|| format!("Invalid tunnel netmask {:?}", self.tunnel.netmask))?;
        let included_routes = self
            .tunnel
            .routes
            .iter()
            .map(|route| parse_route(route))
            .collect::<Result<Vec<_>>>()?;

        Ok(TunConfig {
            name: self.tunnel.name.clone(),
            address,
            netmask,
            included_routes,
            mtu: self.tunnel.mtu,
        })
    }
}

/// Parse `a.b.c.d/len`
fn parse_route(route: &str) -> Result<Ipv4Route> {
    let (destination, prefix) = route
        .split_once('/')
        .with_context(|| format!("Route {:?} is not in CIDR notation", route))?;

    let destination: Ipv4Addr = destination
        .parse()
        .with_context(|| format!("Invalid route destination in {:?}", route))?;
    let prefix: u32 = prefix
        .parse()
        .with_context(|| format!("Invalid prefix length in {:?}", route))?;
    if prefix > 32 {
        anyhow::bail!("Prefix length {} in {:?} exceeds 32", prefix, route);
    }

    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    Ok(Ipv4Route::new(destination, Ipv4Addr::from(mask)))
}
